//! Length-prefixed packet framing.
//!
//! Every ZooKeeper packet travels as a big-endian `int32` length followed by
//! exactly that many payload bytes. The decoder rejects non-positive lengths and
//! lengths above the configured ceiling; there is no attempt at resynchronising
//! a stream once a bad prefix has been seen.

use crate::WireError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Maximum packet size (16 MiB, the server's default `jute.maxbuffer` ceiling)
pub const MAX_PACKET_SIZE: usize = 16 * 1024 * 1024;

/// Size of the length prefix
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Frame decoder for splitting a byte stream into packets
#[derive(Debug, Clone)]
pub struct FrameDecoder {
    max_frame_size: usize,
}

impl FrameDecoder {
    /// Create a new frame decoder with the default ceiling
    pub fn new() -> Self {
        Self::with_max_frame_size(MAX_PACKET_SIZE)
    }

    /// Create a frame decoder with a custom ceiling
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    /// The largest payload this decoder accepts
    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Decode one packet payload from a buffer.
    ///
    /// Returns `Ok(None)` while the buffer holds less than one complete packet.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Bytes>, WireError> {
        let frame_len = match self.peek_len(buf)? {
            Some(len) => len,
            None => return Ok(None),
        };

        if buf.len() < LENGTH_PREFIX_SIZE + frame_len {
            return Ok(None);
        }

        buf.advance(LENGTH_PREFIX_SIZE);
        Ok(Some(buf.split_to(frame_len).freeze()))
    }

    /// Whether the buffer already holds one complete packet
    pub fn has_frame(&self, buf: &BytesMut) -> Result<bool, WireError> {
        Ok(match self.peek_len(buf)? {
            Some(len) => buf.len() >= LENGTH_PREFIX_SIZE + len,
            None => false,
        })
    }

    fn peek_len(&self, buf: &BytesMut) -> Result<Option<usize>, WireError> {
        if buf.len() < LENGTH_PREFIX_SIZE {
            return Ok(None);
        }

        let frame_len = i32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        if frame_len <= 0 || frame_len as usize > self.max_frame_size {
            return Err(WireError::BadLength(frame_len as i64));
        }

        Ok(Some(frame_len as usize))
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Encode one packet, letting `body` write the payload after the length prefix
pub fn encode_frame<F>(max_frame_size: usize, body: F) -> Result<Bytes, WireError>
where
    F: FnOnce(&mut BytesMut),
{
    let mut buf = BytesMut::with_capacity(64);
    buf.put_i32(0);
    body(&mut buf);

    let frame_len = buf.len() - LENGTH_PREFIX_SIZE;
    if frame_len > max_frame_size {
        return Err(WireError::Size(frame_len));
    }

    buf[..LENGTH_PREFIX_SIZE].copy_from_slice(&(frame_len as i32).to_be_bytes());
    Ok(buf.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prefixed(len: i32, body: &[u8]) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.put_i32(len);
        buf.put_slice(body);
        buf
    }

    #[test]
    fn test_partial_then_complete() {
        let mut decoder = FrameDecoder::new();
        let mut buf = prefixed(5, b"hel");

        assert!(decoder.decode(&mut buf).unwrap().is_none());
        assert!(!decoder.has_frame(&buf).unwrap());

        buf.put_slice(b"lo");
        assert!(decoder.has_frame(&buf).unwrap());
        let frame = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&frame[..], b"hello");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_length_at_ceiling_is_accepted() {
        let mut decoder = FrameDecoder::with_max_frame_size(8);
        let mut buf = prefixed(8, &[7u8; 8]);

        let frame = decoder.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.len(), 8);
    }

    #[test]
    fn test_length_over_ceiling_is_fatal() {
        let mut decoder = FrameDecoder::with_max_frame_size(8);
        let mut buf = prefixed(9, &[7u8; 9]);

        assert_eq!(decoder.decode(&mut buf), Err(WireError::BadLength(9)));
    }

    #[test]
    fn test_default_ceiling_boundary() {
        let mut decoder = FrameDecoder::new();

        let mut over = prefixed(MAX_PACKET_SIZE as i32 + 1, &[]);
        assert!(decoder.decode(&mut over).is_err());

        // the prefix alone is enough to accept the length
        let mut exact = prefixed(MAX_PACKET_SIZE as i32, &[]);
        assert_eq!(decoder.decode(&mut exact), Ok(None));
    }

    #[test]
    fn test_zero_and_negative_lengths_are_fatal() {
        let mut decoder = FrameDecoder::new();

        let mut zero = BytesMut::from(&[0x00, 0x00, 0x00, 0x00, 0x01, 0x02][..]);
        assert_eq!(decoder.decode(&mut zero), Err(WireError::BadLength(0)));

        let mut negative = BytesMut::from(&[0xff, 0xff, 0xff, 0xfe, 0x01, 0x02][..]);
        assert_eq!(decoder.decode(&mut negative), Err(WireError::BadLength(-2)));
        assert!(decoder.has_frame(&negative).is_err());
    }

    #[test]
    fn test_encode_frame_writes_prefix() {
        let bytes = encode_frame(MAX_PACKET_SIZE, |buf| buf.put_slice(b"abc")).unwrap();
        assert_eq!(&bytes[..], &[0, 0, 0, 3, b'a', b'b', b'c']);

        let err = encode_frame(2, |buf| buf.put_slice(b"abc")).unwrap_err();
        assert_eq!(err, WireError::Size(3));
    }
}
