//! Jute primitive encoding.
//!
//! ZooKeeper marshals every record with the jute binary archive: big-endian
//! integers, one-byte booleans, and `int32`-length-prefixed buffers where a
//! negative length stands for a null buffer.

use crate::WireError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Checked readers for jute primitives
pub trait JuteRead {
    /// Read a big-endian `int32`
    fn read_int(&mut self) -> Result<i32, WireError>;
    /// Read a big-endian `int64`
    fn read_long(&mut self) -> Result<i64, WireError>;
    /// Read a one-byte boolean
    fn read_bool(&mut self) -> Result<bool, WireError>;
    /// Read a length-prefixed byte buffer; null reads as empty
    fn read_buffer(&mut self) -> Result<Bytes, WireError>;
    /// Read a length-prefixed UTF-8 string; null reads as empty
    fn read_ustring(&mut self) -> Result<String, WireError>;
    /// Read a count-prefixed vector of strings
    fn read_string_vec(&mut self) -> Result<Vec<String>, WireError>;
}

fn ensure(buf: &Bytes, needed: usize) -> Result<(), WireError> {
    if buf.remaining() < needed {
        return Err(WireError::Truncated {
            needed,
            remaining: buf.remaining(),
        });
    }
    Ok(())
}

impl JuteRead for Bytes {
    fn read_int(&mut self) -> Result<i32, WireError> {
        ensure(self, 4)?;
        Ok(self.get_i32())
    }

    fn read_long(&mut self) -> Result<i64, WireError> {
        ensure(self, 8)?;
        Ok(self.get_i64())
    }

    fn read_bool(&mut self) -> Result<bool, WireError> {
        ensure(self, 1)?;
        Ok(self.get_u8() != 0)
    }

    fn read_buffer(&mut self) -> Result<Bytes, WireError> {
        let len = self.read_int()?;
        if len < 0 {
            return Ok(Bytes::new());
        }
        let len = len as usize;
        ensure(self, len)?;
        Ok(self.split_to(len))
    }

    fn read_ustring(&mut self) -> Result<String, WireError> {
        let raw = self.read_buffer()?;
        String::from_utf8(raw.to_vec()).map_err(|_| WireError::Utf8)
    }

    fn read_string_vec(&mut self) -> Result<Vec<String>, WireError> {
        let count = self.read_int()?;
        if count < 0 {
            return Ok(Vec::new());
        }
        // each entry needs at least its own length prefix
        ensure(self, count as usize * 4)?;
        (0..count).map(|_| self.read_ustring()).collect()
    }
}

/// Writers for jute primitives
pub trait JuteWrite {
    /// Write a one-byte boolean
    fn write_bool(&mut self, value: bool);
    /// Write a length-prefixed byte buffer
    fn write_buffer(&mut self, value: &[u8]);
    /// Write a length-prefixed UTF-8 string
    fn write_ustring(&mut self, value: &str);
    /// Write a count-prefixed vector of strings
    fn write_string_vec(&mut self, values: &[String]);
}

impl JuteWrite for BytesMut {
    fn write_bool(&mut self, value: bool) {
        self.put_u8(value as u8);
    }

    fn write_buffer(&mut self, value: &[u8]) {
        self.put_i32(value.len() as i32);
        self.put_slice(value);
    }

    fn write_ustring(&mut self, value: &str) {
        self.write_buffer(value.as_bytes());
    }

    fn write_string_vec(&mut self, values: &[String]) {
        self.put_i32(values.len() as i32);
        for value in values {
            self.write_ustring(value);
        }
    }
}
