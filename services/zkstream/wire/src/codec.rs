//! Phase-aware packet codecs.
//!
//! The client codec turns steady-state replies back into typed responses by
//! remembering which opcode went out under each xid. The server codec is the
//! mirror image and exists so tests can run a protocol-accurate fake server.

use bytes::{Bytes, BytesMut};
use std::collections::HashMap;
use tracing::trace;

use crate::frame::{encode_frame, FrameDecoder};
use crate::header::{
    ErrorCode, OpCode, ReplyHeader, RequestHeader, XID_AUTH, XID_NOTIFICATION, XID_PING,
    XID_SET_WATCHES,
};
use crate::proto::{ConnectRequest, ConnectResponse, Request, Response, WatcherEvent};
use crate::WireError;

/// Protocol phase of one connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Waiting for the connect exchange
    Handshake,
    /// Exchanging headers and payloads
    Connected,
}

/// A correlated reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// Reply header
    pub header: ReplyHeader,
    /// Opcode of the request this answers
    pub opcode: OpCode,
    /// Decoded body; `None` when the header carries an error
    pub body: Option<Response>,
}

/// A packet received by the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// Handshake reply
    Connect(ConnectResponse),
    /// Reply to a request
    Reply(Reply),
    /// Watch notification
    Notification {
        /// Reply header (xid is always `XID_NOTIFICATION`)
        header: ReplyHeader,
        /// Notification body
        event: WatcherEvent,
    },
}

/// Client side of the protocol
#[derive(Debug)]
pub struct ClientCodec {
    phase: Phase,
    decoder: FrameDecoder,
    pending_ops: HashMap<i32, OpCode>,
}

impl ClientCodec {
    /// Create a codec in the handshake phase
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            phase: Phase::Handshake,
            decoder: FrameDecoder::with_max_frame_size(max_frame_size),
            pending_ops: HashMap::new(),
        }
    }

    /// Current phase
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Force the phase
    pub fn set_phase(&mut self, phase: Phase) {
        self.phase = phase;
    }

    /// Number of replies the codec is waiting for
    pub fn outstanding(&self) -> usize {
        self.pending_ops.len()
    }

    /// Encode the handshake request
    pub fn encode_connect(&self, request: &ConnectRequest) -> Result<Bytes, WireError> {
        if self.phase != Phase::Handshake {
            return Err(WireError::Phase("connect request"));
        }
        encode_frame(self.decoder.max_frame_size(), |buf| request.encode(buf))
    }

    /// Encode a steady-state request under `xid`.
    ///
    /// Client-assigned xids are remembered so the reply can be decoded.
    pub fn encode_request(&mut self, xid: i32, request: &Request) -> Result<Bytes, WireError> {
        if self.phase != Phase::Connected {
            return Err(WireError::Phase("request"));
        }

        let opcode = request.opcode();
        let header = RequestHeader { xid, opcode };
        let bytes = encode_frame(self.decoder.max_frame_size(), |buf| {
            header.encode(buf);
            request.encode(buf);
        })?;

        if xid > 0 {
            self.pending_ops.insert(xid, opcode);
        }
        trace!("encoded {:?} xid={} ({} bytes)", opcode, xid, bytes.len());
        Ok(bytes)
    }

    /// Whether `buf` already holds a complete packet
    pub fn has_frame(&self, buf: &BytesMut) -> Result<bool, WireError> {
        self.decoder.has_frame(buf)
    }

    /// Decode one packet from `buf`, or `None` if it is incomplete
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Inbound>, WireError> {
        let mut frame = match self.decoder.decode(buf)? {
            Some(frame) => frame,
            None => return Ok(None),
        };

        match self.phase {
            Phase::Handshake => {
                let response = ConnectResponse::decode(&mut frame)?;
                self.phase = Phase::Connected;
                Ok(Some(Inbound::Connect(response)))
            }
            Phase::Connected => self.decode_steady(&mut frame).map(Some),
        }
    }

    fn decode_steady(&mut self, frame: &mut Bytes) -> Result<Inbound, WireError> {
        let header = ReplyHeader::decode(frame)?;

        if header.xid == XID_NOTIFICATION {
            let event = WatcherEvent::decode(frame)?;
            trace!("notification {:?} on {}", event.event_type, event.path);
            return Ok(Inbound::Notification { header, event });
        }

        let opcode = match header.xid {
            XID_PING => OpCode::Ping,
            XID_SET_WATCHES => OpCode::SetWatches,
            XID_AUTH => OpCode::Auth,
            xid => self
                .pending_ops
                .remove(&xid)
                .ok_or(WireError::UnmatchedXid(xid))?,
        };

        let body = if header.err == ErrorCode::Ok {
            Some(Response::decode(opcode, frame)?)
        } else {
            None
        };

        trace!(
            "reply {:?} xid={} zxid={:x} err={}",
            opcode,
            header.xid,
            header.zxid,
            header.err.name()
        );
        Ok(Inbound::Reply(Reply {
            header,
            opcode,
            body,
        }))
    }
}

/// A packet received by the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerInbound {
    /// Handshake request
    Connect(ConnectRequest),
    /// Steady-state request
    Request {
        /// Request header
        header: RequestHeader,
        /// Request body
        request: Request,
    },
}

/// Server side of the protocol
#[derive(Debug)]
pub struct ServerCodec {
    phase: Phase,
    decoder: FrameDecoder,
}

impl ServerCodec {
    /// Create a codec in the handshake phase
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            phase: Phase::Handshake,
            decoder: FrameDecoder::with_max_frame_size(max_frame_size),
        }
    }

    /// Decode one packet from `buf`, or `None` if it is incomplete
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<ServerInbound>, WireError> {
        let mut frame = match self.decoder.decode(buf)? {
            Some(frame) => frame,
            None => return Ok(None),
        };

        match self.phase {
            Phase::Handshake => {
                let request = ConnectRequest::decode(&mut frame)?;
                self.phase = Phase::Connected;
                Ok(Some(ServerInbound::Connect(request)))
            }
            Phase::Connected => {
                let header = RequestHeader::decode(&mut frame)?;
                let request = Request::decode(header.opcode, &mut frame)?;
                Ok(Some(ServerInbound::Request { header, request }))
            }
        }
    }

    /// Encode the handshake reply
    pub fn encode_connect_response(&self, response: &ConnectResponse) -> Result<Bytes, WireError> {
        encode_frame(self.decoder.max_frame_size(), |buf| response.encode(buf))
    }

    /// Encode a reply; the body is only written for successful replies
    pub fn encode_reply(
        &self,
        header: &ReplyHeader,
        body: Option<&Response>,
    ) -> Result<Bytes, WireError> {
        encode_frame(self.decoder.max_frame_size(), |buf| {
            header.encode(buf);
            if let Some(body) = body {
                body.encode(buf);
            }
        })
    }

    /// Encode a watch notification
    pub fn encode_notification(&self, zxid: i64, event: &WatcherEvent) -> Result<Bytes, WireError> {
        let header = ReplyHeader {
            xid: XID_NOTIFICATION,
            zxid,
            err: ErrorCode::Ok,
        };
        encode_frame(self.decoder.max_frame_size(), |buf| {
            header.encode(buf);
            event.encode(buf);
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::MAX_PACKET_SIZE;
    use crate::header::{KeeperState, NotificationType};
    use crate::proto::Stat;

    fn hex(s: &str) -> BytesMut {
        let bytes: Vec<u8> = (0..s.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&s[i..i + 2], 16).unwrap())
            .collect();
        BytesMut::from(&bytes[..])
    }

    // Captured from `zkCli ls /` against a 3.4 server
    const SEND_CONNECT: &str = "0000002d000000000000000000000000000075300000000000000000000000100000000000000000000000000000000000";
    const RECV_CONNECT: &str = "0000002500000000000075300155a3a856db000000000010875f6ebf0828db9a3d07a854912bea2900";
    const SEND_LS: &str = "0000000e0000000100000008000000012f00";
    const RECV_LS: &str = "000000280000000100000000000005170000000000000002000000097a6f6f6b656570657200000003666f6f";

    #[test]
    fn test_capture_connect_request() {
        let codec = ClientCodec::new(MAX_PACKET_SIZE);
        let bytes = codec.encode_connect(&ConnectRequest::new(30000)).unwrap();
        assert_eq!(&bytes[..], &hex(SEND_CONNECT)[..]);
    }

    #[test]
    fn test_capture_session() {
        let mut codec = ClientCodec::new(MAX_PACKET_SIZE);

        let mut buf = hex(RECV_CONNECT);
        let reply = match codec.decode(&mut buf).unwrap() {
            Some(Inbound::Connect(reply)) => reply,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(reply.protocol_version, 0);
        assert_eq!(reply.timeout, 30000);
        assert_eq!(reply.session_id, 0x0155a3a856db0000);
        assert_eq!(reply.passwd.len(), 16);
        assert!(!reply.read_only);
        assert_eq!(codec.phase(), Phase::Connected);

        let request = Request::GetChildren {
            path: "/".to_string(),
            watch: false,
        };
        let sent = codec.encode_request(1, &request).unwrap();
        assert_eq!(&sent[..], &hex(SEND_LS)[..]);
        assert_eq!(codec.outstanding(), 1);

        let mut buf = hex(RECV_LS);
        let reply = match codec.decode(&mut buf).unwrap() {
            Some(Inbound::Reply(reply)) => reply,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(reply.header.xid, 1);
        assert_eq!(reply.header.zxid, 0x517);
        assert_eq!(reply.opcode, OpCode::GetChildren);
        assert_eq!(
            reply.body,
            Some(Response::GetChildren {
                children: vec!["zookeeper".to_string(), "foo".to_string()],
            })
        );
        assert_eq!(codec.outstanding(), 0);
    }

    #[test]
    fn test_nasty_server() {
        let mut codec = ClientCodec::new(MAX_PACKET_SIZE);

        let mut short = hex("4000");
        assert_eq!(codec.decode(&mut short), Ok(None));

        let mut zero = hex("000000000102");
        assert_eq!(codec.decode(&mut zero), Err(WireError::BadLength(0)));

        let mut negative = hex("fffffffe0102");
        assert_eq!(codec.decode(&mut negative), Err(WireError::BadLength(-2)));
    }

    #[test]
    fn test_phase_is_enforced() {
        let mut codec = ClientCodec::new(MAX_PACKET_SIZE);
        assert_eq!(
            codec.encode_request(1, &Request::Ping),
            Err(WireError::Phase("request"))
        );

        codec.set_phase(Phase::Connected);
        assert_eq!(
            codec.encode_connect(&ConnectRequest::new(1000)),
            Err(WireError::Phase("connect request"))
        );
    }

    #[test]
    fn test_reserved_and_unmatched_xids() {
        let server = ServerCodec::new(MAX_PACKET_SIZE);
        let mut codec = ClientCodec::new(MAX_PACKET_SIZE);
        codec.set_phase(Phase::Connected);

        codec.encode_request(XID_PING, &Request::Ping).unwrap();
        assert_eq!(codec.outstanding(), 0);

        let ping = ReplyHeader {
            xid: XID_PING,
            zxid: 7,
            err: ErrorCode::Ok,
        };
        let mut buf = BytesMut::from(&server.encode_reply(&ping, None).unwrap()[..]);
        match codec.decode(&mut buf).unwrap() {
            Some(Inbound::Reply(reply)) => {
                assert_eq!(reply.opcode, OpCode::Ping);
                assert_eq!(reply.body, Some(Response::Empty));
            }
            other => panic!("unexpected {:?}", other),
        }

        let stray = ReplyHeader {
            xid: 42,
            zxid: 7,
            err: ErrorCode::Ok,
        };
        let mut buf = BytesMut::from(&server.encode_reply(&stray, None).unwrap()[..]);
        assert_eq!(codec.decode(&mut buf), Err(WireError::UnmatchedXid(42)));
    }

    #[test]
    fn test_error_reply_has_no_body() {
        let server = ServerCodec::new(MAX_PACKET_SIZE);
        let mut codec = ClientCodec::new(MAX_PACKET_SIZE);
        codec.set_phase(Phase::Connected);

        let request = Request::GetData {
            path: "/missing".to_string(),
            watch: false,
        };
        codec.encode_request(3, &request).unwrap();

        let header = ReplyHeader {
            xid: 3,
            zxid: 9,
            err: ErrorCode::NoNode,
        };
        let mut buf = BytesMut::from(&server.encode_reply(&header, None).unwrap()[..]);
        match codec.decode(&mut buf).unwrap() {
            Some(Inbound::Reply(reply)) => {
                assert_eq!(reply.header.err, ErrorCode::NoNode);
                assert_eq!(reply.opcode, OpCode::GetData);
                assert!(reply.body.is_none());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_client_and_server_agree() {
        let mut client = ClientCodec::new(MAX_PACKET_SIZE);
        let mut server = ServerCodec::new(MAX_PACKET_SIZE);

        let mut wire = BytesMut::from(&client.encode_connect(&ConnectRequest::new(5000)).unwrap()[..]);
        match server.decode(&mut wire).unwrap() {
            Some(ServerInbound::Connect(req)) => assert_eq!(req.timeout, 5000),
            other => panic!("unexpected {:?}", other),
        }

        let accept = ConnectResponse {
            protocol_version: 0,
            timeout: 4000,
            session_id: 0x1234,
            passwd: Bytes::from_static(&[1u8; 16]),
            read_only: false,
        };
        let mut wire = BytesMut::from(&server.encode_connect_response(&accept).unwrap()[..]);
        assert_eq!(
            client.decode(&mut wire).unwrap(),
            Some(Inbound::Connect(accept))
        );

        let request = Request::GetData {
            path: "/foo".to_string(),
            watch: true,
        };
        let mut wire = BytesMut::from(&client.encode_request(5, &request).unwrap()[..]);
        match server.decode(&mut wire).unwrap() {
            Some(ServerInbound::Request { header, request: got }) => {
                assert_eq!(header.xid, 5);
                assert_eq!(got, request);
            }
            other => panic!("unexpected {:?}", other),
        }

        let event = WatcherEvent {
            event_type: NotificationType::DataChanged,
            state: KeeperState::SyncConnected,
            path: "/foo".to_string(),
        };
        let mut wire = BytesMut::from(&server.encode_notification(0x20, &event).unwrap()[..]);
        let reply_header = ReplyHeader {
            xid: 5,
            zxid: 0x20,
            err: ErrorCode::Ok,
        };
        let body = Response::GetData {
            data: Bytes::from_static(b"hi there"),
            stat: Stat::default(),
        };
        wire.extend_from_slice(&server.encode_reply(&reply_header, Some(&body)).unwrap());

        match client.decode(&mut wire).unwrap() {
            Some(Inbound::Notification { header, event: got }) => {
                assert_eq!(header.zxid, 0x20);
                assert_eq!(got, event);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(client.has_frame(&wire).unwrap());
        match client.decode(&mut wire).unwrap() {
            Some(Inbound::Reply(reply)) => assert_eq!(reply.body, Some(body)),
            other => panic!("unexpected {:?}", other),
        }
    }
}
