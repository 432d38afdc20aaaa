//! Decode a captured `zkCli ls /` exchange with the client codec.

use bytes::BytesMut;
use zk_wire::{ClientCodec, ConnectRequest, Inbound, Request, MAX_PACKET_SIZE};

const RECV_CONNECT: &str =
    "0000002500000000000075300155a3a856db000000000010875f6ebf0828db9a3d07a854912bea2900";
const RECV_LS: &str = "000000280000000100000000000005170000000000000002000000097a6f6f6b656570657200000003666f6f";

fn hex(s: &str) -> Result<BytesMut, std::num::ParseIntError> {
    let bytes = (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16))
        .collect::<Result<Vec<u8>, _>>()?;
    Ok(BytesMut::from(&bytes[..]))
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("=== ZooKeeper Wire Protocol Example ===\n");

    let mut codec = ClientCodec::new(MAX_PACKET_SIZE);

    // 1. Handshake
    let connect = codec.encode_connect(&ConnectRequest::new(30000))?;
    println!("1. Connect request: {} bytes", connect.len());

    if let Some(Inbound::Connect(reply)) = codec.decode(&mut hex(RECV_CONNECT)?)? {
        println!("   Session id: 0x{:016x}", reply.session_id);
        println!("   Negotiated timeout: {} ms", reply.timeout);
    }

    // 2. List the root
    let request = Request::GetChildren {
        path: "/".to_string(),
        watch: false,
    };
    let sent = codec.encode_request(1, &request)?;
    println!("\n2. GET_CHILDREN / : {} bytes", sent.len());

    if let Some(Inbound::Reply(reply)) = codec.decode(&mut hex(RECV_LS)?)? {
        println!("   zxid: 0x{:x}", reply.header.zxid);
        println!("   body: {:?}", reply.body);
    }

    println!("\n=== Example completed successfully! ===");
    Ok(())
}
