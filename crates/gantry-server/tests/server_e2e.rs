//! End-to-end tests: a real server on loopback TCP, a raw-socket client.
//!
//! The client side speaks the wire format by hand (u16 LE length prefix plus
//! the 9-byte packet header) so these tests pin the bytes, not just the
//! types.

use std::{sync::Arc, time::Duration};

use gantry_core::ConnectionLimitConfig;
use gantry_proto::{Packet, PacketHeader};
use gantry_server::{Server, ServerOptions, controllers};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};

async fn start_server(options: ServerOptions) -> (Arc<Server>, std::net::SocketAddr) {
    let packets = Arc::new(controllers::default_packet_catalog().unwrap());
    let handlers = Arc::new(controllers::default_handler_catalog().unwrap());

    let server = Arc::new(Server::bind(options, packets, handlers).await.unwrap());
    let addr = server.local_addr().unwrap();

    let runner = Arc::clone(&server);
    tokio::spawn(async move {
        runner.run().await.unwrap();
    });

    (server, addr)
}

fn options_on_loopback() -> ServerOptions {
    ServerOptions { bind_address: "127.0.0.1:0".to_string(), ..Default::default() }
}

fn frame(body: &[u8]) -> Vec<u8> {
    let total = (body.len() + 2) as u16;
    let mut out = total.to_le_bytes().to_vec();
    out.extend_from_slice(body);
    out
}

async fn read_frame(stream: &mut TcpStream) -> Vec<u8> {
    let mut prefix = [0u8; 2];
    stream.read_exact(&mut prefix).await.unwrap();
    let total = usize::from(u16::from_le_bytes(prefix));
    let mut body = vec![0u8; total - 2];
    stream.read_exact(&mut body).await.unwrap();
    body
}

#[tokio::test]
async fn echo_round_trips_the_exact_frame() {
    let (_server, addr) = start_server(options_on_loopback()).await;
    let mut client = TcpStream::connect(addr).await.unwrap();

    // Empty-payload echo packet: 2-byte prefix + 9-byte header = 11 bytes,
    // L = 11 = 0x0B. Header: magic 0x00000001, opcode 0x0100, no flags.
    let wire = [
        0x0B, 0x00, // L = 11, little endian
        0x01, 0x00, 0x00, 0x00, // magic
        0x00, 0x01, // opcode
        0x00, // flags
        0x00, // priority
        0x00, // transport
    ];
    client.write_all(&wire).await.unwrap();

    let body = read_frame(&mut client).await;
    assert_eq!(hex::encode(&body), "010000000001000000");
    assert_eq!(body, wire[2..]);
}

#[tokio::test]
async fn echo_preserves_payload_bytes() {
    let (_server, addr) = start_server(options_on_loopback()).await;
    let mut client = TcpStream::connect(addr).await.unwrap();

    let packet = Packet::new(
        controllers::SYSTEM_MAGIC,
        controllers::ECHO_OPCODE,
        &b"the quick brown fox"[..],
    );
    let body = packet.serialize().unwrap();
    client.write_all(&frame(&body)).await.unwrap();

    let reply = read_frame(&mut client).await;
    let parsed = Packet::deserialize(&reply).unwrap();
    assert_eq!(parsed, packet);
}

#[tokio::test]
async fn ping_answers_pong() {
    let (_server, addr) = start_server(options_on_loopback()).await;
    let mut client = TcpStream::connect(addr).await.unwrap();

    let packet = Packet::new(controllers::SYSTEM_MAGIC, controllers::PING_OPCODE, &b""[..]);
    client.write_all(&frame(&packet.serialize().unwrap())).await.unwrap();

    let reply = read_frame(&mut client).await;
    let parsed = Packet::deserialize(&reply).unwrap();
    assert_eq!(parsed.opcode(), controllers::PING_OPCODE);
    assert_eq!(parsed.payload().as_ref(), b"pong");
}

#[tokio::test]
async fn unknown_magic_is_discarded_but_connection_survives() {
    let (server, addr) = start_server(options_on_loopback()).await;
    let mut client = TcpStream::connect(addr).await.unwrap();

    // A frame whose magic (0xDEADBEEF) is not in the catalog.
    let bogus = Packet::new(0xDEAD_BEEF, 0x0001, &b"junk"[..]);
    client.write_all(&frame(&bogus.serialize().unwrap())).await.unwrap();

    // The next frame on the same connection still dispatches.
    let echo = Packet::new(controllers::SYSTEM_MAGIC, controllers::ECHO_OPCODE, &b"still here"[..]);
    client.write_all(&frame(&echo.serialize().unwrap())).await.unwrap();

    let reply = read_frame(&mut client).await;
    let parsed = Packet::deserialize(&reply).unwrap();
    assert_eq!(parsed.payload().as_ref(), b"still here");

    // Allow the counters to settle before asserting.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(server.snapshot().total_rejections, 1);
}

#[tokio::test]
async fn oversize_frame_closes_the_connection() {
    let mut options = options_on_loopback();
    options.channel.max_buffer_size = 4096;
    let (_server, addr) = start_server(options).await;

    let mut client = TcpStream::connect(addr).await.unwrap();

    // Announce a 5000-byte frame against a 4096-byte cap.
    client.write_all(&5000u16.to_le_bytes()).await.unwrap();

    // The server closes; the client observes EOF.
    let mut buf = [0u8; 1];
    let n = client.read(&mut buf).await.unwrap();
    assert_eq!(n, 0);
}

#[tokio::test]
async fn undersized_packet_body_is_discarded() {
    let (_server, addr) = start_server(options_on_loopback()).await;
    let mut client = TcpStream::connect(addr).await.unwrap();

    // A valid frame whose body is shorter than a packet header: the channel
    // delivers it, the dispatcher rejects it, the connection survives.
    client.write_all(&frame(&[0x01, 0x02, 0x03])).await.unwrap();

    let echo = Packet::new(controllers::SYSTEM_MAGIC, controllers::ECHO_OPCODE, &b"ok"[..]);
    client.write_all(&frame(&echo.serialize().unwrap())).await.unwrap();

    let reply = read_frame(&mut client).await;
    assert_eq!(Packet::deserialize(&reply).unwrap().payload().as_ref(), b"ok");
}

#[tokio::test]
async fn admission_cap_drops_excess_connections() {
    let mut options = options_on_loopback();
    options.connection_limits = ConnectionLimitConfig {
        max_connections_per_endpoint: 2,
        ..Default::default()
    };
    let (_server, addr) = start_server(options).await;

    let mut first = TcpStream::connect(addr).await.unwrap();
    let mut second = TcpStream::connect(addr).await.unwrap();

    // Confirm both admitted connections actually dispatch.
    for client in [&mut first, &mut second] {
        let echo = Packet::new(controllers::SYSTEM_MAGIC, controllers::ECHO_OPCODE, &b"hi"[..]);
        client.write_all(&frame(&echo.serialize().unwrap())).await.unwrap();
        let reply = read_frame(client).await;
        assert_eq!(Packet::deserialize(&reply).unwrap().payload().as_ref(), b"hi");
    }

    // The third connection from the same endpoint is dropped (clean EOF or
    // reset, depending on platform timing).
    let mut third = TcpStream::connect(addr).await.unwrap();
    let mut buf = [0u8; 1];
    let closed = matches!(third.read(&mut buf).await, Ok(0) | Err(_));
    assert!(closed, "third connection should be dropped");

    // Closing an admitted connection reopens a slot.
    drop(first);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut fourth = TcpStream::connect(addr).await.unwrap();
    let echo = Packet::new(controllers::SYSTEM_MAGIC, controllers::ECHO_OPCODE, &b"again"[..]);
    fourth.write_all(&frame(&echo.serialize().unwrap())).await.unwrap();
    let reply = read_frame(&mut fourth).await;
    assert_eq!(Packet::deserialize(&reply).unwrap().payload().as_ref(), b"again");
}

#[tokio::test]
async fn counters_track_processed_messages() {
    let (server, addr) = start_server(options_on_loopback()).await;
    let mut client = TcpStream::connect(addr).await.unwrap();

    for i in 0..3u8 {
        let echo =
            Packet::new(controllers::SYSTEM_MAGIC, controllers::ECHO_OPCODE, vec![i]);
        client.write_all(&frame(&echo.serialize().unwrap())).await.unwrap();
        let _ = read_frame(&mut client).await;
    }

    assert_eq!(server.snapshot().total_messages, 3);
    assert!(server.snapshot().is_listening);
}

#[tokio::test]
async fn shutdown_closes_connections_and_stops_accepting() {
    let (server, addr) = start_server(options_on_loopback()).await;
    let mut client = TcpStream::connect(addr).await.unwrap();

    // Make sure the connection is established server-side.
    let echo = Packet::new(controllers::SYSTEM_MAGIC, controllers::ECHO_OPCODE, &b"x"[..]);
    client.write_all(&frame(&echo.serialize().unwrap())).await.unwrap();
    let _ = read_frame(&mut client).await;

    server.shutdown_token().cancel();
    tokio::time::sleep(Duration::from_millis(100)).await;

    // The open connection is closed by the server.
    let mut buf = [0u8; 1];
    let closed = matches!(client.read(&mut buf).await, Ok(0) | Err(_));
    assert!(closed, "connection should be closed on shutdown");
}

#[tokio::test]
async fn frame_byte_order_matches_header_layout() {
    // Cross-check the client-side encoder against the proto layout so the
    // hand-written frames above stay honest.
    let packet = Packet::new(controllers::SYSTEM_MAGIC, controllers::ECHO_OPCODE, &b"z"[..]);
    let body = packet.serialize().unwrap();

    assert_eq!(body.len(), PacketHeader::SIZE + 1);
    assert_eq!(hex::encode(&body), "0100000000010000007a");

    // L = 12 = 0x0C, low byte first.
    let framed = frame(&body);
    assert_eq!(hex::encode(&framed), format!("0c00{}", hex::encode(&body)));
}
