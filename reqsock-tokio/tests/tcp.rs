use std::net::SocketAddr;
use std::time::Duration;

use reqsock_core::Frame;
use reqsock_tokio::{tcp, Config, Error, ReqSocket};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

fn frames(parts: &[&str]) -> Vec<Frame> {
    parts.iter().map(|p| p.as_bytes().to_vec()).collect()
}

fn loopback() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

#[tokio::test]
async fn request_over_connected_tcp_peer() {
    let listener = TcpListener::bind(loopback()).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        tcp::greet(&mut stream).await.unwrap();
        let mut buf = Vec::new();
        let request = tcp::read_message(&mut stream, &mut buf).await.unwrap().unwrap();
        assert_eq!(request, frames(&["", "ping"]));
        tcp::write_message(&mut stream, &frames(&["", "pong"])).await.unwrap();
        // Hold the connection until the requester hangs up.
        assert!(tcp::read_message(&mut stream, &mut buf).await.unwrap().is_none());
    });

    let mut socket = ReqSocket::new(&Config::default());
    tcp::connect(&socket.handle(), addr, 16).await.unwrap();
    socket.send(frames(&["ping"])).await.unwrap();
    assert_eq!(socket.receive().await.unwrap(), frames(&["pong"]));
    drop(socket);
    server.await.unwrap();
}

#[tokio::test]
async fn bound_socket_accepts_replying_peers() {
    let mut socket = ReqSocket::new(&Config::default());
    let (addr, accept) = tcp::bind(socket.handle(), loopback(), 16).await.unwrap();

    let mut client = TcpStream::connect(addr).await.unwrap();
    tcp::greet(&mut client).await.unwrap();

    socket.send(frames(&["hello"])).await.unwrap();
    let mut buf = Vec::new();
    let request = tcp::read_message(&mut client, &mut buf).await.unwrap().unwrap();
    assert_eq!(request, frames(&["", "hello"]));
    tcp::write_message(&mut client, &frames(&["", "world"])).await.unwrap();
    assert_eq!(socket.receive().await.unwrap(), frames(&["world"]));
    accept.abort();
}

#[tokio::test]
async fn version_mismatch_is_refused() {
    let socket = ReqSocket::new(&Config::default());
    let (addr, accept) = tcp::bind(socket.handle(), loopback(), 16).await.unwrap();

    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(&[0xff]).await.unwrap();
    let mut version = [0u8; 1];
    client.read_exact(&mut version).await.unwrap();
    assert_eq!(version[0], reqsock_core::PROTOCOL_VERSION);
    let mut rest = Vec::new();
    // The listener drops the stream after a bad greeting.
    let n = client.read_to_end(&mut rest).await.unwrap_or(0);
    assert_eq!(n, 0);
    accept.abort();
}

#[tokio::test]
async fn tcp_peer_hanging_up_fails_the_request() {
    let listener = TcpListener::bind(loopback()).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        tcp::greet(&mut stream).await.unwrap();
        let mut buf = Vec::new();
        tcp::read_message(&mut stream, &mut buf).await.unwrap().unwrap();
    });

    let mut socket = ReqSocket::new(&Config::default());
    let peer = tcp::connect(&socket.handle(), addr, 16).await.unwrap();
    socket.send(frames(&["ABC"])).await.unwrap();
    server.await.unwrap();
    assert_eq!(socket.receive().await, Err(Error::PeerLost(peer)));
}

#[tokio::test]
async fn listener_stops_when_socket_is_dropped() {
    let socket = ReqSocket::new(&Config::default());
    let (addr, accept) = tcp::bind(socket.handle(), loopback(), 16).await.unwrap();
    drop(socket);

    tokio::time::timeout(Duration::from_secs(5), accept)
        .await
        .expect("accept task still running")
        .unwrap();
    assert!(TcpStream::connect(addr).await.is_err());
}
