//! TCP transport: one-byte version greeting, then length-prefixed multipart frames both ways.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use reqsock_core::wire::{decode_frame, encode_frame, FrameDecodeError};
use reqsock_core::{Frame, PeerId, PROTOCOL_VERSION};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::connection::{ChannelConnection, SocketHandle};

const READ_CHUNK: usize = 8 * 1024;

/// Connect to a replying peer and attach it to the socket behind `handle`.
pub async fn connect(handle: &SocketHandle, addr: SocketAddr, send_hwm: usize) -> io::Result<PeerId> {
    let mut stream = TcpStream::connect(addr).await?;
    greet(&mut stream).await?;
    let peer = spawn_connection(stream, handle.clone(), send_hwm);
    tracing::info!(%addr, peer = %peer, "connected to peer");
    Ok(peer)
}

/// Listen on `addr`; every accepted connection becomes a peer of the socket. Returns the bound
/// address and the accept task, which ends once the socket is dropped.
pub async fn bind(
    handle: SocketHandle,
    addr: SocketAddr,
    send_hwm: usize,
) -> io::Result<(SocketAddr, JoinHandle<()>)> {
    let listener = TcpListener::bind(addr).await?;
    let local = listener.local_addr()?;
    let task = tokio::spawn(async move {
        loop {
            let accepted = tokio::select! {
                _ = handle.closed() => {
                    tracing::debug!(addr = %local, "socket gone, listener stopped");
                    break;
                }
                r = listener.accept() => r,
            };
            let (mut stream, remote) = match accepted {
                Ok(x) => x,
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    break;
                }
            };
            let handle = handle.clone();
            tokio::spawn(async move {
                match greet(&mut stream).await {
                    Ok(()) => {
                        let peer = spawn_connection(stream, handle, send_hwm);
                        tracing::info!(%remote, peer = %peer, "accepted peer");
                    }
                    Err(e) => tracing::warn!(%remote, error = %e, "greeting failed"),
                }
            });
        }
    });
    Ok((local, task))
}

/// Exchange protocol versions. Both sides write first, so neither can deadlock.
pub async fn greet(stream: &mut TcpStream) -> io::Result<()> {
    stream.write_all(&[PROTOCOL_VERSION]).await?;
    stream.flush().await?;
    let mut buf = [0u8; 1];
    stream.read_exact(&mut buf).await?;
    if buf[0] != PROTOCOL_VERSION {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "unsupported protocol version",
        ));
    }
    Ok(())
}

/// Write one multipart message as a wire frame.
pub async fn write_message<W: AsyncWrite + Unpin>(writer: &mut W, frames: &[Frame]) -> io::Result<()> {
    let bytes = encode_frame(frames).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    writer.write_all(&bytes).await?;
    writer.flush().await
}

/// Read one multipart message. Bytes past the message stay in `buf` for the next call.
/// `Ok(None)` on clean end of stream.
pub async fn read_message<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut Vec<u8>,
) -> io::Result<Option<Vec<Frame>>> {
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        match decode_frame(buf) {
            Ok((frames, n)) => {
                buf.drain(..n);
                return Ok(Some(frames));
            }
            Err(FrameDecodeError::NeedMore) => {}
            Err(e) => return Err(io::Error::new(io::ErrorKind::InvalidData, e)),
        }
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

fn spawn_connection(stream: TcpStream, handle: SocketHandle, send_hwm: usize) -> PeerId {
    let (tx, mut rx) = mpsc::channel::<Vec<Frame>>(send_hwm.max(1));
    let peer = handle.attach(Arc::new(ChannelConnection::new(tx)));
    let (mut reader, mut writer) = stream.into_split();
    tokio::spawn(async move {
        while let Some(envelope) = rx.recv().await {
            if let Err(e) = write_message(&mut writer, &envelope).await {
                tracing::debug!(peer = %peer, error = %e, "write failed");
                break;
            }
        }
    });
    tokio::spawn(async move {
        let mut buf = Vec::new();
        loop {
            let read = tokio::select! {
                _ = handle.closed() => break,
                r = read_message(&mut reader, &mut buf) => r,
            };
            match read {
                Ok(Some(envelope)) => {
                    // Waits while the socket's inbound queue is full, pushing back on the peer.
                    if handle.deliver(peer, envelope).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!(peer = %peer, error = %e, "read failed");
                    break;
                }
            }
        }
        handle.detach(peer);
        tracing::info!(peer = %peer, "peer disconnected");
    });
    peer
}
