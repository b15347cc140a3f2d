//! In-process pipes: a socket-side connection paired with a remote end held by the caller.
//!
//! The remote end sees raw envelopes (delimiter included) and answers with envelopes, the way a
//! replying peer on a real transport would. Dropping it disconnects the peer.

use std::sync::Arc;
use std::time::Duration;

use reqsock_core::{Frame, PeerId};
use tokio::sync::mpsc;

use crate::connection::{ChannelConnection, DeliverError, SocketHandle};

/// Remote end of an in-process pipe.
pub struct InprocPeer {
    peer: PeerId,
    handle: SocketHandle,
    inbox: mpsc::Receiver<Vec<Frame>>,
}

/// Open a pipe to the socket behind `handle`. `capacity` bounds the socket-to-peer queue.
pub fn connect(handle: &SocketHandle, capacity: usize) -> InprocPeer {
    let (tx, inbox) = mpsc::channel(capacity.max(1));
    let peer = handle.attach(Arc::new(ChannelConnection::new(tx)));
    InprocPeer {
        peer,
        handle: handle.clone(),
        inbox,
    }
}

impl InprocPeer {
    /// The ID the socket knows this pipe by.
    pub fn id(&self) -> PeerId {
        self.peer
    }

    /// Next envelope from the socket; `None` once the socket released the pipe.
    pub async fn recv(&mut self) -> Option<Vec<Frame>> {
        self.inbox.recv().await
    }

    /// Like `recv`, giving up after `timeout`.
    pub async fn recv_timeout(&mut self, timeout: Duration) -> Option<Vec<Frame>> {
        tokio::time::timeout(timeout, self.inbox.recv())
            .await
            .ok()
            .flatten()
    }

    pub fn try_recv(&mut self) -> Option<Vec<Frame>> {
        self.inbox.try_recv().ok()
    }

    /// Send an envelope to the socket. Returns false once the socket is gone, or when its
    /// inbound queue is full and the envelope was dropped.
    pub fn send(&self, envelope: Vec<Frame>) -> bool {
        self.handle.try_deliver(self.peer, envelope).is_ok()
    }

    /// Send an envelope, waiting for room in the socket's inbound queue.
    pub async fn send_wait(&self, envelope: Vec<Frame>) -> Result<(), DeliverError> {
        self.handle.deliver(self.peer, envelope).await
    }
}

impl Drop for InprocPeer {
    fn drop(&mut self) {
        self.handle.detach(self.peer);
    }
}
