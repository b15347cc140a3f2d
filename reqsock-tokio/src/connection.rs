//! Peer connections and the single event path from transports into a socket.
//!
//! Transports never touch socket state. They post [`PeerEvent`]s through a [`SocketHandle`];
//! the socket applies them in arrival order from its own send/receive path. Inbound messages
//! not yet applied are bounded by the socket's receive high-water mark.

use std::sync::Arc;

use reqsock_core::{Frame, PeerId};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Semaphore};

/// Enqueue failed. The envelope is handed back so it can go to another peer.
#[derive(Debug, thiserror::Error)]
pub enum EnqueueError {
    #[error("peer outbound queue is full")]
    Full(Vec<Frame>),
    #[error("peer disconnected")]
    Disconnected(Vec<Frame>),
}

impl EnqueueError {
    pub fn into_envelope(self) -> Vec<Frame> {
        match self {
            EnqueueError::Full(e) | EnqueueError::Disconnected(e) => e,
        }
    }
}

/// Inbound delivery failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DeliverError {
    #[error("socket inbound queue is full")]
    Full,
    #[error("socket closed")]
    Closed,
}

/// Outbound half of one peer connection: ordered, reliable, message-oriented.
///
/// This trait is object-safe (`Arc<dyn Connection>`).
#[async_trait::async_trait]
pub trait Connection: Send + Sync + 'static {
    /// Queue an envelope, waiting while the queue is full. Only fails with `Disconnected`.
    async fn enqueue(&self, envelope: Vec<Frame>) -> Result<(), EnqueueError>;

    /// Queue an envelope without waiting.
    fn try_enqueue(&self, envelope: Vec<Frame>) -> Result<(), EnqueueError>;
}

/// Connection backed by a bounded channel; a transport task (or an in-process peer) drains it.
pub struct ChannelConnection {
    tx: mpsc::Sender<Vec<Frame>>,
}

impl ChannelConnection {
    pub fn new(tx: mpsc::Sender<Vec<Frame>>) -> Self {
        Self { tx }
    }
}

#[async_trait::async_trait]
impl Connection for ChannelConnection {
    async fn enqueue(&self, envelope: Vec<Frame>) -> Result<(), EnqueueError> {
        self.tx
            .send(envelope)
            .await
            .map_err(|e| EnqueueError::Disconnected(e.0))
    }

    fn try_enqueue(&self, envelope: Vec<Frame>) -> Result<(), EnqueueError> {
        self.tx.try_send(envelope).map_err(|e| match e {
            TrySendError::Full(v) => EnqueueError::Full(v),
            TrySendError::Closed(v) => EnqueueError::Disconnected(v),
        })
    }
}

/// Lifecycle and traffic notifications posted by transports.
pub enum PeerEvent {
    Connected {
        peer: PeerId,
        connection: Arc<dyn Connection>,
    },
    Message {
        peer: PeerId,
        envelope: Vec<Frame>,
    },
    Disconnected {
        peer: PeerId,
    },
}

/// Cloneable entry point that transports use to feed one socket.
#[derive(Clone)]
pub struct SocketHandle {
    events: mpsc::UnboundedSender<PeerEvent>,
    inbound: Arc<Semaphore>,
}

impl SocketHandle {
    /// `inbound` holds one permit per message the socket will queue; the socket returns a
    /// permit each time it applies a message.
    pub(crate) fn new(events: mpsc::UnboundedSender<PeerEvent>, inbound: Arc<Semaphore>) -> Self {
        Self { events, inbound }
    }

    /// Register a new peer connection. It joins the end of the round-robin order.
    pub fn attach(&self, connection: Arc<dyn Connection>) -> PeerId {
        let peer = PeerId::random();
        let _ = self.events.send(PeerEvent::Connected { peer, connection });
        peer
    }

    /// Hand over an inbound envelope, waiting while the socket's inbound queue is full.
    pub async fn deliver(&self, peer: PeerId, envelope: Vec<Frame>) -> Result<(), DeliverError> {
        let permit = tokio::select! {
            _ = self.events.closed() => return Err(DeliverError::Closed),
            p = self.inbound.acquire() => p.map_err(|_| DeliverError::Closed)?,
        };
        permit.forget();
        self.post(peer, envelope)
    }

    /// Hand over an inbound envelope without waiting. A full queue drops it.
    pub fn try_deliver(&self, peer: PeerId, envelope: Vec<Frame>) -> Result<(), DeliverError> {
        if self.events.is_closed() {
            return Err(DeliverError::Closed);
        }
        let permit = self.inbound.try_acquire().map_err(|_| DeliverError::Full)?;
        permit.forget();
        self.post(peer, envelope)
    }

    fn post(&self, peer: PeerId, envelope: Vec<Frame>) -> Result<(), DeliverError> {
        self.events
            .send(PeerEvent::Message { peer, envelope })
            .map_err(|_| DeliverError::Closed)
    }

    /// The peer's connection is gone.
    pub fn detach(&self, peer: PeerId) {
        let _ = self.events.send(PeerEvent::Disconnected { peer });
    }

    /// True once the socket has been dropped.
    pub fn is_closed(&self) -> bool {
        self.events.is_closed()
    }

    /// Resolves once the socket has been dropped.
    pub async fn closed(&self) {
        self.events.closed().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn channel_connection_reports_full_and_disconnected() {
        let (tx, mut rx) = mpsc::channel(1);
        let conn = ChannelConnection::new(tx);
        conn.try_enqueue(vec![b"a".to_vec()]).unwrap();
        let err = conn.try_enqueue(vec![b"b".to_vec()]).unwrap_err();
        assert!(matches!(err, EnqueueError::Full(_)));
        assert_eq!(err.into_envelope(), vec![b"b".to_vec()]);
        assert_eq!(rx.recv().await, Some(vec![b"a".to_vec()]));
        drop(rx);
        let err = conn.enqueue(vec![b"c".to_vec()]).await.unwrap_err();
        assert!(matches!(err, EnqueueError::Disconnected(_)));
    }

    #[test]
    fn handle_events_arrive_in_order() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = SocketHandle::new(tx, Arc::new(Semaphore::new(4)));
        let (ctx, _crx) = mpsc::channel(1);
        let peer = handle.attach(Arc::new(ChannelConnection::new(ctx)));
        handle.try_deliver(peer, vec![vec![], b"x".to_vec()]).unwrap();
        handle.detach(peer);
        assert!(matches!(rx.try_recv(), Ok(PeerEvent::Connected { peer: p, .. }) if p == peer));
        assert!(matches!(rx.try_recv(), Ok(PeerEvent::Message { peer: p, .. }) if p == peer));
        assert!(matches!(rx.try_recv(), Ok(PeerEvent::Disconnected { peer: p }) if p == peer));
        drop(rx);
        assert!(handle.is_closed());
        assert_eq!(handle.try_deliver(peer, vec![]), Err(DeliverError::Closed));
    }

    #[tokio::test(start_paused = true)]
    async fn full_inbound_queue_holds_back_delivery() {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = SocketHandle::new(tx, Arc::new(Semaphore::new(1)));
        let peer = PeerId::random();
        handle.deliver(peer, vec![b"a".to_vec()]).await.unwrap();
        assert_eq!(
            handle.try_deliver(peer, vec![b"b".to_vec()]),
            Err(DeliverError::Full)
        );
        let waiting = tokio::time::timeout(
            std::time::Duration::from_millis(10),
            handle.deliver(peer, vec![b"b".to_vec()]),
        )
        .await;
        assert!(waiting.is_err());

        drop(rx);
        handle.closed().await;
        assert_eq!(
            handle.deliver(peer, vec![b"c".to_vec()]).await,
            Err(DeliverError::Closed)
        );
    }
}
