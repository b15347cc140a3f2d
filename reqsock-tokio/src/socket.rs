//! Async requester socket: round-robin send, strict reply matching, timeouts and close.
//!
//! All registry and request-state changes happen inside `send`/`receive` (and their `try_`
//! variants), which take `&mut self`. Transport notifications queue up on the socket's event
//! channel and are applied there in arrival order, so selection never races a disconnect.
//!
//! While a send is in flight only connects and rotation changes take effect. Messages and
//! disconnects are held back: a send that fails hands them to the next receive untouched.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use reqsock_core::{
    Frame, PeerId, PendingRequest, RequestCore, RequestError, RequestState, StateViolation,
    Verdict,
};
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::time::Instant;

use crate::config::Config;
use crate::connection::{Connection, EnqueueError, PeerEvent, SocketHandle};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    State(#[from] StateViolation),
    #[error("request has no body frames")]
    EmptyRequest,
    #[error("operation would block")]
    WouldBlock,
    #[error("operation timed out")]
    Timeout,
    #[error("socket closed")]
    Closed,
    #[error("peer {0} disconnected before replying")]
    PeerLost(PeerId),
}

impl From<RequestError> for Error {
    fn from(e: RequestError) -> Self {
        match e {
            RequestError::State(s) => Error::State(s),
            // Outbound framing only fails on an empty body.
            RequestError::Envelope(_) => Error::EmptyRequest,
            RequestError::NoPeers => Error::WouldBlock,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Closes a socket from anywhere, waking any send or receive suspended on it.
#[derive(Clone)]
pub struct Closer {
    tx: Arc<watch::Sender<bool>>,
}

impl Closer {
    pub fn close(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.tx.borrow()
    }
}

/// What applying one transport event did to the outstanding request.
enum Applied {
    Nothing,
    Reply(Vec<Frame>),
    Lost(PendingRequest),
}

pub struct ReqSocket {
    core: RequestCore,
    connections: HashMap<PeerId, Arc<dyn Connection>>,
    events_tx: mpsc::UnboundedSender<PeerEvent>,
    events_rx: mpsc::UnboundedReceiver<PeerEvent>,
    /// Events taken off the channel by a send that did not complete, oldest first.
    backlog: VecDeque<PeerEvent>,
    inbound: Arc<Semaphore>,
    closed_tx: Arc<watch::Sender<bool>>,
    closed_rx: watch::Receiver<bool>,
    send_timeout: Option<Duration>,
    receive_timeout: Option<Duration>,
}

impl ReqSocket {
    pub fn new(config: &Config) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (closed_tx, closed_rx) = watch::channel(false);
        Self {
            core: RequestCore::with_options(config.options()),
            connections: HashMap::new(),
            events_tx,
            events_rx,
            backlog: VecDeque::new(),
            inbound: Arc::new(Semaphore::new(config.receive_hwm.max(1))),
            closed_tx: Arc::new(closed_tx),
            closed_rx,
            send_timeout: config.send_timeout(),
            receive_timeout: config.receive_timeout(),
        }
    }

    /// Entry point for transports to attach peers and deliver their traffic.
    pub fn handle(&self) -> SocketHandle {
        SocketHandle::new(self.events_tx.clone(), self.inbound.clone())
    }

    pub fn closer(&self) -> Closer {
        Closer {
            tx: self.closed_tx.clone(),
        }
    }

    /// Close the socket. Dropping it releases every connection.
    pub fn close(self) {
        self.closed_tx.send_replace(true);
    }

    pub fn state(&self) -> RequestState {
        self.core.state()
    }

    /// Peers known as of the last processed event.
    pub fn peer_count(&self) -> usize {
        self.core.peer_count()
    }

    pub fn set_send_timeout(&mut self, timeout: Option<Duration>) {
        self.send_timeout = timeout;
    }

    pub fn set_receive_timeout(&mut self, timeout: Option<Duration>) {
        self.receive_timeout = timeout;
    }

    /// Send one request to the next peer in round-robin order. Waits for a peer to connect,
    /// or for room in the peer's queue, up to the send timeout.
    pub async fn send(&mut self, frames: Vec<Frame>) -> Result<()> {
        self.ensure_open()?;
        let envelope = self.core.prepare_send(frames)?;
        let mut held = VecDeque::new();
        let sent = self.deliver_request(envelope, &mut held).await;
        self.settle_send(held, sent)
    }

    /// Send without waiting: `WouldBlock` if no peer can take the request right now.
    pub fn try_send(&mut self, frames: Vec<Frame>) -> Result<()> {
        self.ensure_open()?;
        let envelope = self.core.prepare_send(frames)?;
        let mut held = VecDeque::new();
        self.hold_pending(&mut held);
        let sent = self.offer_request(envelope, &mut held);
        self.settle_send(held, sent)
    }

    /// Wait for the reply to the outstanding request. Messages from other peers, stale and
    /// malformed replies are dropped; the receive timeout covers the whole wait.
    pub async fn receive(&mut self) -> Result<Vec<Frame>> {
        self.ensure_open()?;
        self.core.check_receive()?;
        let deadline = self.receive_timeout.map(|t| Instant::now() + t);
        loop {
            let event = self.next_event(deadline).await?;
            match self.apply(event) {
                Applied::Reply(body) => return Ok(body),
                Applied::Lost(p) => return Err(Error::PeerLost(p.peer)),
                Applied::Nothing => {}
            }
        }
    }

    /// Receive without waiting: only already-delivered traffic is considered.
    pub fn try_receive(&mut self) -> Result<Vec<Frame>> {
        self.ensure_open()?;
        self.core.check_receive()?;
        while let Some(event) = self.try_next_event() {
            match self.apply(event) {
                Applied::Reply(body) => return Ok(body),
                Applied::Lost(p) => return Err(Error::PeerLost(p.peer)),
                Applied::Nothing => {}
            }
        }
        Err(Error::WouldBlock)
    }

    fn ensure_open(&self) -> Result<()> {
        if *self.closed_rx.borrow() {
            return Err(Error::Closed);
        }
        Ok(())
    }

    /// Enqueue on the next peer that takes it, waiting for peers and queue room.
    async fn deliver_request(
        &mut self,
        mut envelope: Vec<Frame>,
        held: &mut VecDeque<PeerEvent>,
    ) -> Result<PeerId> {
        self.hold_pending(held);
        let deadline = self.send_timeout.map(|t| Instant::now() + t);
        loop {
            let Some(peer) = self.core.select_peer() else {
                let event = self.next_event(deadline).await?;
                self.hold(event, held);
                continue;
            };
            let Some(connection) = self.connections.get(&peer).cloned() else {
                self.forget_peer(peer);
                continue;
            };
            let closed = self.closed_rx.clone();
            let result = tokio::select! {
                biased;
                _ = wait_closed(closed) => return Err(Error::Closed),
                r = connection.enqueue(envelope) => r,
                _ = sleep_until(deadline) => return Err(Error::Timeout),
            };
            match result {
                Ok(()) => return Ok(peer),
                Err(EnqueueError::Full(e)) => envelope = e,
                Err(EnqueueError::Disconnected(e)) => {
                    // Vanished between selection and enqueue: retry on whoever is left.
                    envelope = e;
                    self.forget_peer(peer);
                }
            }
        }
    }

    /// One pass over the rotation with non-waiting enqueues.
    fn offer_request(&mut self, mut envelope: Vec<Frame>, held: &mut VecDeque<PeerEvent>) -> Result<PeerId> {
        self.hold_pending(held);
        for _ in 0..self.core.peer_count() {
            let Some(peer) = self.core.select_peer() else {
                break;
            };
            let Some(connection) = self.connections.get(&peer).cloned() else {
                self.forget_peer(peer);
                continue;
            };
            match connection.try_enqueue(envelope) {
                Ok(()) => return Ok(peer),
                Err(EnqueueError::Full(e)) => envelope = e,
                Err(EnqueueError::Disconnected(e)) => {
                    envelope = e;
                    self.forget_peer(peer);
                }
            }
        }
        Err(Error::WouldBlock)
    }

    /// Finish a send. Held events predate the new request, so on success they settle the
    /// request being replaced; on failure they go back in front of everything else.
    fn settle_send(&mut self, mut held: VecDeque<PeerEvent>, sent: Result<PeerId>) -> Result<()> {
        match sent {
            Ok(peer) => {
                for event in held {
                    self.apply(event);
                }
                self.core.commit_send(peer)?;
                Ok(())
            }
            Err(e) => {
                held.append(&mut self.backlog);
                self.backlog = held;
                Err(e)
            }
        }
    }

    fn hold_pending(&mut self, held: &mut VecDeque<PeerEvent>) {
        while let Some(event) = self.try_next_event() {
            self.hold(event, held);
        }
    }

    /// Send-time handling: connects take effect, disconnects only leave the rotation.
    fn hold(&mut self, event: PeerEvent, held: &mut VecDeque<PeerEvent>) {
        match event {
            PeerEvent::Connected { peer, connection } => self.add_peer(peer, connection),
            PeerEvent::Disconnected { peer } => {
                self.forget_peer(peer);
                held.push_back(PeerEvent::Disconnected { peer });
            }
            message => held.push_back(message),
        }
    }

    fn try_next_event(&mut self) -> Option<PeerEvent> {
        self.backlog
            .pop_front()
            .or_else(|| self.events_rx.try_recv().ok())
    }

    /// Next transport event, or `Closed`/`Timeout`, whichever comes first.
    async fn next_event(&mut self, deadline: Option<Instant>) -> Result<PeerEvent> {
        if let Some(event) = self.backlog.pop_front() {
            return Ok(event);
        }
        let closed = self.closed_rx.clone();
        tokio::select! {
            biased;
            _ = wait_closed(closed) => Err(Error::Closed),
            // The socket holds a sender, so the channel never runs dry for good.
            ev = self.events_rx.recv() => ev.ok_or(Error::Closed),
            _ = sleep_until(deadline) => Err(Error::Timeout),
        }
    }

    fn apply(&mut self, event: PeerEvent) -> Applied {
        match event {
            PeerEvent::Connected { peer, connection } => {
                self.add_peer(peer, connection);
                Applied::Nothing
            }
            PeerEvent::Message { peer, envelope } => {
                self.inbound.add_permits(1);
                match self.core.on_message_received(peer, envelope) {
                    Verdict::Reply(body) => Applied::Reply(body),
                    Verdict::Discard(_) => Applied::Nothing,
                }
            }
            PeerEvent::Disconnected { peer } => {
                self.connections.remove(&peer);
                match self.core.on_peer_disconnected(peer) {
                    Some(p) => Applied::Lost(p),
                    None => Applied::Nothing,
                }
            }
        }
    }

    fn add_peer(&mut self, peer: PeerId, connection: Arc<dyn Connection>) {
        self.connections.insert(peer, connection);
        self.core.on_peer_connected(peer);
    }

    /// Out of the rotation; the request state waits for the peer's disconnect event.
    fn forget_peer(&mut self, peer: PeerId) {
        self.connections.remove(&peer);
        self.core.remove_peer(peer);
    }
}

async fn wait_closed(mut rx: watch::Receiver<bool>) {
    if rx.wait_for(|closed| *closed).await.is_err() {
        std::future::pending::<()>().await;
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending::<()>().await,
    }
}
