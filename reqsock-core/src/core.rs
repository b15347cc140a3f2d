//! Host-driven API: RequestCore receives peer events from the host, returns send/receive decisions.
//!
//! The host owns the connections and the clock. It reports connects, disconnects and inbound
//! envelopes; the core answers with which peer gets which envelope and which inbound message
//! is the reply. Every call is expected to come from one serialized path.

use crate::envelope::{self, EnvelopeError};
use crate::identity::PeerId;
use crate::protocol::Frame;
use crate::registry::PeerRegistry;
use crate::state::{
    DiscardReason, PeerLostPolicy, PendingRequest, RequestState, RequestStateMachine,
    StateViolation, Verdict,
};

/// Behavior switches of a requester.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Options {
    /// Allow a new send while a reply is outstanding; the old request is abandoned.
    pub relaxed: bool,
    /// Prefix each request with a request-id frame and require it on the reply.
    pub correlate: bool,
    pub on_peer_lost: PeerLostPolicy,
}

/// Envelope ready for the host to enqueue on `peer`'s connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundRequest {
    pub peer: PeerId,
    pub envelope: Vec<Frame>,
}

/// Error from a send or receive attempt on the core.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RequestError {
    #[error(transparent)]
    State(#[from] StateViolation),
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
    #[error("no connected peers")]
    NoPeers,
}

/// Main coordinator. Owns the peer ring and the request state.
pub struct RequestCore {
    options: Options,
    registry: PeerRegistry,
    state: RequestStateMachine,
}

impl RequestCore {
    pub fn new() -> Self {
        Self::with_options(Options::default())
    }

    pub fn with_options(options: Options) -> Self {
        Self {
            options,
            registry: PeerRegistry::new(),
            state: RequestStateMachine::new(
                options.relaxed,
                options.correlate,
                options.on_peer_lost,
            ),
        }
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn state(&self) -> RequestState {
        self.state.state()
    }

    pub fn has_peers(&self) -> bool {
        !self.registry.is_empty()
    }

    pub fn peer_count(&self) -> usize {
        self.registry.len()
    }

    /// Connected peers in connection order.
    pub fn peers(&self) -> Vec<PeerId> {
        self.registry.iter().collect()
    }

    /// Peer connected. Joins the end of the rotation.
    pub fn on_peer_connected(&mut self, peer: PeerId) {
        if self.registry.add(peer) {
            tracing::debug!(peer = %peer, peers = self.registry.len(), "peer connected");
        }
    }

    /// Take `peer` out of the rotation without touching the request state. A later
    /// `on_peer_disconnected` for the same peer still settles the outstanding request.
    pub fn remove_peer(&mut self, peer: PeerId) -> bool {
        let removed = self.registry.remove(&peer);
        if removed {
            tracing::debug!(peer = %peer, peers = self.registry.len(), "peer disconnected");
        }
        removed
    }

    /// Peer disconnected. Returns the outstanding request if this abandoned it.
    pub fn on_peer_disconnected(&mut self, peer: PeerId) -> Option<PendingRequest> {
        self.remove_peer(peer);
        let abandoned = self.state.on_peer_lost(peer);
        if let Some(p) = abandoned {
            tracing::debug!(peer = %peer, request_id = p.request_id, "outstanding request abandoned: peer lost");
        }
        abandoned
    }

    /// First half of a send: check the state and build the envelope. Does not pick a peer
    /// and does not change any state, so the host may wait for a peer and retry freely.
    pub fn prepare_send(&self, frames: Vec<Frame>) -> Result<Vec<Frame>, RequestError> {
        self.state.check_send()?;
        let envelope = if self.options.correlate {
            envelope::encode_correlated(self.state.upcoming_request_id(), frames)?
        } else {
            envelope::encode(frames)?
        };
        Ok(envelope)
    }

    /// Next peer in round-robin order, or `None` when nobody is connected.
    pub fn select_peer(&mut self) -> Option<PeerId> {
        self.registry.next()
    }

    /// Second half of a send: the envelope is now queued on `peer`. Moves to
    /// `AwaitingReply(peer)`; returns a request this replaced (relaxed mode only).
    pub fn commit_send(&mut self, peer: PeerId) -> Result<Option<PendingRequest>, RequestError> {
        let request_id = self.state.upcoming_request_id();
        let abandoned = self.state.on_sent(peer)?;
        if let Some(old) = abandoned {
            tracing::debug!(peer = %old.peer, request_id = old.request_id, "outstanding request replaced");
        }
        tracing::debug!(peer = %peer, request_id, "request sent");
        Ok(abandoned)
    }

    /// Whole send for hosts whose enqueue cannot fail: prepare, select, commit.
    pub fn send(&mut self, frames: Vec<Frame>) -> Result<OutboundRequest, RequestError> {
        let envelope = self.prepare_send(frames)?;
        let peer = self.select_peer().ok_or(RequestError::NoPeers)?;
        self.commit_send(peer)?;
        Ok(OutboundRequest { peer, envelope })
    }

    /// Receive is only meaningful while a reply is outstanding.
    pub fn check_receive(&self) -> Result<PendingRequest, RequestError> {
        Ok(self.state.check_receive()?)
    }

    /// Inbound envelope from `peer`. Returns the reply body when it completes the
    /// outstanding request; everything else is dropped here.
    pub fn on_message_received(&mut self, peer: PeerId, envelope: Vec<Frame>) -> Verdict {
        let verdict = self.state.on_inbound(peer, envelope);
        match &verdict {
            Verdict::Reply(body) => {
                tracing::debug!(peer = %peer, frames = body.len(), "reply accepted");
            }
            Verdict::Discard(DiscardReason::Malformed(e)) => {
                tracing::warn!(peer = %peer, error = %e, "dropping malformed reply");
            }
            Verdict::Discard(reason) => {
                tracing::debug!(peer = %peer, ?reason, "dropping message");
            }
        }
        verdict
    }
}

impl Default for RequestCore {
    fn default() -> Self {
        Self::new()
    }
}
