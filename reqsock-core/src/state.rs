//! Request state machine: `Idle` or `AwaitingReply` from exactly one peer.
//!
//! The state decides who may send and whose inbound envelopes are worth decoding. All
//! transitions happen through [`RequestStateMachine`]; nothing else writes the state.

use serde::Deserialize;

use crate::envelope::{self, EnvelopeError};
use crate::identity::PeerId;
use crate::protocol::Frame;

/// What to do with an outstanding request whose peer disconnects before replying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerLostPolicy {
    /// Abandon the request, return to `Idle` and report the loss to the pending receive.
    #[default]
    Fail,
    /// Keep awaiting a reply that can no longer arrive; only a timeout, close or a relaxed
    /// send ends the wait.
    Wait,
}

/// The one outstanding request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingRequest {
    pub peer: PeerId,
    pub request_id: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestState {
    #[default]
    Idle,
    AwaitingReply(PendingRequest),
}

/// Application misuse of the strict send/receive alternation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum StateViolation {
    #[error("cannot send: still awaiting reply from peer {0}")]
    SendWhileAwaiting(PeerId),
    #[error("cannot receive: no request outstanding")]
    ReceiveWhileIdle,
}

/// Why an inbound envelope did not complete the outstanding request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscardReason {
    /// No request outstanding, so nothing can be a reply.
    NotAwaiting,
    /// Sent by a peer other than the one the request went to.
    WrongPeer { expected: PeerId },
    /// Right peer, but the request id names an older request (correlated mode).
    StaleReply { expected: u32, got: Option<u32> },
    /// Right peer, but the envelope is not well formed.
    Malformed(EnvelopeError),
}

/// Outcome of offering an inbound envelope to the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// The reply body; the state is `Idle` again.
    Reply(Vec<Frame>),
    Discard(DiscardReason),
}

pub struct RequestStateMachine {
    state: RequestState,
    relaxed: bool,
    correlate: bool,
    on_peer_lost: PeerLostPolicy,
    /// Id the next committed request will carry.
    next_request_id: u32,
}

impl RequestStateMachine {
    pub fn new(relaxed: bool, correlate: bool, on_peer_lost: PeerLostPolicy) -> Self {
        Self {
            state: RequestState::Idle,
            relaxed,
            correlate,
            on_peer_lost,
            next_request_id: rand::random(),
        }
    }

    pub fn state(&self) -> RequestState {
        self.state
    }

    pub fn is_idle(&self) -> bool {
        self.state == RequestState::Idle
    }

    /// Id that the next committed request will carry.
    pub fn upcoming_request_id(&self) -> u32 {
        self.next_request_id
    }

    /// Sending is allowed when idle, or always in relaxed mode.
    pub fn check_send(&self) -> Result<(), StateViolation> {
        match self.state {
            RequestState::AwaitingReply(p) if !self.relaxed => {
                Err(StateViolation::SendWhileAwaiting(p.peer))
            }
            _ => Ok(()),
        }
    }

    pub fn check_receive(&self) -> Result<PendingRequest, StateViolation> {
        match self.state {
            RequestState::AwaitingReply(p) => Ok(p),
            RequestState::Idle => Err(StateViolation::ReceiveWhileIdle),
        }
    }

    /// `Idle --send(P)--> AwaitingReply(P)`. In relaxed mode a previous outstanding request
    /// is replaced and returned.
    pub fn on_sent(&mut self, peer: PeerId) -> Result<Option<PendingRequest>, StateViolation> {
        self.check_send()?;
        let pending = PendingRequest {
            peer,
            request_id: self.next_request_id,
        };
        self.next_request_id = self.next_request_id.wrapping_add(1);
        let abandoned = match std::mem::replace(&mut self.state, RequestState::AwaitingReply(pending)) {
            RequestState::AwaitingReply(old) => Some(old),
            RequestState::Idle => None,
        };
        Ok(abandoned)
    }

    /// Offer an envelope that arrived from `from`. The peer check happens before any
    /// decoding, so traffic from other peers costs nothing beyond the comparison.
    pub fn on_inbound(&mut self, from: PeerId, envelope: Vec<Frame>) -> Verdict {
        let pending = match self.state {
            RequestState::Idle => return Verdict::Discard(DiscardReason::NotAwaiting),
            RequestState::AwaitingReply(p) => p,
        };
        if from != pending.peer {
            return Verdict::Discard(DiscardReason::WrongPeer {
                expected: pending.peer,
            });
        }
        let decoded = if self.correlate {
            envelope::decode_correlated(envelope, pending.request_id)
        } else {
            envelope::decode(envelope)
        };
        match decoded {
            Ok(body) => {
                self.state = RequestState::Idle;
                Verdict::Reply(body)
            }
            Err(EnvelopeError::RequestIdMismatch { expected, got }) => {
                Verdict::Discard(DiscardReason::StaleReply { expected, got })
            }
            Err(e) => Verdict::Discard(DiscardReason::Malformed(e)),
        }
    }

    /// A peer went away. Under [`PeerLostPolicy::Fail`], losing the awaited peer abandons
    /// the request; the abandoned request is returned.
    pub fn on_peer_lost(&mut self, peer: PeerId) -> Option<PendingRequest> {
        match self.state {
            RequestState::AwaitingReply(p)
                if p.peer == peer && self.on_peer_lost == PeerLostPolicy::Fail =>
            {
                self.state = RequestState::Idle;
                Some(p)
            }
            _ => None,
        }
    }
}
