//! Strict request-reply (REQ) socket engine.
//! Host-driven: no I/O; host passes peer events and receives send/receive decisions.

pub mod identity;
pub mod protocol;
pub mod envelope;
pub mod wire;
pub mod registry;
pub mod state;
pub mod core;
pub mod ffi;

pub use identity::PeerId;
pub use protocol::{Frame, PROTOCOL_VERSION};
pub use envelope::EnvelopeError;
pub use wire::{decode_frame, encode_frame, FrameDecodeError, FrameEncodeError};
pub use registry::PeerRegistry;
pub use state::{DiscardReason, PeerLostPolicy, PendingRequest, RequestState, StateViolation, Verdict};
pub use crate::core::{Options, OutboundRequest, RequestCore, RequestError};
