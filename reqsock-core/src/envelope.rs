//! Envelope framer: `[empty delimiter][body...]`, optionally preceded by a request-id frame.
//!
//! Peer addressing is carried by the connection, never by envelope content.

use crate::protocol::{Frame, REQUEST_ID_LEN};

/// Why an envelope (or an outbound body) was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EnvelopeError {
    #[error("message has no body frames")]
    EmptyBody,
    #[error("malformed envelope: no body frames after delimiter")]
    MissingBody,
    #[error("malformed envelope: missing delimiter")]
    MissingDelimiter,
    #[error("malformed envelope: delimiter frame is not empty")]
    NonEmptyDelimiter,
    #[error("malformed envelope: missing request id")]
    MissingRequestId,
    #[error("request id mismatch: expected {expected}, got {got:?}")]
    RequestIdMismatch { expected: u32, got: Option<u32> },
}

impl EnvelopeError {
    /// True for defects in what a peer sent (as opposed to an empty outbound body).
    pub fn is_malformed(&self) -> bool {
        !matches!(self, EnvelopeError::EmptyBody)
    }
}

/// Wrap body frames: `[empty, frames...]`.
pub fn encode(frames: Vec<Frame>) -> Result<Vec<Frame>, EnvelopeError> {
    if frames.is_empty() {
        return Err(EnvelopeError::EmptyBody);
    }
    let mut out = Vec::with_capacity(frames.len() + 1);
    out.push(Frame::new());
    out.extend(frames);
    Ok(out)
}

/// Wrap body frames with a leading request id: `[id, empty, frames...]`.
pub fn encode_correlated(request_id: u32, frames: Vec<Frame>) -> Result<Vec<Frame>, EnvelopeError> {
    if frames.is_empty() {
        return Err(EnvelopeError::EmptyBody);
    }
    let mut out = Vec::with_capacity(frames.len() + 2);
    out.push(request_id.to_be_bytes().to_vec());
    out.push(Frame::new());
    out.extend(frames);
    Ok(out)
}

/// Strip the delimiter and return the body frames.
pub fn decode(mut envelope: Vec<Frame>) -> Result<Vec<Frame>, EnvelopeError> {
    if envelope.is_empty() {
        return Err(EnvelopeError::MissingDelimiter);
    }
    if !envelope[0].is_empty() {
        return Err(EnvelopeError::NonEmptyDelimiter);
    }
    if envelope.len() < 2 {
        return Err(EnvelopeError::MissingBody);
    }
    envelope.remove(0);
    Ok(envelope)
}

/// Check the request-id frame against `expected`, then decode the rest.
pub fn decode_correlated(mut envelope: Vec<Frame>, expected: u32) -> Result<Vec<Frame>, EnvelopeError> {
    let got = match envelope.first() {
        None => return Err(EnvelopeError::MissingRequestId),
        Some(f) => request_id_of(f),
    };
    if got != Some(expected) {
        return Err(EnvelopeError::RequestIdMismatch { expected, got });
    }
    envelope.remove(0);
    decode(envelope)
}

fn request_id_of(frame: &[u8]) -> Option<u32> {
    let bytes: [u8; REQUEST_ID_LEN] = frame.try_into().ok()?;
    Some(u32::from_be_bytes(bytes))
}
