//! REQ wire protocol: frame type and constants shared by the framer, the core and transports.

/// Current protocol version. Exchanged as a one-byte greeting by stream transports.
pub const PROTOCOL_VERSION: u8 = 1;

/// One frame of a multipart message. The unit of the envelope.
pub type Frame = Vec<u8>;

/// Size of the request-id frame prepended in correlated mode (u32, big-endian).
pub const REQUEST_ID_LEN: usize = 4;
