//! Tokio runtime for the requester socket: async send/receive, in-process pipes and TCP.

pub mod config;
pub mod connection;
pub mod inproc;
pub mod socket;
pub mod tcp;

pub use config::Config;
pub use connection::{
    ChannelConnection, Connection, DeliverError, EnqueueError, PeerEvent, SocketHandle,
};
pub use socket::{Closer, Error, ReqSocket};
