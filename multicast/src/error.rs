//! Stable multicast error types.
//!
//! Construction-time socket failures are the only fatal errors. Everything
//! else is either a send rejection the caller can retry, or a per-datagram
//! failure that the background tasks log and skip.

use thiserror::Error;

pub type MulticastResult<T> = Result<T, MulticastError>;

#[derive(Debug, Error)]
pub enum MulticastError {
    /// The data endpoint could not be opened.
    #[error("Failed to bind data endpoint {addr}: {source}")]
    Bind {
        addr: std::net::SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// The presence channel could not be opened or joined.
    #[error("Failed to join presence channel: {0}")]
    Discovery(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    /// An inbound payload could not be turned into a message.
    #[error("Malformed payload: {0}")]
    Decode(String),

    /// No process id has been assigned yet.
    #[error("Not ready: process id not yet assigned")]
    NotReady,

    /// No other member is known and no explicit destination was given.
    #[error("No peers known")]
    NoPeers,

    #[error("Transmit to {destination} failed: {source}")]
    Transmit {
        destination: std::net::SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Payload of {size} bytes exceeds datagram limit of {limit} bytes")]
    Oversize { size: usize, limit: usize },

    #[error("Matrix clock cannot shrink from {current} to {requested}")]
    ClockShrink { current: usize, requested: usize },

    #[error("Matrix clock capacity {requested} exceeds limit of {limit} members")]
    ClockLimit { requested: usize, limit: usize },

    /// The engine has been shut down.
    #[error("Stable multicast endpoint is closed")]
    Closed,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl MulticastError {
    /// Whether the caller may simply try the same operation again later.
    pub fn is_retriable(&self) -> bool {
        matches!(self, MulticastError::NotReady | MulticastError::NoPeers)
    }
}

impl From<bincode::Error> for MulticastError {
    fn from(err: bincode::Error) -> Self {
        MulticastError::Decode(err.to_string())
    }
}
