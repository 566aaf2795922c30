//! Stable Multicast over UDP
//!
//! This crate provides a best-effort group messaging endpoint that tracks
//! message stability:
//! - Presence-based discovery and deterministic process ids
//! - Matrix clocks recording what every process is known to have seen
//! - Unicast fan-out of messages stamped with the sender's clock row
//! - Periodic reclamation of messages every member has received
//!
//! Delivery is eager and unordered. Stability only governs how long a
//! received message is retained.

pub mod buffer;
pub mod clock;
pub mod config;
pub mod discovery;
pub mod engine;
pub mod error;
pub mod membership;
pub mod message;
pub mod messenger;
pub mod metrics;
pub mod receiver;
pub mod stability;
pub mod state;

#[cfg(test)]
mod tests;

// Re-export commonly used types
pub use clock::{MatrixClock, ProcessId, SharedMatrixClock};
pub use config::{DiscoveryConfig, MulticastConfig, DEFAULT_DISCOVERY_PORT, DEFAULT_GROUP};
pub use engine::StableMulticast;
pub use error::{MulticastError, MulticastResult};
pub use membership::GroupMember;
pub use message::Message;
pub use messenger::{Destinations, SendReceipt};
pub use receiver::DeliveryHandler;
pub use stability::{SweepReport, Verdict};
