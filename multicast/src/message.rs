//! Wire messages
//!
//! Data messages are bincode-encoded with fixed-width integers. Decoding is
//! size-limited and rejects trailing bytes so a stray datagram fails cleanly
//! instead of producing a plausible-looking message.

use std::fmt;

use bincode::Options;
use serde::{Deserialize, Serialize};

use crate::{
    clock::ProcessId,
    error::{MulticastError, MulticastResult},
};

/// Largest UDP payload over IPv4.
pub const MAX_DATAGRAM_SIZE: usize = 65_507;

// String length prefix + sender id + vector length prefix + timestamp.
const FIXED_OVERHEAD: usize = 8 + 4 + 8 + 8;

fn wire_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_limit(MAX_DATAGRAM_SIZE as u64)
        .reject_trailing_bytes()
}

/// A stamped data message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    content: String,
    sender_id: u32,
    sender_vc: Vec<u64>,
    timestamp: i64,
}

impl Message {
    /// Stamp `content` from `sender` with its post-send vector clock.
    pub fn new(content: String, sender: ProcessId, sender_vc: Vec<u64>) -> Self {
        Self {
            content,
            // Ids are ranks bounded by `max_members`, which config caps at `u32::MAX`.
            sender_id: u32::try_from(sender).unwrap_or(u32::MAX),
            sender_vc,
            timestamp: chrono::Utc::now()
                .timestamp_nanos_opt()
                .unwrap_or_default(),
        }
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn sender(&self) -> ProcessId {
        self.sender_id as ProcessId
    }

    pub fn sender_vc(&self) -> &[u64] {
        &self.sender_vc
    }

    /// Send number of this message at its sender; zero when the vector does
    /// not cover the sender.
    pub fn sequence(&self) -> u64 {
        self.sender_vc.get(self.sender()).copied().unwrap_or(0)
    }

    /// Nanoseconds since the Unix epoch at the sender.
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    /// Exact encoded size for a message with the given shape.
    pub fn encoded_len(content_len: usize, vector_len: usize) -> usize {
        FIXED_OVERHEAD + content_len + vector_len * 8
    }

    pub fn encode(&self) -> MulticastResult<Vec<u8>> {
        Ok(wire_options().serialize(self)?)
    }

    /// Decode and validate an inbound payload.
    pub fn decode(bytes: &[u8], max_members: usize) -> MulticastResult<Self> {
        let message: Message = wire_options().deserialize(bytes)?;

        if message.sender_vc.len() > max_members {
            return Err(MulticastError::Decode(format!(
                "vector clock of {} entries exceeds {} members",
                message.sender_vc.len(),
                max_members
            )));
        }
        if message.sender() >= message.sender_vc.len() {
            return Err(MulticastError::Decode(format!(
                "vector clock of {} entries does not cover sender {}",
                message.sender_vc.len(),
                message.sender_id
            )));
        }
        Ok(message)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cells: Vec<String> = self.sender_vc.iter().map(u64::to_string).collect();
        write!(
            f,
            "Msg from P{}: \"{}\" VC: [{}]",
            self.sender_id,
            self.content,
            cells.join(", ")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_returns_original_message() {
        let message = Message::new("hello".to_string(), 1, vec![2, 3, 0]);
        let bytes = message.encode().unwrap();

        let decoded = Message::decode(&bytes, 16).unwrap();
        assert_eq!(decoded, message);
        assert_eq!(decoded.sequence(), 3);
        assert!(decoded.timestamp() > 0);
    }

    #[test]
    fn test_encoded_len_is_exact() {
        let message = Message::new("héllo".to_string(), 0, vec![1, 0, 0, 0]);
        let bytes = message.encode().unwrap();
        assert_eq!(bytes.len(), Message::encoded_len("héllo".len(), 4));
    }

    #[test]
    fn test_garbage_is_rejected() {
        let err = Message::decode(b"127.0.0.1:5000", 16).unwrap_err();
        assert!(matches!(err, MulticastError::Decode(_)));

        assert!(Message::decode(&[], 16).is_err());
    }

    #[test]
    fn test_trailing_bytes_are_rejected() {
        let mut bytes = Message::new("x".to_string(), 0, vec![1])
            .encode()
            .unwrap();
        bytes.push(0);
        assert!(Message::decode(&bytes, 16).is_err());
    }

    #[test]
    fn test_vector_must_cover_sender() {
        let bytes = Message::new("x".to_string(), 3, vec![1, 1])
            .encode()
            .unwrap();
        let err = Message::decode(&bytes, 16).unwrap_err();
        assert!(err.to_string().contains("does not cover sender 3"));
    }

    #[test]
    fn test_vector_over_member_limit_is_rejected() {
        let bytes = Message::new("x".to_string(), 0, vec![1; 8])
            .encode()
            .unwrap();
        assert!(Message::decode(&bytes, 4).is_err());
        assert!(Message::decode(&bytes, 8).is_ok());
    }

    #[test]
    fn test_sequence_of_short_vector_is_zero() {
        let message = Message::new("x".to_string(), 3, vec![1, 1]);
        assert_eq!(message.sequence(), 0);
        assert_eq!(Message::new("x".to_string(), 1, Vec::new()).sequence(), 0);
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn test_sender_beyond_wire_width_saturates() {
        let message = Message::new("x".to_string(), u32::MAX as usize + 1, vec![1]);
        assert_eq!(message.sender(), u32::MAX as usize);
        assert_eq!(message.sequence(), 0);
    }

    #[test]
    fn test_display() {
        let message = Message::new("hi".to_string(), 2, vec![0, 1, 4]);
        assert_eq!(message.to_string(), "Msg from P2: \"hi\" VC: [0, 1, 4]");
    }
}
