//! Shared engine state
//!
//! Every task works against one `GroupState`. Lock order, where more than one
//! is held at a time: membership, then buffer, then clock.

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::{
    buffer::MessageBuffer,
    clock::{MatrixClock, ProcessId, SharedMatrixClock},
    error::MulticastResult,
    membership::{GroupMember, Membership, MembershipChange},
    message::Message,
    metrics,
};

#[derive(Debug)]
pub struct GroupState {
    pub(crate) clock: SharedMatrixClock,
    pub(crate) membership: RwLock<Membership>,
    pub(crate) buffer: Mutex<MessageBuffer>,
    max_members: usize,
}

impl GroupState {
    pub fn new(local: GroupMember, max_members: usize) -> Self {
        Self {
            clock: SharedMatrixClock::new(max_members),
            membership: RwLock::new(Membership::new(local)),
            buffer: Mutex::new(MessageBuffer::new()),
            max_members,
        }
    }

    pub fn max_members(&self) -> usize {
        self.max_members
    }

    pub fn local(&self) -> GroupMember {
        self.membership.read().local()
    }

    pub fn local_id(&self) -> Option<ProcessId> {
        self.membership.read().local_id()
    }

    pub fn members(&self) -> Vec<GroupMember> {
        self.membership.read().members().to_vec()
    }

    pub fn matrix(&self) -> MatrixClock {
        self.clock.snapshot()
    }

    pub fn buffered(&self) -> Vec<Message> {
        self.buffer.lock().to_vec()
    }

    pub fn buffered_len(&self) -> usize {
        self.buffer.lock().len()
    }

    /// Fold presence observations into the group.
    ///
    /// On change the clock is grown while the membership lock is still held,
    /// so nobody can read the new id before the clock has room for it.
    pub fn apply_presence<I>(&self, observed: I) -> MulticastResult<Option<MembershipChange>>
    where
        I: IntoIterator<Item = GroupMember>,
    {
        let mut membership = self.membership.write();
        let mut next = membership.clone();
        let Some(change) = next.merge(observed) else {
            return Ok(None);
        };
        if change.size > self.max_members {
            warn!(
                "Ignoring presence: group of {} exceeds limit of {} members",
                change.size, self.max_members
            );
            return Ok(None);
        }

        if change.size > self.clock.dimension() {
            self.clock.grow(change.size)?;
        }
        *membership = next;

        info!(
            "Group members updated. My ID: {}, Members: {}",
            change.local_id,
            membership
                .members()
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        );
        metrics::record_membership_change(change.size);
        Ok(Some(change))
    }

    /// Account for and retain an inbound message.
    pub fn accept(&self, message: Message) -> MulticastResult<()> {
        let local_id = self.local_id();
        let mut buffer = self.buffer.lock();
        self.clock
            .record_receipt(local_id, message.sender(), message.sender_vc())?;

        if local_id.is_none() {
            debug!(
                "Accepted message from P{} before own id was assigned",
                message.sender()
            );
        }
        buffer.push(message);
        metrics::record_buffer_depth(buffer.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use super::*;

    fn member(addr: &str) -> GroupMember {
        GroupMember::from(addr.parse::<SocketAddr>().unwrap())
    }

    #[test]
    fn test_presence_grows_clock() {
        let state = GroupState::new(member("127.0.0.1:5001"), 16);
        assert_eq!(state.local_id(), None);
        assert_eq!(state.matrix().dimension(), 0);

        state.apply_presence(std::iter::empty()).unwrap();
        assert_eq!(state.local_id(), Some(0));
        assert_eq!(state.matrix().dimension(), 1);

        let change = state
            .apply_presence(vec![member("127.0.0.1:5000"), member("127.0.0.1:5002")])
            .unwrap()
            .unwrap();
        assert_eq!(change.local_id, 1);
        assert_eq!(state.matrix().dimension(), 3);
    }

    #[test]
    fn test_presence_beyond_limit_is_ignored() {
        let state = GroupState::new(member("127.0.0.1:5000"), 2);
        state.apply_presence(vec![member("127.0.0.1:5001")]).unwrap();

        let change = state.apply_presence(vec![member("127.0.0.1:5002")]).unwrap();
        assert!(change.is_none());
        assert_eq!(state.members().len(), 2);
        assert_eq!(state.matrix().dimension(), 2);
    }

    #[test]
    fn test_accept_buffers_and_accounts() {
        let state = GroupState::new(member("127.0.0.1:5000"), 16);
        state
            .apply_presence(vec![member("127.0.0.1:5001")])
            .unwrap();

        state
            .accept(Message::new("hi".to_string(), 1, vec![0, 1]))
            .unwrap();
        assert_eq!(state.buffered_len(), 1);
        assert_eq!(state.matrix().row(0), Some(vec![0, 1]));
        assert_eq!(state.matrix().row(1), Some(vec![0, 1]));
    }

    #[test]
    fn test_accept_before_own_id() {
        let state = GroupState::new(member("127.0.0.1:5000"), 16);
        state
            .accept(Message::new("early".to_string(), 1, vec![0, 1]))
            .unwrap();

        assert_eq!(state.buffered_len(), 1);
        assert_eq!(state.matrix().dimension(), 2);
        assert_eq!(state.matrix().row(1), Some(vec![0, 1]));
    }

    #[test]
    fn test_accept_beyond_limit_is_rejected() {
        let state = GroupState::new(member("127.0.0.1:5000"), 2);
        state.apply_presence(std::iter::empty()).unwrap();

        let result = state.accept(Message::new("x".to_string(), 2, vec![0, 0, 1]));
        assert!(result.is_err());
        assert_eq!(state.buffered_len(), 0);
    }
}
