//! Group membership
//!
//! Members are ordered by textual address and then by port. Every process
//! sorts the same way, so once presence has propagated they all agree on
//! which rank (process id) belongs to whom without a coordinator.

use std::{
    cmp::Ordering,
    collections::BTreeSet,
    fmt,
    net::{IpAddr, SocketAddr},
};

use serde::{Deserialize, Serialize};

use crate::clock::ProcessId;

/// A reachable process endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GroupMember {
    ip: IpAddr,
    port: u16,
}

impl GroupMember {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self { ip, port }
    }

    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

impl From<SocketAddr> for GroupMember {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip(), addr.port())
    }
}

impl Ord for GroupMember {
    fn cmp(&self, other: &Self) -> Ordering {
        self.ip
            .to_string()
            .cmp(&other.ip.to_string())
            .then(self.port.cmp(&other.port))
    }
}

impl PartialOrd for GroupMember {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for GroupMember {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.socket_addr())
    }
}

/// Outcome of a membership merge that changed the group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembershipChange {
    pub previous_size: usize,
    pub size: usize,
    pub local_id: ProcessId,
    pub joined: Vec<GroupMember>,
}

/// Sorted set of known members plus the local rank.
#[derive(Debug, Clone)]
pub struct Membership {
    local: GroupMember,
    members: Vec<GroupMember>,
    local_id: Option<ProcessId>,
    epoch: u64,
}

impl Membership {
    pub fn new(local: GroupMember) -> Self {
        Self {
            local,
            members: Vec::new(),
            local_id: None,
            epoch: 0,
        }
    }

    pub fn local(&self) -> GroupMember {
        self.local
    }

    /// Local rank, `None` until the first merge.
    pub fn local_id(&self) -> Option<ProcessId> {
        self.local_id
    }

    /// Number of merges that changed the group.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn members(&self) -> &[GroupMember] {
        &self.members
    }

    /// Every known member except the local one.
    pub fn peers(&self) -> Vec<GroupMember> {
        self.members
            .iter()
            .filter(|member| **member != self.local)
            .copied()
            .collect()
    }

    pub fn id_of(&self, member: &GroupMember) -> Option<ProcessId> {
        self.members.iter().position(|m| m == member)
    }

    pub fn member(&self, id: ProcessId) -> Option<GroupMember> {
        self.members.get(id).copied()
    }

    /// Union `observed` (and self) into the group and re-rank.
    ///
    /// Members are never removed. Returns `None` when nothing changed.
    pub fn merge<I>(&mut self, observed: I) -> Option<MembershipChange>
    where
        I: IntoIterator<Item = GroupMember>,
    {
        let mut candidates: BTreeSet<GroupMember> = self.members.iter().copied().collect();
        candidates.insert(self.local);
        candidates.extend(observed);

        let sorted: Vec<GroupMember> = candidates.into_iter().collect();
        if sorted == self.members {
            return None;
        }

        let joined = sorted
            .iter()
            .filter(|m| !self.members.contains(m))
            .copied()
            .collect();
        let previous_size = self.members.len();

        self.members = sorted;
        let local_id = self.id_of(&self.local)?;
        self.local_id = Some(local_id);
        self.epoch += 1;

        Some(MembershipChange {
            previous_size,
            size: self.members.len(),
            local_id,
            joined,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(addr: &str) -> GroupMember {
        GroupMember::from(addr.parse::<SocketAddr>().unwrap())
    }

    #[test]
    fn test_order_is_textual_address_then_port() {
        let mut members = vec![
            member("10.0.0.2:5000"),
            member("10.0.0.10:5001"),
            member("10.0.0.10:5000"),
            member("127.0.0.1:80"),
        ];
        members.sort();
        assert_eq!(
            members,
            vec![
                member("10.0.0.10:5000"),
                member("10.0.0.10:5001"),
                member("10.0.0.2:5000"),
                member("127.0.0.1:80"),
            ]
        );
    }

    #[test]
    fn test_first_merge_assigns_id() {
        let mut membership = Membership::new(member("127.0.0.1:5001"));
        assert_eq!(membership.local_id(), None);

        let change = membership.merge(std::iter::empty()).unwrap();
        assert_eq!(change.local_id, 0);
        assert_eq!(change.size, 1);
        assert_eq!(membership.local_id(), Some(0));
        assert!(membership.peers().is_empty());
    }

    #[test]
    fn test_merge_reranks_and_reports_joiners() {
        let mut membership = Membership::new(member("127.0.0.1:5001"));
        membership.merge(vec![member("127.0.0.1:5002")]);
        assert_eq!(membership.local_id(), Some(0));

        let change = membership.merge(vec![member("127.0.0.1:5000")]).unwrap();
        assert_eq!(change.previous_size, 2);
        assert_eq!(change.size, 3);
        assert_eq!(change.local_id, 1);
        assert_eq!(change.joined, vec![member("127.0.0.1:5000")]);
        assert_eq!(membership.epoch(), 2);
    }

    #[test]
    fn test_unchanged_merge_returns_none() {
        let mut membership = Membership::new(member("127.0.0.1:5001"));
        membership.merge(vec![member("127.0.0.1:5002")]);
        assert!(membership.merge(vec![member("127.0.0.1:5002")]).is_none());
        assert!(membership.merge(std::iter::empty()).is_none());
        assert_eq!(membership.epoch(), 1);
    }

    #[test]
    fn test_members_are_never_removed() {
        let mut membership = Membership::new(member("127.0.0.1:5001"));
        membership.merge(vec![member("127.0.0.1:5002"), member("127.0.0.1:5003")]);
        membership.merge(vec![member("127.0.0.1:5002")]);
        assert_eq!(membership.len(), 3);
    }

    #[test]
    fn test_independent_processes_converge() {
        let addrs = ["192.168.1.20:7000", "192.168.1.3:7000", "192.168.1.20:6999"];
        let all: Vec<GroupMember> = addrs.iter().map(|a| member(a)).collect();

        let views: Vec<Membership> = all
            .iter()
            .enumerate()
            .map(|(idx, local)| {
                let mut view = Membership::new(*local);
                // Presence arrives in a different order at every process.
                let mut observed = all.clone();
                observed.rotate_left(idx);
                for m in observed {
                    view.merge(vec![m]);
                }
                view
            })
            .collect();

        for view in &views {
            assert_eq!(view.members(), views[0].members());
        }
        for (view, local) in views.iter().zip(&all) {
            assert_eq!(view.local_id(), views[0].id_of(local));
        }
        assert_eq!(views[0].member(0), Some(member("192.168.1.20:6999")));
    }
}
