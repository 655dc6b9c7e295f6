//! Cluster membership capability.
//!
//! The bootstrap machinery does not talk to other cluster members itself;
//! it observes the membership layer (gossip, SWIM, or similar) through the
//! [`ClusterMembership`] trait and reacts to the event stream it produces.

use std::collections::BTreeSet;
use std::fmt;

/// Transport address of a cluster member.
///
/// The address is opaque to the bootstrap machinery: it is compared,
/// ordered, published to the seed registry as a value, and handed back to
/// the membership layer when joining, but never parsed.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct NodeAddress(String);

impl NodeAddress {
    /// Create an address from any string-like value.
    pub fn new(addr: impl Into<String>) -> Self {
        Self(addr.into())
    }

    /// View the address as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeAddress {
    fn from(addr: &str) -> Self {
        Self(addr.to_owned())
    }
}

impl From<String> for NodeAddress {
    fn from(addr: String) -> Self {
        Self(addr)
    }
}

/// Events emitted by the cluster membership layer.
///
/// Events are delivered at most once per occurrence, in emission order, to
/// the single subscriber handle registered via
/// [`ClusterMembership::subscribe`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipEvent {
    /// Full snapshot of the members currently up, delivered once when a
    /// subscription starts.
    CurrentSnapshot(BTreeSet<NodeAddress>),
    /// A member finished joining and is now up.
    MemberUp(NodeAddress),
    /// A member left gracefully.
    MemberExited(NodeAddress),
    /// A member was removed from the cluster (graceful or not).
    MemberRemoved(NodeAddress),
    /// The membership layer elected a new leader among the live members.
    LeaderChanged(NodeAddress),
}

/// Which slice of the membership event stream a subscriber wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionKind {
    /// Member lifecycle only: snapshot, up, exited, removed.
    MemberEvents,
    /// The full domain stream: member lifecycle plus leadership changes.
    DomainEvents,
}

/// Capability trait for the cluster membership/gossip layer.
///
/// `join` and `join_seed_nodes` declare intent to the local membership
/// layer; their outcome is reported asynchronously through the event
/// stream (a successful join eventually surfaces as a
/// [`MembershipEvent::MemberUp`] for the joining address), so the methods
/// themselves are synchronous and infallible.
pub trait ClusterMembership: Send + Sync + 'static {
    /// Join the cluster using `address` (this node) as the only seed,
    /// bootstrapping a fresh cluster.
    fn join(&self, address: &NodeAddress);

    /// Join an existing cluster through the given seed addresses.
    fn join_seed_nodes(&self, seeds: &[NodeAddress]);

    /// Register `events` as the subscriber handle for the selected slice
    /// of the event stream. A new subscription replaces the previous one
    /// and starts with a [`MembershipEvent::CurrentSnapshot`].
    fn subscribe(&self, events: async_channel::Sender<MembershipEvent>, kind: SubscriptionKind);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_display_roundtrip() {
        let addr = NodeAddress::new("proto://system@host1:5000");
        assert_eq!(addr.to_string(), "proto://system@host1:5000");
        assert_eq!(addr.as_str(), "proto://system@host1:5000");
    }

    #[test]
    fn test_address_ordering() {
        let a = NodeAddress::from("host-a:1");
        let b = NodeAddress::from("host-b:1");
        assert!(a < b);

        let set: BTreeSet<NodeAddress> = [b.clone(), a.clone()].into_iter().collect();
        assert_eq!(set.iter().next(), Some(&a));
    }

    #[test]
    fn test_event_equality() {
        let up = MembershipEvent::MemberUp(NodeAddress::from("host:1"));
        assert_eq!(up, MembershipEvent::MemberUp(NodeAddress::from("host:1")));
        assert_ne!(up, MembershipEvent::MemberExited(NodeAddress::from("host:1")));
    }
}
