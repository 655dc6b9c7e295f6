//! Test utilities: in-memory discovery store and scripted membership.
//!
//! These back the crate's own tests and are exported so downstream users
//! can exercise bootstrap behavior without a real store or cluster.
//!
//! ## Failure injection
//!
//! The memory store can be told to fail upcoming operations, one scripted
//! failure per call, to exercise the retry paths:
//!
//! ```ignore
//! use cluster_bootstrap::testing::{MemoryDiscoveryClient, StoreOp};
//! use cluster_bootstrap::StoreError;
//!
//! let store = MemoryDiscoveryClient::new();
//! store.fail_next(StoreOp::Create, StoreError::transport("injected"));
//! ```

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::client::{
    LeaderEntry, RegisteredSeeds, ServiceDiscoveryClient, SetLeaderMode, StoreError, StoreResult,
};
use crate::membership::{ClusterMembership, MembershipEvent, NodeAddress, SubscriptionKind};

/// Store operation kinds, used to address failure injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    /// [`ServiceDiscoveryClient::get`]
    Get,
    /// [`ServiceDiscoveryClient::create`]
    Create,
    /// [`ServiceDiscoveryClient::delete`]
    Delete,
    /// [`ServiceDiscoveryClient::set_leader`]
    SetLeader,
}

#[derive(Debug, Clone)]
struct Lease {
    address: NodeAddress,
    expires_at: Instant,
}

#[derive(Debug, Default)]
struct StoreState {
    entries: BTreeMap<String, NodeAddress>,
    leases: HashMap<String, Lease>,
    injected: HashMap<StoreOp, VecDeque<StoreError>>,
}

/// In-memory discovery store with linearizable leader-entry semantics.
///
/// Shared between test nodes via `Arc` so concurrent coordinators race
/// on the same leader key, exactly one winning the claim.
#[derive(Debug, Default)]
pub struct MemoryDiscoveryClient {
    state: Mutex<StoreState>,
    op_count: AtomicU64,
}

impl MemoryDiscoveryClient {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the next call of `op` to fail with `error`. Multiple
    /// scripted failures for the same operation apply in order.
    pub fn fail_next(&self, op: StoreOp, error: StoreError) {
        self.state
            .lock()
            .injected
            .entry(op)
            .or_default()
            .push_back(error);
    }

    /// Snapshot of all entries currently in the store.
    pub fn entries(&self) -> BTreeMap<String, NodeAddress> {
        self.state.lock().entries.clone()
    }

    /// Addresses currently published under `seeds_path`.
    pub fn seeds(&self, seeds_path: &str) -> BTreeSet<NodeAddress> {
        let prefix = format!("{}/", seeds_path.trim_end_matches('/'));
        self.state
            .lock()
            .entries
            .iter()
            .filter(|(key, _)| key.starts_with(&prefix))
            .map(|(_, addr)| addr.clone())
            .collect()
    }

    /// Current live holder of the leader entry at `leader_path`, if any.
    pub fn leader(&self, leader_path: &str) -> Option<NodeAddress> {
        let state = self.state.lock();
        state
            .leases
            .get(leader_path)
            .filter(|lease| lease.expires_at > Instant::now())
            .map(|lease| lease.address.clone())
    }

    /// Drop the leader entry, simulating lease expiry.
    pub fn expire_leader(&self, leader_path: &str) {
        self.state.lock().leases.remove(leader_path);
    }

    /// Number of store operations served so far.
    pub fn op_count(&self) -> u64 {
        self.op_count.load(Ordering::Relaxed)
    }

    fn take_injected(&self, op: StoreOp) -> Option<StoreError> {
        self.op_count.fetch_add(1, Ordering::Relaxed);
        self.state.lock().injected.get_mut(&op)?.pop_front()
    }
}

impl ServiceDiscoveryClient for MemoryDiscoveryClient {
    async fn get(&self, path: &str) -> StoreResult<RegisteredSeeds> {
        if let Some(err) = self.take_injected(StoreOp::Get) {
            return Err(err);
        }
        let prefix = format!("{}/", path.trim_end_matches('/'));
        let state = self.state.lock();
        let nodes: RegisteredSeeds = state
            .entries
            .iter()
            .filter(|(key, _)| key.starts_with(&prefix))
            .map(|(key, addr)| (key.clone(), addr.clone()))
            .collect();
        if nodes.is_empty() && !state.entries.contains_key(path) {
            return Err(StoreError::key_not_found(format!(
                "no entries under {}",
                path
            )));
        }
        Ok(nodes)
    }

    async fn create(
        &self,
        path: &str,
        value: &NodeAddress,
        _ttl: Option<Duration>,
    ) -> StoreResult<String> {
        if let Some(err) = self.take_injected(StoreOp::Create) {
            return Err(err);
        }
        let mut state = self.state.lock();
        if state.entries.contains_key(path) {
            return Err(StoreError::rejected(format!("key already present: {}", path)));
        }
        state.entries.insert(path.to_owned(), value.clone());
        Ok(path.to_owned())
    }

    async fn delete(&self, path: &str, member: Option<&str>, recursive: bool) -> StoreResult<()> {
        if let Some(err) = self.take_injected(StoreOp::Delete) {
            return Err(err);
        }
        let mut state = self.state.lock();
        if recursive {
            let prefix = format!("{}/", path.trim_end_matches('/'));
            state.entries.retain(|key, _| !key.starts_with(&prefix) && key != path);
            return Ok(());
        }
        let key = match member {
            Some(member) => format!("{}/{}", path.trim_end_matches('/'), member),
            None => path.to_owned(),
        };
        match state.entries.remove(&key) {
            Some(_) => Ok(()),
            None => Err(StoreError::key_not_found(format!("no entry at {}", key))),
        }
    }

    async fn set_leader(
        &self,
        leader_path: &str,
        address: &NodeAddress,
        ttl: Duration,
        mode: SetLeaderMode,
    ) -> StoreResult<LeaderEntry> {
        if let Some(err) = self.take_injected(StoreOp::SetLeader) {
            return Err(err);
        }
        let mut state = self.state.lock();
        let now = Instant::now();
        let live = state
            .leases
            .get(leader_path)
            .filter(|lease| lease.expires_at > now)
            .cloned();

        match mode {
            SetLeaderMode::Claim => {
                if let Some(lease) = live {
                    if lease.address != *address {
                        return Err(StoreError::lease_held(format!(
                            "held by {}",
                            lease.address
                        )));
                    }
                }
            }
            SetLeaderMode::Refresh => match live {
                None => {
                    return Err(StoreError::key_not_found(format!(
                        "no live entry at {}",
                        leader_path
                    )))
                }
                Some(lease) if lease.address != *address => {
                    return Err(StoreError::cas_failed(format!(
                        "entry carries {}",
                        lease.address
                    )))
                }
                Some(_) => {}
            },
        }

        state.leases.insert(
            leader_path.to_owned(),
            Lease {
                address: address.clone(),
                expires_at: now + ttl,
            },
        );
        Ok(LeaderEntry {
            path: leader_path.to_owned(),
            address: address.clone(),
        })
    }
}

#[derive(Debug, Default)]
struct MembershipState {
    members: BTreeSet<NodeAddress>,
    subscriber: Option<async_channel::Sender<MembershipEvent>>,
    subscription: Option<SubscriptionKind>,
    joins: Vec<NodeAddress>,
    seed_joins: Vec<Vec<NodeAddress>>,
}

/// Scripted cluster membership layer.
///
/// Records `join`/`join_seed_nodes` calls and lets the test drive the
/// event stream by hand. A subscription immediately receives a snapshot
/// of the current member set, like a real membership layer would
/// deliver.
#[derive(Debug, Default)]
pub struct ScriptedMembership {
    state: Mutex<MembershipState>,
}

impl ScriptedMembership {
    /// Create a membership layer with no members.
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver an event to the current subscriber. Returns `false` when
    /// nobody is subscribed or the subscriber is gone.
    pub fn emit(&self, event: MembershipEvent) -> bool {
        let state = self.state.lock();
        match &state.subscriber {
            Some(tx) => tx.try_send(event).is_ok(),
            None => false,
        }
    }

    /// Addresses `join` was called with, in order.
    pub fn joins(&self) -> Vec<NodeAddress> {
        self.state.lock().joins.clone()
    }

    /// Seed lists `join_seed_nodes` was called with, in order.
    pub fn seed_joins(&self) -> Vec<Vec<NodeAddress>> {
        self.state.lock().seed_joins.clone()
    }

    /// The event slice the current subscriber asked for, if any.
    pub fn subscription(&self) -> Option<SubscriptionKind> {
        self.state.lock().subscription
    }

    /// Current member set.
    pub fn members(&self) -> BTreeSet<NodeAddress> {
        self.state.lock().members.clone()
    }
}

impl ClusterMembership for ScriptedMembership {
    fn join(&self, address: &NodeAddress) {
        let mut state = self.state.lock();
        state.members.insert(address.clone());
        state.joins.push(address.clone());
    }

    fn join_seed_nodes(&self, seeds: &[NodeAddress]) {
        self.state.lock().seed_joins.push(seeds.to_vec());
    }

    fn subscribe(&self, events: async_channel::Sender<MembershipEvent>, kind: SubscriptionKind) {
        let mut state = self.state.lock();
        let snapshot = MembershipEvent::CurrentSnapshot(state.members.clone());
        let _ = events.try_send(snapshot);
        state.subscriber = Some(events);
        state.subscription = Some(kind);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> NodeAddress {
        NodeAddress::from(s)
    }

    #[tokio::test]
    async fn test_create_is_first_writer_wins() {
        let store = MemoryDiscoveryClient::new();
        assert_eq!(
            store.create("cluster/seeds/k1", &addr("host1:1"), None).await,
            Ok("cluster/seeds/k1".to_owned())
        );
        let err = store
            .create("cluster/seeds/k1", &addr("host2:1"), None)
            .await
            .unwrap_err();
        assert!(!err.is_transport());
        assert_eq!(store.entries()["cluster/seeds/k1"], addr("host1:1"));
    }

    #[tokio::test]
    async fn test_get_missing_path_is_key_not_found() {
        let store = MemoryDiscoveryClient::new();
        let err = store.get("cluster/seeds").await.unwrap_err();
        assert_eq!(err.kind, crate::client::StoreErrorKind::KeyNotFound);
    }

    #[tokio::test]
    async fn test_get_lists_only_the_subtree() {
        let store = MemoryDiscoveryClient::new();
        store.create("cluster/seeds/k1", &addr("host1:1"), None).await.unwrap();
        store.create("cluster/other/k2", &addr("host2:1"), None).await.unwrap();

        let nodes = store.get("cluster/seeds").await.unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes["cluster/seeds/k1"], addr("host1:1"));
    }

    #[tokio::test]
    async fn test_claim_and_refresh_semantics() {
        let store = MemoryDiscoveryClient::new();
        let ttl = Duration::from_secs(10);

        // First claim wins, second claim by another address fails.
        store
            .set_leader("cluster/leader", &addr("host1:1"), ttl, SetLeaderMode::Claim)
            .await
            .unwrap();
        let err = store
            .set_leader("cluster/leader", &addr("host2:1"), ttl, SetLeaderMode::Claim)
            .await
            .unwrap_err();
        assert_eq!(err.kind, crate::client::StoreErrorKind::LeaseHeld);

        // The holder may refresh; a non-holder gets a CAS failure.
        store
            .set_leader("cluster/leader", &addr("host1:1"), ttl, SetLeaderMode::Refresh)
            .await
            .unwrap();
        let err = store
            .set_leader("cluster/leader", &addr("host2:1"), ttl, SetLeaderMode::Refresh)
            .await
            .unwrap_err();
        assert_eq!(err.kind, crate::client::StoreErrorKind::CasFailed);

        // After expiry there is nothing to refresh, but a claim works.
        store.expire_leader("cluster/leader");
        let err = store
            .set_leader("cluster/leader", &addr("host1:1"), ttl, SetLeaderMode::Refresh)
            .await
            .unwrap_err();
        assert_eq!(err.kind, crate::client::StoreErrorKind::KeyNotFound);
        store
            .set_leader("cluster/leader", &addr("host2:1"), ttl, SetLeaderMode::Claim)
            .await
            .unwrap();
        assert_eq!(store.leader("cluster/leader"), Some(addr("host2:1")));
    }

    #[tokio::test]
    async fn test_injected_failures_apply_in_order() {
        let store = MemoryDiscoveryClient::new();
        store.fail_next(StoreOp::Get, StoreError::transport("first"));
        store.fail_next(StoreOp::Get, StoreError::transport("second"));

        assert_eq!(store.get("x").await.unwrap_err().reason, "first");
        assert_eq!(store.get("x").await.unwrap_err().reason, "second");
        // Scripted failures exhausted; the real (empty) store answers.
        assert!(store.get("x").await.is_err());
    }

    #[tokio::test]
    async fn test_scripted_membership_snapshots_on_subscribe() {
        let membership = ScriptedMembership::new();
        membership.join(&addr("host1:1"));

        let (tx, rx) = async_channel::bounded(8);
        membership.subscribe(tx, SubscriptionKind::MemberEvents);

        let event = rx.recv().await.unwrap();
        assert_eq!(
            event,
            MembershipEvent::CurrentSnapshot([addr("host1:1")].into_iter().collect())
        );

        assert!(membership.emit(MembershipEvent::MemberUp(addr("host2:1"))));
        assert_eq!(
            rx.recv().await.unwrap(),
            MembershipEvent::MemberUp(addr("host2:1"))
        );
    }
}
