//! End-to-end bootstrap tests against the in-memory store.
//!
//! These drive the assembled [`ClusterDiscovery`] through its real
//! shells: election, seed publication, follower fetch/join, and the
//! promotion of a follower when the membership layer elects it.

use std::sync::Arc;
use std::time::Duration;

use cluster_bootstrap::testing::{MemoryDiscoveryClient, ScriptedMembership};
use cluster_bootstrap::{
    ClusterDiscovery, DiscoveryConfig, DiscoveryState, MembershipEvent, NodeAddress,
    ServiceDiscoveryClient, SubscriptionKind,
};

mod common;
use common::{emit_when_subscribed, wait_until};

fn addr(s: &str) -> NodeAddress {
    NodeAddress::from(s)
}

fn node(
    store: &Arc<MemoryDiscoveryClient>,
    address: &NodeAddress,
) -> (Arc<ScriptedMembership>, cluster_bootstrap::DiscoveryHandle) {
    let membership = Arc::new(ScriptedMembership::new());
    let (discovery, handle) = ClusterDiscovery::new(
        Arc::clone(store),
        Arc::clone(&membership),
        address.clone(),
        DiscoveryConfig::local(),
    );
    tokio::spawn(discovery.run());
    (membership, handle)
}

#[tokio::test]
async fn test_first_node_becomes_leader_and_publishes_itself() {
    let store = Arc::new(MemoryDiscoveryClient::new());
    let self_addr = addr("proto://system@host1:5000");
    let (membership, handle) = node(&store, &self_addr);

    handle.start().await.unwrap();

    let transitions = handle.transitions();
    assert_eq!(transitions.recv().await.unwrap(), DiscoveryState::Election);
    assert_eq!(transitions.recv().await.unwrap(), DiscoveryState::Leader);

    // The leader bootstraps the cluster with itself as the first seed.
    wait_until("self join", || membership.joins() == vec![self_addr.clone()]).await;
    assert_eq!(membership.subscription(), Some(SubscriptionKind::MemberEvents));

    // The leader entry is live and the seed registry carries this node.
    assert_eq!(store.leader("cluster/leader"), Some(self_addr.clone()));
    wait_until("own seed published", || {
        store.seeds("cluster/seeds") == [self_addr.clone()].into_iter().collect()
    })
    .await;

    handle.shutdown();
}

#[tokio::test]
async fn test_leader_mirrors_membership_churn_into_the_registry() {
    let store = Arc::new(MemoryDiscoveryClient::new());
    let self_addr = addr("proto://system@host1:5000");
    let peer = addr("proto://system@host2:5000");
    let (membership, handle) = node(&store, &self_addr);

    handle.start().await.unwrap();
    wait_until("own seed published", || {
        store.seeds("cluster/seeds").contains(&self_addr)
    })
    .await;

    // A peer joins: its seed is published.
    assert!(membership.emit(MembershipEvent::MemberUp(peer.clone())));
    wait_until("peer seed published", || {
        store.seeds("cluster/seeds").contains(&peer)
    })
    .await;

    // The peer exits: its seed is withdrawn, the leader's stays.
    assert!(membership.emit(MembershipEvent::MemberExited(peer.clone())));
    wait_until("peer seed withdrawn", || {
        store.seeds("cluster/seeds") == [self_addr.clone()].into_iter().collect()
    })
    .await;

    // The trailing removal of the already-exited peer changes nothing.
    assert!(membership.emit(MembershipEvent::MemberRemoved(peer.clone())));
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(
        store.seeds("cluster/seeds"),
        [self_addr.clone()].into_iter().collect()
    );

    handle.shutdown();
}

#[tokio::test]
async fn test_second_node_follows_and_joins_the_published_seeds() {
    let store = Arc::new(MemoryDiscoveryClient::new());
    let leader_addr = addr("proto://system@host1:5000");
    let follower_addr = addr("proto://system@host2:5000");

    // A leader is already established and has published its seed.
    store
        .set_leader(
            "cluster/leader",
            &leader_addr,
            Duration::from_secs(60),
            cluster_bootstrap::SetLeaderMode::Claim,
        )
        .await
        .unwrap();
    store
        .create("cluster/seeds/k1", &leader_addr, None)
        .await
        .unwrap();

    let (membership, handle) = node(&store, &follower_addr);
    handle.start().await.unwrap();

    let transitions = handle.transitions();
    assert_eq!(transitions.recv().await.unwrap(), DiscoveryState::Election);
    assert_eq!(transitions.recv().await.unwrap(), DiscoveryState::Follower);

    // The follower fetched the registry and joined the published seeds.
    wait_until("joined seed nodes", || {
        membership.seed_joins() == vec![vec![leader_addr.clone()]]
    })
    .await;
    assert_eq!(membership.subscription(), Some(SubscriptionKind::DomainEvents));

    // Once up, the follower settles: no further role transitions.
    emit_when_subscribed(&membership, MembershipEvent::MemberUp(follower_addr.clone())).await;
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(transitions.try_recv().is_err());

    // The leader entry was never disturbed.
    assert_eq!(store.leader("cluster/leader"), Some(leader_addr.clone()));

    handle.shutdown();
}

#[tokio::test]
async fn test_follower_promoted_when_membership_elects_it() {
    let store = Arc::new(MemoryDiscoveryClient::new());
    let old_leader = addr("proto://system@host1:5000");
    let self_addr = addr("proto://system@host2:5000");

    store
        .set_leader(
            "cluster/leader",
            &old_leader,
            Duration::from_secs(60),
            cluster_bootstrap::SetLeaderMode::Claim,
        )
        .await
        .unwrap();
    store.create("cluster/seeds/k1", &old_leader, None).await.unwrap();

    let (membership, handle) = node(&store, &self_addr);
    handle.start().await.unwrap();

    let transitions = handle.transitions();
    assert_eq!(transitions.recv().await.unwrap(), DiscoveryState::Election);
    assert_eq!(transitions.recv().await.unwrap(), DiscoveryState::Follower);

    // Keep the follower settled, then hand it the leadership.
    emit_when_subscribed(&membership, MembershipEvent::MemberUp(self_addr.clone())).await;
    assert!(membership.emit(MembershipEvent::LeaderChanged(self_addr.clone())));
    assert_eq!(transitions.recv().await.unwrap(), DiscoveryState::Leader);

    // As leader it reconciles the registry to the membership it sees:
    // its own seed is published, the departed leader's is withdrawn.
    wait_until("registry reconciled", || {
        store.seeds("cluster/seeds") == [self_addr.clone()].into_iter().collect()
    })
    .await;

    handle.shutdown();
}
