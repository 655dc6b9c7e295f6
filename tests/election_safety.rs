//! Election safety: nodes racing on one store never both lead.

use std::sync::Arc;
use std::time::Duration;

use cluster_bootstrap::testing::{MemoryDiscoveryClient, ScriptedMembership};
use cluster_bootstrap::{ClusterDiscovery, DiscoveryConfig, DiscoveryState, NodeAddress};

mod common;
use common::wait_until;

#[tokio::test]
async fn test_concurrent_bids_elect_exactly_one_leader() {
    let store = Arc::new(MemoryDiscoveryClient::new());
    let addrs: Vec<NodeAddress> = (1..=3)
        .map(|n| NodeAddress::from(format!("proto://system@host{}:5000", n)))
        .collect();

    let mut handles = Vec::new();
    for address in &addrs {
        let membership = Arc::new(ScriptedMembership::new());
        let (discovery, handle) = ClusterDiscovery::new(
            Arc::clone(&store),
            membership,
            address.clone(),
            DiscoveryConfig::local(),
        );
        tokio::spawn(discovery.run());
        handles.push(handle);
    }

    // Fire all bids at once.
    for handle in &handles {
        handle.start().await.unwrap();
    }

    // The store settles on exactly one leader...
    wait_until("a leader entry appears", || {
        store.leader("cluster/leader").is_some()
    })
    .await;
    let leader = store.leader("cluster/leader").unwrap();
    assert!(addrs.contains(&leader));

    // ...and only the node holding the entry ever reports the leader
    // role. Watch every node's transitions for a while: losers may cycle
    // between follower and election, but must never reach leader as long
    // as the winner keeps its lease alive.
    let mut leaders = Vec::new();
    for (address, handle) in addrs.iter().zip(&handles) {
        let transitions = handle.transitions();
        let deadline = tokio::time::Instant::now() + Duration::from_millis(1500);
        while tokio::time::Instant::now() < deadline {
            match transitions.try_recv() {
                Ok(DiscoveryState::Leader) => {
                    leaders.push(address.clone());
                    break;
                }
                Ok(_) => {}
                Err(_) => tokio::time::sleep(Duration::from_millis(25)).await,
            }
        }
    }
    assert_eq!(leaders, vec![leader.clone()], "exactly one node may lead");

    // The winner's lease manager keeps the entry alive well past its TTL.
    tokio::time::sleep(DiscoveryConfig::local().leader_entry_ttl + Duration::from_millis(500)).await;
    assert_eq!(store.leader("cluster/leader"), Some(leader));

    for handle in &handles {
        handle.shutdown();
    }
}
