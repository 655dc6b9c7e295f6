//! # cluster-bootstrap
//!
//! Leader election and seed-list management for bootstrapping a
//! peer-to-peer cluster through an external discovery store (Consul/etcd
//! semantics: keys, TTL leases, compare-and-swap).
//!
//! Any node may start as a candidate; exactly one wins the leader entry
//! and publishes the cluster's seed list, while every other node
//! discovers the published seeds and joins them. The hard part is
//! staying correct under partial failure: lost responses, duplicate
//! retries, stale leases and membership churn must never produce two
//! simultaneous leaders, a permanently stuck bootstrap, or a corrupted
//! seed registry.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      ClusterDiscovery                            │
//! │       (wiring: store client + membership + coordinator)         │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                    DiscoveryCoordinator                          │
//! │    (Initial → Election → Leader | Follower, membership set)     │
//! ├────────────────────────────┬────────────────────────────────────┤
//! │        LeaderLease         │            SeedList                 │
//! │  (half-TTL create/refresh  │  (registry reconciliation with     │
//! │   cycle for the leader     │   hold-and-replay command queue)   │
//! │   entry)                   │                                    │
//! ├────────────────────────────┴────────────────────────────────────┤
//! │        ServiceDiscoveryClient        ClusterMembership           │
//! │           (external store)          (external gossip)            │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Each component is a pure state machine (a synchronous transition
//! function returning side effects as data) driven by a thin async shell
//! with a channel inbox. Store calls and timers resolve back into the
//! inbox as events, so a machine never blocks mid-transition and the
//! transition logic is testable without a runtime.
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use cluster_bootstrap::{ClusterDiscovery, DiscoveryConfig, NodeAddress};
//!
//! let client = Arc::new(MyConsulClient::connect("http://localhost:8500")?);
//! let membership = Arc::new(MyGossipLayer::new());
//!
//! let (discovery, handle) = ClusterDiscovery::new(
//!     client,
//!     membership,
//!     NodeAddress::from("proto://system@host1:5000"),
//!     DiscoveryConfig::default(),
//! );
//!
//! tokio::spawn(discovery.run());
//! handle.start().await?;
//! ```

#![deny(missing_docs)]

mod client;
mod config;
mod coordinator;
mod error;
mod leader_lease;
mod membership;
mod seed_list;
pub mod testing;
mod timer;

// Re-export store capability types
pub use client::{
    registry_key, LeaderEntry, RegisteredSeeds, ServiceDiscoveryClient, SetLeaderMode, StoreError,
    StoreErrorKind, StoreResult,
};

// Re-export config types
pub use config::DiscoveryConfig;

// Re-export coordinator types
pub use coordinator::{
    ClusterDiscovery, CoordinatorEffect, CoordinatorEffects, CoordinatorEvent, CoordinatorTimer,
    DiscoveryCoordinator, DiscoveryHandle, DiscoveryState,
};

// Re-export error types
pub use error::{Error, Result};

// Re-export lease manager types
pub use leader_lease::{
    LeaderLease, LeaderLeaseEffect, LeaderLeaseEffects, LeaderLeaseEvent, LeaderLeaseRunner,
    LeaderLeaseState,
};

// Re-export membership capability types
pub use membership::{ClusterMembership, MembershipEvent, NodeAddress, SubscriptionKind};

// Re-export seed synchronizer types
pub use seed_list::{
    SeedCommand, SeedList, SeedListEffect, SeedListEffects, SeedListEvent, SeedListRunner,
    SeedListState,
};
