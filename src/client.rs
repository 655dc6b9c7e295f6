//! Service-discovery store capability.
//!
//! All coordination state lives in an external, linearizable key-value
//! store (Consul/etcd semantics: keys, TTL-backed entries,
//! compare-and-swap). The [`ServiceDiscoveryClient`] trait is the only
//! surface the state machines see; every operation is asynchronous and
//! resolves to a definite outcome that is routed back to the issuing
//! machine as an inbox event.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::time::Duration;

use crate::membership::NodeAddress;

/// Result type alias for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Registry listing: store key to the seed address published under it.
pub type RegisteredSeeds = BTreeMap<String, NodeAddress>;

/// Classified failure reported by the discovery store.
///
/// A `Transport` failure means no definite response was obtained (timeout,
/// connection error); every other kind is a definite application-level
/// rejection. The distinction drives different state-machine branches, so
/// client implementations must classify carefully.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreErrorKind {
    /// The leader entry is held by a different address.
    LeaseHeld,
    /// The requested key or path does not exist.
    KeyNotFound,
    /// A compare-and-swap guard failed: the stored value is not ours.
    CasFailed,
    /// Any other definite rejection (key already present, bad request...).
    Rejected,
    /// No definite response: timeout, connection refused, protocol error.
    Transport,
}

/// Failure outcome of a store operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreError {
    /// Classification of the failure.
    pub kind: StoreErrorKind,
    /// Human-readable reason, used for logging only.
    pub reason: String,
}

impl StoreError {
    /// Create an error with an explicit kind.
    pub fn new(kind: StoreErrorKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
        }
    }

    /// The leader entry is held by another address.
    pub fn lease_held(reason: impl Into<String>) -> Self {
        Self::new(StoreErrorKind::LeaseHeld, reason)
    }

    /// The key or path does not exist.
    pub fn key_not_found(reason: impl Into<String>) -> Self {
        Self::new(StoreErrorKind::KeyNotFound, reason)
    }

    /// A compare-and-swap guard failed.
    pub fn cas_failed(reason: impl Into<String>) -> Self {
        Self::new(StoreErrorKind::CasFailed, reason)
    }

    /// A definite rejection of any other flavor.
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::new(StoreErrorKind::Rejected, reason)
    }

    /// No definite response was obtained.
    pub fn transport(reason: impl Into<String>) -> Self {
        Self::new(StoreErrorKind::Transport, reason)
    }

    /// Whether this failure is transport-level (no definite response).
    pub fn is_transport(&self) -> bool {
        self.kind == StoreErrorKind::Transport
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            StoreErrorKind::LeaseHeld => write!(f, "lease held: {}", self.reason),
            StoreErrorKind::KeyNotFound => write!(f, "key not found: {}", self.reason),
            StoreErrorKind::CasFailed => write!(f, "compare-and-swap failed: {}", self.reason),
            StoreErrorKind::Rejected => write!(f, "rejected: {}", self.reason),
            StoreErrorKind::Transport => write!(f, "transport failure: {}", self.reason),
        }
    }
}

impl std::error::Error for StoreError {}

/// Acknowledgement of a successful leader-entry write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaderEntry {
    /// Path of the leader key that was written.
    pub path: String,
    /// The address now recorded as leader.
    pub address: NodeAddress,
}

/// Write mode for the leader entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetLeaderMode {
    /// Create-if-absent: must fail with [`StoreErrorKind::LeaseHeld`] if
    /// the entry is live under a different address.
    Claim,
    /// Update assuming ownership: must fail with
    /// [`StoreErrorKind::KeyNotFound`] if the entry is gone, or
    /// [`StoreErrorKind::CasFailed`] if it no longer carries our address.
    Refresh,
}

/// Capability trait for the external discovery store.
///
/// Implementations wrap a concrete store client (Consul, etcd, ...) and
/// are shared between the coordinator, the lease manager and the seed
/// synchronizer. The store is the only shared mutable resource in the
/// system; atomicity of the leader-entry operations is the store's
/// responsibility, not the caller's.
pub trait ServiceDiscoveryClient: Send + Sync + 'static {
    /// List all registry entries under `path`.
    ///
    /// Returns the key/value pairs found, or
    /// [`StoreErrorKind::KeyNotFound`] if the path does not exist yet.
    fn get(&self, path: &str) -> impl Future<Output = StoreResult<RegisteredSeeds>> + Send;

    /// Insert a new entry at exactly `path`, failing if one is already
    /// present (first writer wins per key). Returns the created key.
    fn create(
        &self,
        path: &str,
        value: &NodeAddress,
        ttl: Option<Duration>,
    ) -> impl Future<Output = StoreResult<String>> + Send;

    /// Remove the entry at `path`, or the child entry `member` under it,
    /// or the whole subtree when `recursive` is set.
    fn delete(
        &self,
        path: &str,
        member: Option<&str>,
        recursive: bool,
    ) -> impl Future<Output = StoreResult<()>> + Send;

    /// Atomically create-or-refresh the leader entry at `leader_path`
    /// with the given lease TTL. See [`SetLeaderMode`] for the required
    /// failure semantics of each mode.
    fn set_leader(
        &self,
        leader_path: &str,
        address: &NodeAddress,
        ttl: Duration,
        mode: SetLeaderMode,
    ) -> impl Future<Output = StoreResult<LeaderEntry>> + Send;
}

/// Derive the registry key a seed address is published under.
///
/// The key only needs to be deterministic per address and collision-free
/// in practice; the address itself cannot be embedded verbatim because it
/// may contain path separators.
pub fn registry_key(seeds_path: &str, address: &NodeAddress) -> String {
    use std::hash::{Hash, Hasher};

    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    address.as_str().hash(&mut hasher);
    format!("{}/{:016x}", seeds_path.trim_end_matches('/'), hasher.finish())
}
