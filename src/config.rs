//! Configuration for cluster bootstrap.

use std::time::Duration;

/// Configuration options for cluster bootstrap.
///
/// These parameters control where coordination state lives in the
/// discovery store and how aggressively the components retry and time
/// out. Loaded once at startup and never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DiscoveryConfig {
    /// Store path under which all coordination state is rooted.
    ///
    /// Registered once when the coordinator starts, before the first
    /// election bid.
    ///
    /// Default: "cluster"
    pub base_path: String,

    /// Store path the seed registry lives under. One entry per published
    /// seed; keys are derived from this path and the member address.
    ///
    /// Default: "cluster/seeds"
    pub seeds_path: String,

    /// Store key holding the current leader's address.
    ///
    /// Default: "cluster/leader"
    pub leader_path: String,

    /// Lease TTL for the leader entry.
    ///
    /// The store expires the entry this long after the last write; the
    /// lease manager refreshes it at half this interval so at least one
    /// retry fits before expiry.
    ///
    /// Default: 10s
    #[cfg_attr(feature = "serde", serde(with = "humantime_serde_impl"))]
    pub leader_entry_ttl: Duration,

    /// Delay before retrying a failed store operation.
    ///
    /// Used by every component for its transient-failure retries; should
    /// be well below half of `leader_entry_ttl` or a slow store can cost
    /// the leader its lease.
    ///
    /// Default: 2s
    #[cfg_attr(feature = "serde", serde(with = "humantime_serde_impl"))]
    pub retry_delay: Duration,

    /// How long a follower waits for the seed registry fetch before
    /// abandoning the follower role and re-entering election.
    ///
    /// Default: 10s
    #[cfg_attr(feature = "serde", serde(with = "humantime_serde_impl"))]
    pub seeds_fetch_timeout: Duration,

    /// How long a follower waits to become a cluster member after joining
    /// the fetched seed nodes before re-entering election.
    ///
    /// Default: 20s
    #[cfg_attr(feature = "serde", serde(with = "humantime_serde_impl"))]
    pub seeds_join_timeout: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            base_path: "cluster".to_owned(),
            seeds_path: "cluster/seeds".to_owned(),
            leader_path: "cluster/leader".to_owned(),
            leader_entry_ttl: Duration::from_secs(10),
            retry_delay: Duration::from_secs(2),
            seeds_fetch_timeout: Duration::from_secs(10),
            seeds_join_timeout: Duration::from_secs(20),
        }
    }
}

impl DiscoveryConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Configuration for single-host development and testing.
    ///
    /// Short lease and timeouts so failures surface quickly.
    pub fn local() -> Self {
        Self {
            base_path: "cluster".to_owned(),
            seeds_path: "cluster/seeds".to_owned(),
            leader_path: "cluster/leader".to_owned(),
            leader_entry_ttl: Duration::from_secs(2),
            retry_delay: Duration::from_millis(200),
            seeds_fetch_timeout: Duration::from_secs(1),
            seeds_join_timeout: Duration::from_secs(2),
        }
    }

    /// Set the base path (builder pattern).
    pub fn with_base_path(mut self, path: impl Into<String>) -> Self {
        self.base_path = path.into();
        self
    }

    /// Set the seeds path (builder pattern).
    pub fn with_seeds_path(mut self, path: impl Into<String>) -> Self {
        self.seeds_path = path.into();
        self
    }

    /// Set the leader path (builder pattern).
    pub fn with_leader_path(mut self, path: impl Into<String>) -> Self {
        self.leader_path = path.into();
        self
    }

    /// Set the leader entry TTL (builder pattern).
    pub const fn with_leader_entry_ttl(mut self, ttl: Duration) -> Self {
        self.leader_entry_ttl = ttl;
        self
    }

    /// Set the retry delay (builder pattern).
    pub const fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Set the seeds fetch timeout (builder pattern).
    pub const fn with_seeds_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.seeds_fetch_timeout = timeout;
        self
    }

    /// Set the seeds join timeout (builder pattern).
    pub const fn with_seeds_join_timeout(mut self, timeout: Duration) -> Self {
        self.seeds_join_timeout = timeout;
        self
    }
}

#[cfg(feature = "serde")]
mod humantime_serde_impl {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if serializer.is_human_readable() {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        } else {
            serializer.serialize_u64(duration.as_millis() as u64)
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        if deserializer.is_human_readable() {
            let s = String::deserialize(deserializer)?;
            // Simple parsing: expect "Nms" format
            let ms: u64 = s
                .trim_end_matches("ms")
                .parse()
                .map_err(serde::de::Error::custom)?;
            Ok(Duration::from_millis(ms))
        } else {
            let ms = u64::deserialize(deserializer)?;
            Ok(Duration::from_millis(ms))
        }
    }
}
