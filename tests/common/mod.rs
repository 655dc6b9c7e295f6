//! Shared test utilities for cluster-bootstrap tests.
#![allow(dead_code)]

use std::time::Duration;

/// Poll `cond` every 25ms until it holds, panicking after 5 seconds.
///
/// The components under test are message-driven; assertions observe
/// their effects on the shared store or the scripted membership layer,
/// so a bounded wait is needed between a stimulus and its outcome.
pub async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for: {}", what);
}

/// Keep delivering a membership event until a subscriber accepts it.
///
/// Subscriptions are registered by the coordinator as a side effect of a
/// role transition, slightly after the transition itself is observable.
pub async fn emit_when_subscribed(
    membership: &cluster_bootstrap::testing::ScriptedMembership,
    event: cluster_bootstrap::MembershipEvent,
) {
    for _ in 0..200 {
        if membership.emit(event.clone()) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("no membership subscriber appeared within 5s");
}
