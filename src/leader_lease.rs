//! Leader-entry maintenance: periodic create-or-refresh of the leader key.
//!
//! The leader's claim on the coordination store is a TTL lease. The lease
//! manager renews it at half the TTL, leaving room for at least one retry
//! before the store expires the entry even if a renewal attempt is lost.

use std::sync::Arc;
use std::time::Duration;

use async_channel::{Receiver, Sender};
use futures::future::FutureExt;
use futures_timer::Delay;
use smallvec::SmallVec;

use crate::client::{LeaderEntry, ServiceDiscoveryClient, SetLeaderMode, StoreErrorKind, StoreResult};
use crate::config::DiscoveryConfig;
use crate::membership::NodeAddress;

/// States of the lease manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaderLeaseState {
    /// Waiting for the next renewal deadline.
    Idle,
    /// A leader-entry write is outstanding.
    AwaitingReply,
}

/// Inbox events for the lease manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaderLeaseEvent {
    /// The renewal timer fired.
    RefreshDue,
    /// Outcome of the leader-entry write.
    Ack(StoreResult<LeaderEntry>),
}

/// Side effects requested by a lease-manager transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaderLeaseEffect {
    /// Write the leader entry in the given mode.
    SetLeader(SetLeaderMode),
    /// Deliver [`LeaderLeaseEvent::RefreshDue`] after the delay.
    ArmTimer(Duration),
}

/// Effect list produced by one transition.
pub type LeaderLeaseEffects = SmallVec<[LeaderLeaseEffect; 2]>;

/// Pure lease-manager state machine.
///
/// `assume_entry_exists` tracks whether the last confirmed store state is
/// "our lease is live" (next write is a refresh) or "no confirmed lease"
/// (next write re-claims). It only changes on response receipt: a
/// definite key-not-found or CAS mismatch resets it, while an ambiguous
/// failure leaves it alone so a merely slow store does not trigger
/// needless re-creation.
#[derive(Debug)]
pub struct LeaderLease {
    state: LeaderLeaseState,
    assume_entry_exists: bool,
    refresh_interval: Duration,
    retry_delay: Duration,
}

impl LeaderLease {
    /// Create a machine for a node that just won the election; the entry
    /// it claimed during the bid is assumed live.
    pub fn new(config: &DiscoveryConfig) -> Self {
        Self {
            state: LeaderLeaseState::Idle,
            assume_entry_exists: true,
            refresh_interval: config.leader_entry_ttl / 2,
            retry_delay: config.retry_delay,
        }
    }

    /// Current state.
    pub fn state(&self) -> LeaderLeaseState {
        self.state
    }

    /// Whether the next write will be a refresh rather than a claim.
    pub fn assume_entry_exists(&self) -> bool {
        self.assume_entry_exists
    }

    /// Initial effects: arm the first renewal at half the TTL.
    pub fn start(&self) -> LeaderLeaseEffects {
        let mut effects = LeaderLeaseEffects::new();
        effects.push(LeaderLeaseEffect::ArmTimer(self.refresh_interval));
        effects
    }

    /// Advance the machine by one event, returning the effects to run.
    pub fn handle(&mut self, event: LeaderLeaseEvent) -> LeaderLeaseEffects {
        let mut effects = LeaderLeaseEffects::new();

        match (self.state, event) {
            (LeaderLeaseState::Idle, LeaderLeaseEvent::RefreshDue) => {
                let mode = if self.assume_entry_exists {
                    SetLeaderMode::Refresh
                } else {
                    SetLeaderMode::Claim
                };
                effects.push(LeaderLeaseEffect::SetLeader(mode));
                self.state = LeaderLeaseState::AwaitingReply;
            }

            (LeaderLeaseState::AwaitingReply, LeaderLeaseEvent::Ack(Ok(_))) => {
                self.assume_entry_exists = true;
                self.state = LeaderLeaseState::Idle;
                effects.push(LeaderLeaseEffect::ArmTimer(self.refresh_interval));
            }

            (LeaderLeaseState::AwaitingReply, LeaderLeaseEvent::Ack(Err(err))) => {
                self.state = LeaderLeaseState::Idle;
                match err.kind {
                    // The entry is definitely gone or no longer ours: the
                    // next cycle must re-claim, not refresh a mismatch.
                    StoreErrorKind::KeyNotFound | StoreErrorKind::CasFailed => {
                        tracing::warn!(error = %err, "leader entry lost, will re-claim");
                        self.assume_entry_exists = false;
                        effects.push(LeaderLeaseEffect::ArmTimer(self.refresh_interval));
                    }
                    _ => {
                        tracing::warn!(error = %err, "leader entry write failed, retrying");
                        effects.push(LeaderLeaseEffect::ArmTimer(self.retry_delay));
                    }
                }
            }

            (state, event) => {
                tracing::warn!(state = ?state, event = ?event, "lease manager ignoring unexpected event");
            }
        }

        effects
    }
}

/// Async shell driving a [`LeaderLease`] machine.
///
/// Spawned by the coordinator when the node assumes the leader role; runs
/// until the coordinator's shutdown channel closes.
pub struct LeaderLeaseRunner<C> {
    machine: LeaderLease,
    inbox: Receiver<LeaderLeaseEvent>,
    tx: Sender<LeaderLeaseEvent>,
    shutdown: Receiver<()>,
    client: Arc<C>,
    config: DiscoveryConfig,
    address: NodeAddress,
}

impl<C: ServiceDiscoveryClient> LeaderLeaseRunner<C> {
    /// Create a runner maintaining the leader entry for `address`.
    pub fn new(
        client: Arc<C>,
        config: DiscoveryConfig,
        address: NodeAddress,
        shutdown: Receiver<()>,
    ) -> Self {
        let (tx, inbox) = async_channel::bounded(64);
        Self {
            machine: LeaderLease::new(&config),
            inbox,
            tx,
            shutdown,
            client,
            config,
            address,
        }
    }

    /// Drive the machine until shutdown.
    pub async fn run(mut self) {
        for effect in self.machine.start() {
            self.execute(effect);
        }

        loop {
            let shutdown_recv = self.shutdown.recv().fuse();
            let event_recv = self.inbox.recv().fuse();
            futures::pin_mut!(shutdown_recv, event_recv);

            let event = futures::select! {
                event = event_recv => match event {
                    Ok(event) => event,
                    Err(_) => break,
                },
                _ = shutdown_recv => break,
            };

            for effect in self.machine.handle(event) {
                self.execute(effect);
            }
        }
    }

    fn execute(&self, effect: LeaderLeaseEffect) {
        match effect {
            LeaderLeaseEffect::SetLeader(mode) => {
                let client = Arc::clone(&self.client);
                let path = self.config.leader_path.clone();
                let address = self.address.clone();
                let ttl = self.config.leader_entry_ttl;
                let tx = self.tx.clone();
                tokio::spawn(async move {
                    let result = client.set_leader(&path, &address, ttl, mode).await;
                    let _ = tx.send(LeaderLeaseEvent::Ack(result)).await;
                });
            }
            LeaderLeaseEffect::ArmTimer(delay) => {
                let tx = self.tx.clone();
                tokio::spawn(async move {
                    Delay::new(delay).await;
                    let _ = tx.send(LeaderLeaseEvent::RefreshDue).await;
                });
            }
        }
    }
}
