//! Top-level discovery coordination: election and role management.
//!
//! On `Start` the coordinator registers the base path, then bids for the
//! leader entry. Exactly one node's bid succeeds and it assumes the
//! leader role: it bootstraps the cluster with itself as the first seed,
//! spawns the lease manager, and feeds membership changes to the seed
//! synchronizer. Every other node becomes a follower: it fetches the
//! published seeds and joins them, falling back to a fresh election if
//! the fetch or the join times out.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_channel::{Receiver, Sender};
use smallvec::SmallVec;

use crate::client::{LeaderEntry, RegisteredSeeds, ServiceDiscoveryClient, SetLeaderMode, StoreResult};
use crate::config::DiscoveryConfig;
use crate::error::Result;
use crate::leader_lease::LeaderLeaseRunner;
use crate::membership::{ClusterMembership, MembershipEvent, NodeAddress, SubscriptionKind};
use crate::seed_list::{SeedCommand, SeedListEvent, SeedListRunner};
use crate::timer::Timers;

/// Roles a node moves through while bootstrapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryState {
    /// Not started, or registering the base path.
    Initial,
    /// A leader bid is outstanding.
    Election,
    /// This node holds the leader entry and publishes the seed list.
    Leader,
    /// Another node leads; this node joins via the published seeds.
    Follower,
}

/// Named timer slots owned by the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CoordinatorTimer {
    /// Generic retry of the in-progress store operation.
    Retry,
    /// Deadline for the follower's seed registry fetch.
    SeedsFetch,
    /// Deadline for the follower to become a member after joining.
    SeedsJoin,
}

/// Inbox events for the coordinator machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoordinatorEvent {
    /// Begin bootstrapping. Issued once through [`DiscoveryHandle::start`].
    Start,
    /// Outcome of the base-path registration.
    BasePathCreated(StoreResult<String>),
    /// Outcome of the election bid.
    ElectionResult(StoreResult<LeaderEntry>),
    /// Outcome of the follower's seed registry fetch.
    SeedsFetched(StoreResult<RegisteredSeeds>),
    /// A timer slot fired. The shell discards stale generations before
    /// they reach the machine.
    TimerFired {
        /// Which slot fired.
        timer: CoordinatorTimer,
        /// Generation the slot was armed under.
        generation: u64,
    },
    /// An event from the cluster membership layer.
    Membership(MembershipEvent),
}

/// Side effects requested by a coordinator transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoordinatorEffect {
    /// Register the base path in the store.
    CreateBasePath,
    /// Submit an election bid: claim the leader entry for this node.
    SubmitElectionBid,
    /// Fetch the seed registry.
    FetchSeeds,
    /// Join the cluster with this node as the only seed.
    JoinSelf,
    /// Join the cluster through the given seed addresses.
    JoinSeedNodes(Vec<NodeAddress>),
    /// Subscribe to the membership event stream.
    Subscribe(SubscriptionKind),
    /// Spawn the lease manager for this node's address.
    StartLeaseManager,
    /// Forward an event to the seed synchronizer.
    ToSeedList(SeedListEvent),
    /// Arm a timer slot.
    ArmTimer(CoordinatorTimer, Duration),
    /// Cancel a timer slot.
    CancelTimer(CoordinatorTimer),
}

/// Effect list produced by one transition.
pub type CoordinatorEffects = SmallVec<[CoordinatorEffect; 8]>;

/// Pure coordinator state machine.
///
/// Tracks the discovery role and, while leader, the set of members known
/// to be up. [`handle`](Self::handle) is a synchronous transition
/// function returning the side effects to execute.
#[derive(Debug)]
pub struct DiscoveryCoordinator {
    state: DiscoveryState,
    members: BTreeSet<NodeAddress>,
    self_address: NodeAddress,
    config: DiscoveryConfig,
}

impl DiscoveryCoordinator {
    /// Create a machine in the initial state.
    pub fn new(self_address: NodeAddress, config: DiscoveryConfig) -> Self {
        Self {
            state: DiscoveryState::Initial,
            members: BTreeSet::new(),
            self_address,
            config,
        }
    }

    /// Current role.
    pub fn state(&self) -> DiscoveryState {
        self.state
    }

    /// Members currently known to be up (tracked while leader).
    pub fn members(&self) -> &BTreeSet<NodeAddress> {
        &self.members
    }

    /// Advance the machine by one event, returning the effects to run.
    pub fn handle(&mut self, event: CoordinatorEvent) -> CoordinatorEffects {
        let mut effects = CoordinatorEffects::new();

        match (self.state, event) {
            // ---- Initial: register the base path ----
            (DiscoveryState::Initial, CoordinatorEvent::Start) => {
                effects.push(CoordinatorEffect::CreateBasePath);
            }
            (DiscoveryState::Initial, CoordinatorEvent::BasePathCreated(Ok(_))) => {
                self.go_to(DiscoveryState::Election, &mut effects);
            }
            (DiscoveryState::Initial, CoordinatorEvent::BasePathCreated(Err(err))) => {
                if err.is_transport() {
                    tracing::warn!(error = %err, "base path registration failed, retrying");
                    effects.push(CoordinatorEffect::ArmTimer(
                        CoordinatorTimer::Retry,
                        self.config.retry_delay,
                    ));
                } else {
                    // Any definite response will do; the path may well
                    // have been registered by another node already.
                    tracing::debug!(error = %err, "base path already registered");
                    self.go_to(DiscoveryState::Election, &mut effects);
                }
            }
            (
                DiscoveryState::Initial,
                CoordinatorEvent::TimerFired {
                    timer: CoordinatorTimer::Retry,
                    ..
                },
            ) => {
                effects.push(CoordinatorEffect::CreateBasePath);
            }

            // ---- Election: the bid decides the role ----
            (DiscoveryState::Election, CoordinatorEvent::ElectionResult(Ok(_))) => {
                self.go_to(DiscoveryState::Leader, &mut effects);
            }
            (DiscoveryState::Election, CoordinatorEvent::ElectionResult(Err(err))) => {
                if err.is_transport() {
                    tracing::error!(error = %err, "election bid failed, retrying");
                    effects.push(CoordinatorEffect::ArmTimer(
                        CoordinatorTimer::Retry,
                        self.config.retry_delay,
                    ));
                } else {
                    tracing::info!(error = %err, "leader entry is taken");
                    self.go_to(DiscoveryState::Follower, &mut effects);
                }
            }
            (
                DiscoveryState::Election,
                CoordinatorEvent::TimerFired {
                    timer: CoordinatorTimer::Retry,
                    ..
                },
            ) => {
                tracing::warn!("retrying election bid");
                effects.push(CoordinatorEffect::SubmitElectionBid);
            }

            // ---- Follower: fetch seeds and join them ----
            (DiscoveryState::Follower, CoordinatorEvent::SeedsFetched(Ok(registry))) => {
                let seeds: Vec<NodeAddress> = registry.into_values().collect();
                tracing::info!(?seeds, "attempting to join seed nodes");
                effects.push(CoordinatorEffect::JoinSeedNodes(seeds));
                effects.push(CoordinatorEffect::CancelTimer(CoordinatorTimer::SeedsFetch));
                effects.push(CoordinatorEffect::ArmTimer(
                    CoordinatorTimer::SeedsJoin,
                    self.config.seeds_join_timeout,
                ));
            }
            (DiscoveryState::Follower, CoordinatorEvent::SeedsFetched(Err(err))) => {
                tracing::warn!(error = %err, "seed fetch failed, retrying");
                effects.push(CoordinatorEffect::ArmTimer(
                    CoordinatorTimer::Retry,
                    self.config.retry_delay,
                ));
            }
            (
                DiscoveryState::Follower,
                CoordinatorEvent::TimerFired {
                    timer: CoordinatorTimer::Retry,
                    ..
                },
            ) => {
                effects.push(CoordinatorEffect::FetchSeeds);
            }
            (
                DiscoveryState::Follower,
                CoordinatorEvent::TimerFired {
                    timer: CoordinatorTimer::SeedsFetch,
                    ..
                },
            ) => {
                tracing::info!(
                    "failed to fetch seed node information in {:?}",
                    self.config.seeds_fetch_timeout
                );
                self.go_to(DiscoveryState::Election, &mut effects);
            }
            (
                DiscoveryState::Follower,
                CoordinatorEvent::TimerFired {
                    timer: CoordinatorTimer::SeedsJoin,
                    ..
                },
            ) => {
                tracing::info!(
                    "seed nodes failed to respond in {:?}",
                    self.config.seeds_join_timeout
                );
                self.go_to(DiscoveryState::Election, &mut effects);
            }
            (
                DiscoveryState::Follower,
                CoordinatorEvent::Membership(MembershipEvent::LeaderChanged(leader)),
            ) => {
                if leader == self.self_address {
                    self.go_to(DiscoveryState::Leader, &mut effects);
                } else {
                    tracing::info!(leader = %leader, "seen leader change");
                }
            }
            (
                DiscoveryState::Follower,
                CoordinatorEvent::Membership(MembershipEvent::MemberUp(member)),
            ) if member == self.self_address => {
                tracing::info!("joined the cluster");
                effects.push(CoordinatorEffect::CancelTimer(CoordinatorTimer::SeedsFetch));
                effects.push(CoordinatorEffect::CancelTimer(CoordinatorTimer::SeedsJoin));
            }
            (DiscoveryState::Follower, CoordinatorEvent::Membership(_)) => {
                // Other domain events carry nothing for a follower.
            }

            // ---- Leader: mirror membership into the seed list ----
            (
                DiscoveryState::Leader,
                CoordinatorEvent::Membership(MembershipEvent::CurrentSnapshot(members)),
            ) => {
                self.members = members.clone();
                effects.push(CoordinatorEffect::ToSeedList(SeedListEvent::InitialState(
                    members,
                )));
            }
            (
                DiscoveryState::Leader,
                CoordinatorEvent::Membership(MembershipEvent::MemberUp(member)),
            ) => {
                self.members.insert(member.clone());
                effects.push(CoordinatorEffect::ToSeedList(SeedListEvent::Command(
                    SeedCommand::MemberAdded(member),
                )));
            }
            (
                DiscoveryState::Leader,
                CoordinatorEvent::Membership(MembershipEvent::MemberExited(member)),
            ) => {
                self.members.remove(&member);
                effects.push(CoordinatorEffect::ToSeedList(SeedListEvent::Command(
                    SeedCommand::MemberRemoved(member),
                )));
            }
            (
                DiscoveryState::Leader,
                CoordinatorEvent::Membership(MembershipEvent::MemberRemoved(member)),
            ) => {
                // Only forward the removal of a member we were tracking;
                // an exit usually precedes the removal and has already
                // withdrawn the seed.
                if self.members.remove(&member) {
                    effects.push(CoordinatorEffect::ToSeedList(SeedListEvent::Command(
                        SeedCommand::MemberRemoved(member),
                    )));
                }
            }
            (DiscoveryState::Leader, CoordinatorEvent::Membership(_)) => {}

            (state, event) => {
                tracing::warn!(state = ?state, event = ?event, "unhandled event");
            }
        }

        effects
    }

    /// Transition to `next`, canceling timers armed by the state being
    /// left and emitting the entry effects of the new state.
    fn go_to(&mut self, next: DiscoveryState, effects: &mut CoordinatorEffects) {
        effects.push(CoordinatorEffect::CancelTimer(CoordinatorTimer::Retry));
        effects.push(CoordinatorEffect::CancelTimer(CoordinatorTimer::SeedsFetch));
        effects.push(CoordinatorEffect::CancelTimer(CoordinatorTimer::SeedsJoin));
        self.state = next;

        match next {
            DiscoveryState::Election => {
                tracing::info!("starting election");
                effects.push(CoordinatorEffect::SubmitElectionBid);
            }
            DiscoveryState::Leader => {
                tracing::info!("assuming the leader role");
                effects.push(CoordinatorEffect::JoinSelf);
                effects.push(CoordinatorEffect::Subscribe(SubscriptionKind::MemberEvents));
                effects.push(CoordinatorEffect::StartLeaseManager);
            }
            DiscoveryState::Follower => {
                tracing::info!("assuming the follower role");
                effects.push(CoordinatorEffect::Subscribe(SubscriptionKind::DomainEvents));
                effects.push(CoordinatorEffect::ArmTimer(
                    CoordinatorTimer::SeedsFetch,
                    self.config.seeds_fetch_timeout,
                ));
                effects.push(CoordinatorEffect::FetchSeeds);
            }
            DiscoveryState::Initial => {}
        }
    }
}

/// Handle for controlling a running [`ClusterDiscovery`].
#[derive(Debug, Clone)]
pub struct DiscoveryHandle {
    tx: Sender<CoordinatorEvent>,
    transitions: Receiver<DiscoveryState>,
}

impl DiscoveryHandle {
    /// Begin bootstrapping: register the base path and start the first
    /// election cycle.
    pub async fn start(&self) -> Result<()> {
        self.tx.send(CoordinatorEvent::Start).await?;
        Ok(())
    }

    /// Stream of role transitions, one element per state change.
    ///
    /// The stream is a queue, not a broadcast: take one receiver per
    /// coordinator and keep it.
    pub fn transitions(&self) -> Receiver<DiscoveryState> {
        self.transitions.clone()
    }

    /// Stop the coordinator and its children.
    pub fn shutdown(&self) {
        self.tx.close();
    }
}

/// The assembled discovery system: coordinator, seed synchronizer and
/// (once leader) lease manager, wired to a store client and a membership
/// layer.
///
/// # Example
///
/// ```ignore
/// use cluster_bootstrap::{ClusterDiscovery, DiscoveryConfig, NodeAddress};
///
/// let (discovery, handle) = ClusterDiscovery::new(
///     client,
///     membership,
///     NodeAddress::from("proto://system@host1:5000"),
///     DiscoveryConfig::default(),
/// );
/// tokio::spawn(discovery.run());
/// handle.start().await?;
/// ```
pub struct ClusterDiscovery<C, M> {
    runner: CoordinatorRunner<C, M>,
    seed_list: SeedListRunner<C>,
}

impl<C, M> ClusterDiscovery<C, M>
where
    C: ServiceDiscoveryClient,
    M: ClusterMembership,
{
    /// Wire up the discovery components for this node.
    pub fn new(
        client: Arc<C>,
        membership: Arc<M>,
        self_address: NodeAddress,
        config: DiscoveryConfig,
    ) -> (Self, DiscoveryHandle) {
        let (tx, inbox) = async_channel::bounded(1024);
        let (membership_tx, membership_rx) = async_channel::bounded(1024);
        let (transitions_tx, transitions_rx) = async_channel::unbounded();
        let (children_shutdown_tx, children_shutdown_rx) = async_channel::bounded(1);

        let (seed_list, seed_list_tx) = SeedListRunner::new(
            Arc::clone(&client),
            config.clone(),
            children_shutdown_rx.clone(),
        );

        let runner = CoordinatorRunner {
            machine: DiscoveryCoordinator::new(self_address.clone(), config.clone()),
            inbox,
            tx: tx.clone(),
            timers: Timers::new(tx.clone(), |timer, generation| CoordinatorEvent::TimerFired {
                timer,
                generation,
            }),
            client,
            membership,
            config,
            self_address,
            membership_tx,
            membership_rx,
            seed_list_tx,
            transitions: transitions_tx,
            children_shutdown: children_shutdown_tx,
            children_shutdown_rx,
            lease_started: false,
        };

        let handle = DiscoveryHandle {
            tx,
            transitions: transitions_rx,
        };

        (Self { runner, seed_list }, handle)
    }

    /// Drive all components until [`DiscoveryHandle::shutdown`] is called.
    ///
    /// Must be run inside a tokio runtime; typically spawned.
    pub async fn run(self) {
        tokio::spawn(self.seed_list.run());
        self.runner.run().await;
    }
}

/// Async shell driving the [`DiscoveryCoordinator`] machine.
struct CoordinatorRunner<C, M> {
    machine: DiscoveryCoordinator,
    inbox: Receiver<CoordinatorEvent>,
    tx: Sender<CoordinatorEvent>,
    timers: Timers<CoordinatorTimer, CoordinatorEvent>,
    client: Arc<C>,
    membership: Arc<M>,
    config: DiscoveryConfig,
    self_address: NodeAddress,
    membership_tx: Sender<MembershipEvent>,
    membership_rx: Receiver<MembershipEvent>,
    seed_list_tx: Sender<SeedListEvent>,
    transitions: Sender<DiscoveryState>,
    children_shutdown: Sender<()>,
    children_shutdown_rx: Receiver<()>,
    lease_started: bool,
}

impl<C, M> CoordinatorRunner<C, M>
where
    C: ServiceDiscoveryClient,
    M: ClusterMembership,
{
    async fn run(mut self) {
        // Bridge membership events into the coordinator inbox so the
        // machine sees a single ordered stream.
        {
            let membership_rx = self.membership_rx.clone();
            let tx = self.tx.clone();
            tokio::spawn(async move {
                while let Ok(event) = membership_rx.recv().await {
                    if tx.send(CoordinatorEvent::Membership(event)).await.is_err() {
                        break;
                    }
                }
            });
        }

        loop {
            let event = match self.inbox.recv().await {
                Ok(event) => event,
                Err(_) => break,
            };

            // Discard firings of canceled or re-armed timers.
            if let CoordinatorEvent::TimerFired { timer, generation } = &event {
                if !self.timers.is_current(*timer, *generation) {
                    tracing::debug!(timer = ?timer, "dropping stale timer");
                    continue;
                }
            }

            let before = self.machine.state();
            let effects = self.machine.handle(event);
            let after = self.machine.state();
            if before != after {
                let _ = self.transitions.try_send(after);
            }

            for effect in effects {
                self.execute(effect).await;
            }
        }

        self.children_shutdown.close();
    }

    async fn execute(&mut self, effect: CoordinatorEffect) {
        match effect {
            CoordinatorEffect::CreateBasePath => {
                let client = Arc::clone(&self.client);
                let path = self.config.base_path.clone();
                let address = self.self_address.clone();
                let tx = self.tx.clone();
                tokio::spawn(async move {
                    let result = client.create(&path, &address, None).await;
                    let _ = tx.send(CoordinatorEvent::BasePathCreated(result)).await;
                });
            }
            CoordinatorEffect::SubmitElectionBid => {
                let client = Arc::clone(&self.client);
                let path = self.config.leader_path.clone();
                let address = self.self_address.clone();
                let ttl = self.config.leader_entry_ttl;
                let tx = self.tx.clone();
                tokio::spawn(async move {
                    let result = client
                        .set_leader(&path, &address, ttl, SetLeaderMode::Claim)
                        .await;
                    let _ = tx.send(CoordinatorEvent::ElectionResult(result)).await;
                });
            }
            CoordinatorEffect::FetchSeeds => {
                let client = Arc::clone(&self.client);
                let path = self.config.seeds_path.clone();
                let tx = self.tx.clone();
                tokio::spawn(async move {
                    let result = client.get(&path).await;
                    let _ = tx.send(CoordinatorEvent::SeedsFetched(result)).await;
                });
            }
            CoordinatorEffect::JoinSelf => {
                self.membership.join(&self.self_address);
            }
            CoordinatorEffect::JoinSeedNodes(seeds) => {
                self.membership.join_seed_nodes(&seeds);
            }
            CoordinatorEffect::Subscribe(kind) => {
                self.membership.subscribe(self.membership_tx.clone(), kind);
            }
            CoordinatorEffect::StartLeaseManager => {
                if !self.lease_started {
                    self.lease_started = true;
                    let lease = LeaderLeaseRunner::new(
                        Arc::clone(&self.client),
                        self.config.clone(),
                        self.self_address.clone(),
                        self.children_shutdown_rx.clone(),
                    );
                    tokio::spawn(lease.run());
                }
            }
            CoordinatorEffect::ToSeedList(event) => {
                let _ = self.seed_list_tx.send(event).await;
            }
            CoordinatorEffect::ArmTimer(timer, delay) => {
                self.timers.arm(timer, delay);
            }
            CoordinatorEffect::CancelTimer(timer) => {
                self.timers.cancel(timer);
            }
        }
    }
}
