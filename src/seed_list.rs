//! Seed-list reconciliation against the discovery store registry.
//!
//! The synchronizer keeps the durable seed registry in step with the
//! in-memory cluster membership reported by the coordinator. It processes
//! one registry operation at a time; membership changes arriving while an
//! operation is outstanding are held in a FIFO queue and replayed, never
//! reordered or dropped. Failed operations are re-delivered as fresh
//! commands after a delay so the synchronizer stays responsive to newer
//! membership events while a stale operation is retried.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;

use async_channel::{Receiver, Sender};
use futures::future::FutureExt;
use futures_timer::Delay;
use smallvec::SmallVec;

use crate::client::{
    registry_key, RegisteredSeeds, ServiceDiscoveryClient, StoreErrorKind, StoreResult,
};
use crate::config::DiscoveryConfig;
use crate::membership::NodeAddress;

/// States of the seed-list machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SeedListState {
    /// Waiting for the coordinator to deliver the first membership
    /// snapshot.
    AwaitingInitialState,
    /// A registry fetch is outstanding; its result will be diffed against
    /// the carried snapshot.
    AwaitingRegisteredSeeds {
        /// Membership snapshot the fetch result is reconciled against.
        members: BTreeSet<NodeAddress>,
    },
    /// Idle: ready to serve the next membership command.
    AwaitingCommand,
    /// A create or delete is outstanding for `command`.
    AwaitingReply {
        /// The command whose store operation is in flight.
        command: SeedCommand,
    },
}

/// A single membership change to apply to the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SeedCommand {
    /// Publish the address as a seed.
    MemberAdded(NodeAddress),
    /// Withdraw the address from the registry.
    MemberRemoved(NodeAddress),
}

impl SeedCommand {
    /// The address this command applies to.
    pub fn address(&self) -> &NodeAddress {
        match self {
            SeedCommand::MemberAdded(addr) | SeedCommand::MemberRemoved(addr) => addr,
        }
    }
}

/// Inbox events for the seed-list machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SeedListEvent {
    /// First full membership snapshot from the coordinator.
    InitialState(BTreeSet<NodeAddress>),
    /// A membership change to reconcile.
    Command(SeedCommand),
    /// Outcome of the registry fetch.
    RegisteredSeeds(StoreResult<RegisteredSeeds>),
    /// Outcome of an entry create; carries the key written.
    Created(StoreResult<String>),
    /// Outcome of an entry delete.
    Deleted(StoreResult<()>),
}

/// Side effects requested by a seed-list transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SeedListEffect {
    /// Fetch all registry entries under the seeds path.
    FetchSeeds,
    /// Create a registry entry for the address.
    Create(NodeAddress),
    /// Delete the registry entry stored under `key`.
    Delete {
        /// Registry key to delete.
        key: String,
        /// Address the key was published for (log context).
        address: NodeAddress,
    },
    /// Re-deliver `event` to this machine after the retry delay.
    ScheduleRetry(SeedListEvent),
}

/// Effect list produced by one transition.
pub type SeedListEffects = SmallVec<[SeedListEffect; 4]>;

/// Pure seed-list state machine.
///
/// Holds the working copy of the registry (address to registry key) and
/// the pending-command queue; [`handle`](Self::handle) is a synchronous
/// transition function returning the side effects to execute, so the
/// reconciliation logic is testable without a runtime.
#[derive(Debug)]
pub struct SeedList {
    state: SeedListState,
    mapping: BTreeMap<NodeAddress, String>,
    queue: VecDeque<SeedCommand>,
}

impl SeedList {
    /// Create a machine awaiting its initial membership snapshot.
    pub fn new() -> Self {
        Self {
            state: SeedListState::AwaitingInitialState,
            mapping: BTreeMap::new(),
            queue: VecDeque::new(),
        }
    }

    /// Current state.
    pub fn state(&self) -> &SeedListState {
        &self.state
    }

    /// Working copy of the registry: address to the key it is published
    /// under. Absence means the address has no acknowledged entry.
    pub fn mapping(&self) -> &BTreeMap<NodeAddress, String> {
        &self.mapping
    }

    /// Number of commands held for replay.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Advance the machine by one event, returning the effects to run.
    pub fn handle(&mut self, event: SeedListEvent) -> SeedListEffects {
        let mut effects = SeedListEffects::new();
        let state = std::mem::replace(&mut self.state, SeedListState::AwaitingInitialState);

        self.state = match (state, event) {
            (SeedListState::AwaitingInitialState, SeedListEvent::InitialState(members)) => {
                effects.push(SeedListEffect::FetchSeeds);
                SeedListState::AwaitingRegisteredSeeds { members }
            }

            (
                SeedListState::AwaitingRegisteredSeeds { members },
                SeedListEvent::RegisteredSeeds(Ok(registry)),
            ) => {
                self.mapping = registry
                    .into_iter()
                    .map(|(key, addr)| (addr, key))
                    .collect();
                self.reconcile(&members);
                self.drain(&mut effects)
            }

            (
                SeedListState::AwaitingRegisteredSeeds { members },
                SeedListEvent::RegisteredSeeds(Err(err)),
            ) if err.kind == StoreErrorKind::KeyNotFound => {
                // No registry path yet: reconcile against an empty registry.
                tracing::debug!("seed registry does not exist yet, starting empty");
                self.mapping.clear();
                self.reconcile(&members);
                self.drain(&mut effects)
            }

            (
                SeedListState::AwaitingRegisteredSeeds { members },
                SeedListEvent::RegisteredSeeds(Err(err)),
            ) => {
                // Restart reconciliation from scratch rather than diffing
                // against a fetch that is no longer current.
                tracing::warn!(error = %err, "seed registry fetch failed, will retry");
                effects.push(SeedListEffect::ScheduleRetry(SeedListEvent::InitialState(
                    members,
                )));
                SeedListState::AwaitingInitialState
            }

            (SeedListState::AwaitingCommand, SeedListEvent::Command(command)) => {
                self.queue.push_back(command);
                self.drain(&mut effects)
            }

            (SeedListState::AwaitingReply { command }, SeedListEvent::Created(Ok(key))) => {
                tracing::debug!(address = %command.address(), key = %key, "seed entry created");
                self.mapping.insert(command.address().clone(), key);
                self.drain(&mut effects)
            }

            (SeedListState::AwaitingReply { command }, SeedListEvent::Created(Err(err))) => {
                tracing::warn!(address = %command.address(), error = %err, "seed entry create failed, will retry");
                effects.push(SeedListEffect::ScheduleRetry(SeedListEvent::Command(
                    command,
                )));
                self.drain(&mut effects)
            }

            (SeedListState::AwaitingReply { command }, SeedListEvent::Deleted(Ok(()))) => {
                tracing::debug!(address = %command.address(), "seed entry deleted");
                self.mapping.remove(command.address());
                self.drain(&mut effects)
            }

            (SeedListState::AwaitingReply { command }, SeedListEvent::Deleted(Err(err))) => {
                tracing::warn!(address = %command.address(), error = %err, "seed entry delete failed, will retry");
                effects.push(SeedListEffect::ScheduleRetry(SeedListEvent::Command(
                    command,
                )));
                self.drain(&mut effects)
            }

            // Commands arriving while the machine cannot serve them are
            // held for replay in arrival order.
            (state, SeedListEvent::Command(command)) => {
                self.queue.push_back(command);
                state
            }

            (state, event) => {
                tracing::warn!(state = ?state, event = ?event, "seed list ignoring unexpected event");
                state
            }
        };

        effects
    }

    /// Queue the create/delete plan for `members` versus the mapping just
    /// built from the registry: create what is up but unpublished, delete
    /// what is published but no longer up. Synthesized commands run ahead
    /// of commands that were stashed while the fetch was outstanding.
    fn reconcile(&mut self, members: &BTreeSet<NodeAddress>) {
        let registered: BTreeSet<NodeAddress> = self.mapping.keys().cloned().collect();
        let stashed = std::mem::take(&mut self.queue);

        self.queue = members
            .difference(&registered)
            .cloned()
            .map(SeedCommand::MemberAdded)
            .chain(
                registered
                    .difference(members)
                    .cloned()
                    .map(SeedCommand::MemberRemoved),
            )
            .collect();
        self.queue.extend(stashed);
    }

    /// Serve queued commands until one needs a store operation or the
    /// queue runs dry. Returns the state to settle in.
    fn drain(&mut self, effects: &mut SeedListEffects) -> SeedListState {
        while let Some(command) = self.queue.pop_front() {
            match &command {
                SeedCommand::MemberAdded(addr) => {
                    if self.mapping.contains_key(addr) {
                        tracing::debug!(address = %addr, "already registered, nothing to create");
                        continue;
                    }
                    effects.push(SeedListEffect::Create(addr.clone()));
                    return SeedListState::AwaitingReply { command };
                }
                SeedCommand::MemberRemoved(addr) => {
                    let Some(key) = self.mapping.get(addr) else {
                        tracing::debug!(address = %addr, "not registered, nothing to remove");
                        continue;
                    };
                    effects.push(SeedListEffect::Delete {
                        key: key.clone(),
                        address: addr.clone(),
                    });
                    return SeedListState::AwaitingReply { command };
                }
            }
        }
        SeedListState::AwaitingCommand
    }
}

impl Default for SeedList {
    fn default() -> Self {
        Self::new()
    }
}

/// Async shell driving a [`SeedList`] machine from its inbox.
///
/// Store calls are spawned tasks that post their outcome back into the
/// inbox; retries are delayed self-deliveries. Run inside a tokio
/// runtime; the loop ends when the shutdown channel closes or the inbox
/// is closed.
pub struct SeedListRunner<C> {
    machine: SeedList,
    inbox: Receiver<SeedListEvent>,
    tx: Sender<SeedListEvent>,
    shutdown: Receiver<()>,
    client: Arc<C>,
    config: DiscoveryConfig,
}

impl<C: ServiceDiscoveryClient> SeedListRunner<C> {
    /// Create a runner and the sender used to feed it events.
    pub fn new(
        client: Arc<C>,
        config: DiscoveryConfig,
        shutdown: Receiver<()>,
    ) -> (Self, Sender<SeedListEvent>) {
        let (tx, inbox) = async_channel::bounded(1024);
        let runner = Self {
            machine: SeedList::new(),
            inbox,
            tx: tx.clone(),
            shutdown,
            client,
            config,
        };
        (runner, tx)
    }

    /// Drive the machine until shutdown.
    pub async fn run(mut self) {
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

    fn execute(&self, effect: SeedListEffect) {
        match effect {
            SeedListEffect::FetchSeeds => {
                let client = Arc::clone(&self.client);
                let path = self.config.seeds_path.clone();
                let tx = self.tx.clone();
                tokio::spawn(async move {
                    let result = client.get(&path).await;
                    let _ = tx.send(SeedListEvent::RegisteredSeeds(result)).await;
                });
            }
            SeedListEffect::Create(address) => {
                let client = Arc::clone(&self.client);
                let key = registry_key(&self.config.seeds_path, &address);
                let tx = self.tx.clone();
                tokio::spawn(async move {
                    let result = client.create(&key, &address, None).await;
                    let _ = tx.send(SeedListEvent::Created(result)).await;
                });
            }
            SeedListEffect::Delete { key, address: _ } => {
                let client = Arc::clone(&self.client);
                let tx = self.tx.clone();
                tokio::spawn(async move {
                    let result = client.delete(&key, None, false).await;
                    let _ = tx.send(SeedListEvent::Deleted(result)).await;
                });
            }
            SeedListEffect::ScheduleRetry(event) => {
                let delay = self.config.retry_delay;
                let tx = self.tx.clone();
                tokio::spawn(async move {
                    Delay::new(delay).await;
                    let _ = tx.send(event).await;
                });
            }
        }
    }
}
