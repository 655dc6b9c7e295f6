//! Cancelable timer slots for component shells.
//!
//! Each shell owns one [`Timers`] instance holding a generation counter
//! per named timer slot. Arming a slot spawns a delay task that posts a
//! timer event tagged with the generation it was armed under; canceling
//! or re-arming bumps the generation, so a firing that raced with a
//! cancelation is recognized as stale and discarded by the shell before
//! it reaches the transition function.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;

use async_channel::Sender;
use futures_timer::Delay;

/// A set of named, cancelable timers owned by one component shell.
///
/// `K` is the slot name (a small `Copy` enum), `E` the shell's event
/// type; `make` builds the event a firing delivers. Must be used inside a
/// tokio runtime: arming spawns the delay task.
pub(crate) struct Timers<K, E> {
    generations: HashMap<K, u64>,
    tx: Sender<E>,
    make: fn(K, u64) -> E,
}

impl<K, E> Timers<K, E>
where
    K: Copy + Eq + Hash + Send + 'static,
    E: Send + 'static,
{
    pub(crate) fn new(tx: Sender<E>, make: fn(K, u64) -> E) -> Self {
        Self {
            generations: HashMap::new(),
            tx,
            make,
        }
    }

    /// Arm (or re-arm) the slot; any earlier firing for it becomes stale.
    pub(crate) fn arm(&mut self, slot: K, delay: Duration) {
        let generation = self.bump(slot);
        let tx = self.tx.clone();
        let make = self.make;
        tokio::spawn(async move {
            Delay::new(delay).await;
            // The shell may be gone by now; a closed inbox is fine.
            let _ = tx.send(make(slot, generation)).await;
        });
    }

    /// Cancel the slot. A pending firing will be dropped as stale.
    pub(crate) fn cancel(&mut self, slot: K) {
        self.bump(slot);
    }

    /// Whether a firing tagged `generation` is the currently armed one.
    pub(crate) fn is_current(&self, slot: K, generation: u64) -> bool {
        self.generations.get(&slot) == Some(&generation)
    }

    fn bump(&mut self, slot: K) -> u64 {
        let generation = self.generations.entry(slot).or_insert(0);
        *generation += 1;
        *generation
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum Slot {
        Retry,
        Fetch,
    }

    #[derive(Debug, PartialEq, Eq)]
    struct Fired(Slot, u64);

    #[tokio::test]
    async fn test_armed_timer_fires_current() {
        let (tx, rx) = async_channel::bounded(8);
        let mut timers: Timers<Slot, Fired> = Timers::new(tx, Fired);

        timers.arm(Slot::Retry, Duration::from_millis(10));
        let Fired(slot, generation) = rx.recv().await.unwrap();
        assert_eq!(slot, Slot::Retry);
        assert!(timers.is_current(slot, generation));
    }

    #[tokio::test]
    async fn test_canceled_timer_is_stale() {
        let (tx, rx) = async_channel::bounded(8);
        let mut timers: Timers<Slot, Fired> = Timers::new(tx, Fired);

        timers.arm(Slot::Fetch, Duration::from_millis(10));
        timers.cancel(Slot::Fetch);

        let Fired(slot, generation) = rx.recv().await.unwrap();
        assert!(!timers.is_current(slot, generation));
    }

    #[tokio::test]
    async fn test_rearm_invalidates_previous() {
        let (tx, rx) = async_channel::bounded(8);
        let mut timers: Timers<Slot, Fired> = Timers::new(tx, Fired);

        timers.arm(Slot::Retry, Duration::from_millis(10));
        timers.arm(Slot::Retry, Duration::from_millis(20));

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert!(!timers.is_current(first.0, first.1));
        assert!(timers.is_current(second.0, second.1));
    }

    #[tokio::test]
    async fn test_slots_are_independent() {
        let (tx, rx) = async_channel::bounded(8);
        let mut timers: Timers<Slot, Fired> = Timers::new(tx, Fired);

        timers.arm(Slot::Retry, Duration::from_millis(10));
        timers.arm(Slot::Fetch, Duration::from_millis(10));
        timers.cancel(Slot::Fetch);

        let mut fired = vec![rx.recv().await.unwrap(), rx.recv().await.unwrap()];
        fired.sort_by_key(|f| f.0 == Slot::Fetch);
        assert!(timers.is_current(fired[0].0, fired[0].1));
        assert!(!timers.is_current(fired[1].0, fired[1].1));
    }
}
