//! Discrete-event timer table.
//!
//! Pending events are ordered by (deadline, insertion sequence), so events due
//! at the same instant fire in the order they were scheduled. Each pending
//! event belongs to a named timer slot (`K`); a slot holds at most one event
//! and must be cancelled or expire before it can be armed again.

use embassy_time::{Duration, Instant};
use std::collections::{BTreeMap, HashMap};
use std::fmt::Debug;
use std::hash::Hash;

use crate::error::{MacError, Result};

/// Position of a pending event in the ordering: deadline first, then arming order.
type EventKey = (Instant, u64);

pub struct TimerTable<K, E> {
    pending: BTreeMap<EventKey, (K, E)>,
    armed: HashMap<K, EventKey>,
    next_seq: u64,
}

impl<K, E> Default for TimerTable<K, E>
where
    K: Copy + Eq + Hash + Debug,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, E> TimerTable<K, E>
where
    K: Copy + Eq + Hash + Debug,
{
    pub fn new() -> Self {
        Self {
            pending: BTreeMap::new(),
            armed: HashMap::new(),
            next_seq: 0,
        }
    }

    /// Arm `kind` to fire `delay` after `now`.
    ///
    /// # Returns
    /// * `Err(MacError::TimerAlreadyArmed)` if the slot still has a pending event
    pub fn arm(&mut self, kind: K, now: Instant, delay: Duration, event: E) -> Result<()> {
        if self.armed.contains_key(&kind) {
            return Err(MacError::TimerAlreadyArmed { timer: format!("{:?}", kind) });
        }
        let key = (now + delay, self.next_seq);
        self.next_seq += 1;
        self.pending.insert(key, (kind, event));
        self.armed.insert(kind, key);
        log::trace!("armed {:?} for {} us", kind, delay.as_micros());
        Ok(())
    }

    /// Cancel the pending event of `kind`. Returns whether one was running.
    pub fn cancel(&mut self, kind: K) -> bool {
        match self.armed.remove(&kind) {
            Some(key) => {
                self.pending.remove(&key);
                log::trace!("cancelled {:?}", kind);
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self, kind: K) -> bool {
        self.armed.contains_key(&kind)
    }

    /// Deadline of the pending event of `kind`, if any.
    pub fn deadline(&self, kind: K) -> Option<Instant> {
        self.armed.get(&kind).map(|(at, _)| *at)
    }

    /// Earliest deadline among all pending events.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.keys().next().map(|(at, _)| *at)
    }

    /// Remove and return the earliest event due at or before `now`.
    pub fn pop_due(&mut self, now: Instant) -> Option<(K, E)> {
        let (&key, _) = self.pending.iter().next()?;
        if key.0 > now {
            return None;
        }
        let (kind, event) = self.pending.remove(&key)?;
        self.armed.remove(&kind);
        Some((kind, event))
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum Slot {
        A,
        B,
        C,
    }

    fn t(us: u64) -> Instant {
        Instant::from_micros(us)
    }

    #[test]
    fn same_instant_events_fire_in_schedule_order() {
        let mut table = TimerTable::new();
        table.arm(Slot::B, t(0), Duration::from_micros(10), "b").unwrap();
        table.arm(Slot::A, t(0), Duration::from_micros(10), "a").unwrap();
        table.arm(Slot::C, t(0), Duration::from_micros(5), "c").unwrap();

        assert_eq!(table.next_deadline(), Some(t(5)));
        assert_eq!(table.pop_due(t(4)), None);
        assert_eq!(table.pop_due(t(10)), Some((Slot::C, "c")));
        assert_eq!(table.pop_due(t(10)), Some((Slot::B, "b")));
        assert_eq!(table.pop_due(t(10)), Some((Slot::A, "a")));
        assert!(table.is_empty());
    }

    #[test]
    fn rearming_requires_cancel_or_expiry() {
        let mut table = TimerTable::new();
        table.arm(Slot::A, t(0), Duration::from_micros(10), 1).unwrap();
        let err = table.arm(Slot::A, t(0), Duration::from_micros(20), 2).unwrap_err();
        assert!(matches!(err, MacError::TimerAlreadyArmed { .. }));

        assert!(table.cancel(Slot::A));
        assert!(!table.cancel(Slot::A));
        table.arm(Slot::A, t(0), Duration::from_micros(20), 3).unwrap();

        assert_eq!(table.pop_due(t(20)), Some((Slot::A, 3)));
        assert!(!table.is_running(Slot::A));
        table.arm(Slot::A, t(20), Duration::from_micros(1), 4).unwrap();
        assert_eq!(table.deadline(Slot::A), Some(t(21)));
    }

    #[test]
    fn cancelled_event_never_fires() {
        let mut table = TimerTable::new();
        table.arm(Slot::A, t(0), Duration::from_micros(10), ()).unwrap();
        table.arm(Slot::B, t(0), Duration::from_micros(30), ()).unwrap();
        table.cancel(Slot::A);
        assert_eq!(table.len(), 1);
        assert_eq!(table.next_deadline(), Some(t(30)));
        assert_eq!(table.pop_due(t(29)), None);
        assert_eq!(table.pop_due(t(30)), Some((Slot::B, ())));
    }
}
