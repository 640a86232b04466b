//! URB queues
//!
//! Control and bulk URBs wait in a plain FIFO. Interrupt and isochronous
//! URBs stay registered in a due-frame ordered map for as long as they are
//! alive; every time one is handed out it is re-registered one polling
//! interval later.

use crate::urb::UrbId;
use std::collections::{BTreeMap, HashMap, VecDeque};

/// Ordering key of a periodic URB: due frame, then registration order
type PeriodicKey = (u64, u64);

#[derive(Debug, Clone, Copy)]
struct PeriodicEntry {
    urb: UrbId,
    interval: u64,
}

#[derive(Debug, Default)]
pub struct Scheduler {
    nonperiodic: VecDeque<UrbId>,
    periodic: BTreeMap<PeriodicKey, PeriodicEntry>,
    keys: HashMap<UrbId, PeriodicKey>,
    sequence: u64,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue_nonperiodic(&mut self, urb: UrbId) {
        self.nonperiodic.push_back(urb);
    }

    /// Register a periodic URB, first due at `due`
    pub fn register_periodic(&mut self, urb: UrbId, due: u64, interval: u16) {
        self.remove_periodic(urb);
        let key = (due, self.sequence);
        self.sequence += 1;
        self.periodic.insert(
            key,
            PeriodicEntry {
                urb,
                interval: interval.max(1) as u64,
            },
        );
        self.keys.insert(urb, key);
    }

    fn remove_periodic(&mut self, urb: UrbId) -> bool {
        match self.keys.remove(&urb) {
            Some(key) => self.periodic.remove(&key).is_some(),
            None => false,
        }
    }

    /// Forget a URB wherever it is queued
    pub fn remove(&mut self, urb: UrbId) -> bool {
        if self.remove_periodic(urb) {
            return true;
        }
        let before = self.nonperiodic.len();
        self.nonperiodic.retain(|id| *id != urb);
        self.nonperiodic.len() != before
    }

    pub fn contains(&self, urb: UrbId) -> bool {
        self.keys.contains_key(&urb) || self.nonperiodic.contains(&urb)
    }

    /// Frame a periodic URB is next due in
    pub fn next_due(&self, urb: UrbId) -> Option<u64> {
        self.keys.get(&urb).map(|(due, _)| *due)
    }

    pub fn nonperiodic_len(&self) -> usize {
        self.nonperiodic.len()
    }

    /// Whether any periodic URB is due by `now` and `runnable`
    pub fn has_due_periodic(&self, now: u64, mut runnable: impl FnMut(UrbId) -> bool) -> bool {
        self.periodic
            .range(..(now + 1, 0))
            .any(|(_, entry)| runnable(entry.urb))
    }

    /// Hand out the earliest due periodic URB that `runnable` accepts and
    /// re-register it at (due + interval)
    pub fn next_periodic(
        &mut self,
        now: u64,
        mut runnable: impl FnMut(UrbId) -> bool,
    ) -> Option<UrbId> {
        let (key, entry) = self
            .periodic
            .range(..(now + 1, 0))
            .find(|(_, entry)| runnable(entry.urb))
            .map(|(key, entry)| (*key, *entry))?;

        self.periodic.remove(&key);
        let next = (key.0 + entry.interval, self.sequence);
        self.sequence += 1;
        self.periodic.insert(next, entry);
        self.keys.insert(entry.urb, next);
        Some(entry.urb)
    }

    /// Hand out the head of the FIFO if `runnable` accepts it. The head is
    /// never skipped, so arrival order is kept.
    pub fn next_nonperiodic(&mut self, runnable: impl FnOnce(UrbId) -> bool) -> Option<UrbId> {
        let head = *self.nonperiodic.front()?;
        if runnable(head) {
            self.nonperiodic.pop_front()
        } else {
            None
        }
    }
}
