//! Transfer statistics for the host stack
//!
//! Counters are plain relaxed atomics so a snapshot can be taken through a
//! shared reference from any context, including a diagnostic shell running
//! beside the interrupt handler.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters updated by the host stack
#[derive(Debug, Default)]
pub struct TransferStats {
    urbs_submitted: AtomicU64,
    urbs_completed: AtomicU64,
    urbs_retired: AtomicU64,
    urbs_failed: AtomicU64,
    naks: AtomicU64,
    stalls: AtomicU64,
    transaction_errors: AtomicU64,
    bytes_transferred: AtomicU64,
    enumerations: AtomicU64,
    start_of_frames: AtomicU64,
}

/// Point-in-time copy of [`TransferStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub urbs_submitted: u64,
    pub urbs_completed: u64,
    pub urbs_retired: u64,
    pub urbs_failed: u64,
    pub naks: u64,
    pub stalls: u64,
    pub transaction_errors: u64,
    pub bytes_transferred: u64,
    pub enumerations: u64,
    pub start_of_frames: u64,
}

impl TransferStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_submit(&self) {
        self.urbs_submitted.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a completion; `ok` is false for any nonzero result
    pub fn record_completion(&self, ok: bool, bytes: usize) {
        self.urbs_completed.fetch_add(1, Ordering::Relaxed);
        if ok {
            self.bytes_transferred
                .fetch_add(bytes as u64, Ordering::Relaxed);
        } else {
            self.urbs_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_retire(&self) {
        self.urbs_retired.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_nak(&self) {
        self.naks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stall(&self) {
        self.stalls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_transaction_error(&self) {
        self.transaction_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_enumeration(&self) {
        self.enumerations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sof(&self) {
        self.start_of_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            urbs_submitted: self.urbs_submitted.load(Ordering::Relaxed),
            urbs_completed: self.urbs_completed.load(Ordering::Relaxed),
            urbs_retired: self.urbs_retired.load(Ordering::Relaxed),
            urbs_failed: self.urbs_failed.load(Ordering::Relaxed),
            naks: self.naks.load(Ordering::Relaxed),
            stalls: self.stalls.load(Ordering::Relaxed),
            transaction_errors: self.transaction_errors.load(Ordering::Relaxed),
            bytes_transferred: self.bytes_transferred.load(Ordering::Relaxed),
            enumerations: self.enumerations.load(Ordering::Relaxed),
            start_of_frames: self.start_of_frames.load(Ordering::Relaxed),
        }
    }
}
