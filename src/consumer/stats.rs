//! Atomic counters for the consumer loop.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Live counters, shared between the listener, workers and the engine
#[derive(Debug, Default)]
pub struct ConsumerStats {
    pub pulls: AtomicU64,
    pub pull_errors: AtomicU64,
    pub received: AtomicU64,
    pub acked: AtomicU64,
    pub nacked: AtomicU64,
    pub ack_failures: AtomicU64,
    pub redelivered: AtomicU64,
    pub dispatched: AtomicU64,
    pub held: AtomicU64,
    pub deferred: AtomicU64,
    pub quarantined: AtomicU64,
    pub duplicates: AtomicU64,
    pub publish_failures: AtomicU64,
    pub persistence_failures: AtomicU64,
    pub invariant_violations: AtomicU64,
    pub timeouts: AtomicU64,
    pub panics: AtomicU64,
    /// Idle attempt records dropped by maintenance
    pub evicted_records: AtomicU64,
}

/// Point-in-time copy of [`ConsumerStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConsumerStatsSnapshot {
    pub pulls: u64,
    pub pull_errors: u64,
    pub received: u64,
    pub acked: u64,
    pub nacked: u64,
    pub ack_failures: u64,
    pub redelivered: u64,
    pub dispatched: u64,
    pub held: u64,
    pub deferred: u64,
    pub quarantined: u64,
    pub duplicates: u64,
    pub publish_failures: u64,
    pub persistence_failures: u64,
    pub invariant_violations: u64,
    pub timeouts: u64,
    pub panics: u64,
    pub evicted_records: u64,
}

impl ConsumerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ConsumerStatsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        ConsumerStatsSnapshot {
            pulls: load(&self.pulls),
            pull_errors: load(&self.pull_errors),
            received: load(&self.received),
            acked: load(&self.acked),
            nacked: load(&self.nacked),
            ack_failures: load(&self.ack_failures),
            redelivered: load(&self.redelivered),
            dispatched: load(&self.dispatched),
            held: load(&self.held),
            deferred: load(&self.deferred),
            quarantined: load(&self.quarantined),
            duplicates: load(&self.duplicates),
            publish_failures: load(&self.publish_failures),
            persistence_failures: load(&self.persistence_failures),
            invariant_violations: load(&self.invariant_violations),
            timeouts: load(&self.timeouts),
            panics: load(&self.panics),
            evicted_records: load(&self.evicted_records),
        }
    }
}

impl ConsumerStatsSnapshot {
    /// Deliveries that reached an ack or nack
    pub fn settled(&self) -> u64 {
        self.acked + self.nacked
    }
}
