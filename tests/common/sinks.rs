//! Quarantine sinks with controllable failures

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dlq_reprocessor::messaging::MessageId;
use dlq_reprocessor::quarantine::{
    InMemoryQuarantineStore, QuarantineError, QuarantineQuery, QuarantineRecord, QuarantineResult,
    QuarantineSink, QuarantineStats, Resolution,
};

/// In-memory store whose first `failures` writes fail, optionally slowed down
#[derive(Debug, Default)]
pub struct FlakySink {
    inner: InMemoryQuarantineStore,
    failures: AtomicUsize,
    write_delay: Option<Duration>,
    pub attempts: AtomicUsize,
}

impl FlakySink {
    pub fn failing(failures: usize) -> Self {
        Self {
            failures: AtomicUsize::new(failures),
            ..Self::default()
        }
    }

    pub fn slow(write_delay: Duration) -> Self {
        Self {
            write_delay: Some(write_delay),
            ..Self::default()
        }
    }

    pub fn write_attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl QuarantineSink for FlakySink {
    async fn persist(&self, record: QuarantineRecord) -> QuarantineResult<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.write_delay {
            tokio::time::sleep(delay).await;
        }
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(QuarantineError::backend_unavailable("flaky", "store offline"));
        }
        self.inner.persist(record).await
    }

    async fn get(&self, message_id: &MessageId) -> QuarantineResult<Option<QuarantineRecord>> {
        self.inner.get(message_id).await
    }

    async fn list(&self, query: &QuarantineQuery) -> QuarantineResult<Vec<QuarantineRecord>> {
        self.inner.list(query).await
    }

    async fn mark_resolved(
        &self,
        message_id: &MessageId,
        resolution: Resolution,
    ) -> QuarantineResult<QuarantineRecord> {
        self.inner.mark_resolved(message_id, resolution).await
    }

    async fn stats(&self) -> QuarantineResult<QuarantineStats> {
        self.inner.stats().await
    }

    async fn purge_resolved_before(&self, cutoff: DateTime<Utc>) -> QuarantineResult<u64> {
        self.inner.purge_resolved_before(cutoff).await
    }

    fn backend_name(&self) -> &'static str {
        "flaky"
    }
}
