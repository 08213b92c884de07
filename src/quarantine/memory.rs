//! In-memory quarantine store for tests and development.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::{
    QuarantineError, QuarantineQuery, QuarantineRecord, QuarantineResult, QuarantineSink,
    QuarantineStats, Resolution,
};
use crate::messaging::MessageId;

/// Process-local [`QuarantineSink`]; records are lost on restart
///
/// ```rust
/// use dlq_reprocessor::messaging::MessageId;
/// use dlq_reprocessor::quarantine::{InMemoryQuarantineStore, QuarantineSink};
///
/// # tokio_test::block_on(async {
/// let store = InMemoryQuarantineStore::new();
/// assert!(store.is_empty().await);
/// assert!(store.get(&MessageId::new("m-1")).await.unwrap().is_none());
/// assert_eq!(store.stats().await.unwrap().total, 0);
/// # });
/// ```
#[derive(Debug, Default)]
pub struct InMemoryQuarantineStore {
    records: RwLock<HashMap<MessageId, QuarantineRecord>>,
}

impl InMemoryQuarantineStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl QuarantineSink for InMemoryQuarantineStore {
    async fn persist(&self, record: QuarantineRecord) -> QuarantineResult<()> {
        let mut records = self.records.write().await;
        let merged = match records.remove(&record.message_id) {
            Some(existing) => QuarantineRecord::merge(existing, record),
            None => record,
        };
        records.insert(merged.message_id.clone(), merged);
        Ok(())
    }

    async fn get(&self, message_id: &MessageId) -> QuarantineResult<Option<QuarantineRecord>> {
        Ok(self.records.read().await.get(message_id).cloned())
    }

    async fn list(&self, query: &QuarantineQuery) -> QuarantineResult<Vec<QuarantineRecord>> {
        let records = self.records.read().await;
        Ok(query.apply(records.values().cloned()))
    }

    async fn mark_resolved(
        &self,
        message_id: &MessageId,
        resolution: Resolution,
    ) -> QuarantineResult<QuarantineRecord> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(message_id)
            .ok_or_else(|| QuarantineError::not_found(message_id))?;
        if record.resolution.is_none() {
            record.resolution = Some(resolution);
        }
        Ok(record.clone())
    }

    async fn stats(&self) -> QuarantineResult<QuarantineStats> {
        let records = self.records.read().await;
        Ok(QuarantineStats::from_records(records.values()))
    }

    async fn purge_resolved_before(&self, cutoff: DateTime<Utc>) -> QuarantineResult<u64> {
        let mut records = self.records.write().await;
        let before = records.len();
        records.retain(|_, record| {
            record
                .resolution
                .as_ref()
                .map_or(true, |resolution| resolution.resolved_at >= cutoff)
        });
        Ok((before - records.len()) as u64)
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::FailureKind;
    use crate::quarantine::record::tests::sample_record;

    #[tokio::test]
    async fn test_persist_is_idempotent() {
        let store = InMemoryQuarantineStore::new();
        let record = sample_record("m-1", FailureKind::Poison, 1);

        store.persist(record.clone()).await.unwrap();
        store.persist(record.clone()).await.unwrap();

        assert_eq!(store.len().await, 1);
        assert_eq!(
            store.get(&MessageId::new("m-1")).await.unwrap(),
            Some(record)
        );
    }

    #[tokio::test]
    async fn test_mark_resolved_and_purge() {
        let store = InMemoryQuarantineStore::new();
        store
            .persist(sample_record("m-1", FailureKind::Transient, 3))
            .await
            .unwrap();
        store
            .persist(sample_record("m-2", FailureKind::Poison, 1))
            .await
            .unwrap();

        let resolved = store
            .mark_resolved(&MessageId::new("m-1"), Resolution::new("ops", None))
            .await
            .unwrap();
        assert!(resolved.is_resolved());

        let missing = store
            .mark_resolved(&MessageId::new("nope"), Resolution::new("ops", None))
            .await;
        assert!(matches!(missing, Err(QuarantineError::NotFound { .. })));

        let unresolved = store.list(&QuarantineQuery::unresolved()).await.unwrap();
        assert_eq!(unresolved.len(), 1);
        assert_eq!(unresolved[0].message_id.as_str(), "m-2");

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.resolved, 1);
        assert_eq!(stats.poison, 1);

        let purged = store
            .purge_resolved_before(Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(purged, 1);
        assert_eq!(store.len().await, 1);
    }
}
