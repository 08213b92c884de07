//! Operator surface over the quarantine store.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{info, instrument};

use super::{
    QuarantineError, QuarantineQuery, QuarantineRecord, QuarantineSink, QuarantineStats, Resolution,
};
use crate::error::Result;
use crate::messaging::{BrokerClient, MessageId};
use crate::scheduler::RedeliveryRouter;

/// Manual triage of quarantined messages: inspect, resolve, replay, purge
pub struct TriageService {
    sink: Arc<dyn QuarantineSink>,
    broker: Arc<dyn BrokerClient>,
    router: RedeliveryRouter,
    /// Attributes dropped from replayed copies
    strip_attributes: Vec<String>,
}

impl std::fmt::Debug for TriageService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TriageService")
            .field("sink", &self.sink.backend_name())
            .field("broker", &self.broker.provider_name())
            .field("router", &self.router)
            .finish()
    }
}

impl TriageService {
    pub fn new(
        sink: Arc<dyn QuarantineSink>,
        broker: Arc<dyn BrokerClient>,
        router: RedeliveryRouter,
        strip_attributes: Vec<String>,
    ) -> Self {
        Self {
            sink,
            broker,
            router,
            strip_attributes,
        }
    }

    pub async fn list(&self, query: &QuarantineQuery) -> Result<Vec<QuarantineRecord>> {
        Ok(self.sink.list(query).await?)
    }

    pub async fn get(&self, message_id: &MessageId) -> Result<Option<QuarantineRecord>> {
        Ok(self.sink.get(message_id).await?)
    }

    pub async fn stats(&self) -> Result<QuarantineStats> {
        Ok(self.sink.stats().await?)
    }

    #[instrument(skip(self, note), fields(message_id = %message_id))]
    pub async fn mark_resolved(
        &self,
        message_id: &MessageId,
        operator: &str,
        note: Option<String>,
    ) -> Result<QuarantineRecord> {
        let record = self
            .sink
            .mark_resolved(message_id, Resolution::new(operator, note))
            .await?;
        info!(operator, "Quarantined message marked resolved");
        Ok(record)
    }

    /// Republish a quarantined payload to its original topic and resolve it
    ///
    /// Fails for records that are already resolved or whose original topic
    /// cannot be determined. The record is only resolved once the publish
    /// succeeded.
    #[instrument(skip(self), fields(message_id = %message_id))]
    pub async fn replay(&self, message_id: &MessageId, operator: &str) -> Result<QuarantineRecord> {
        let record = self
            .sink
            .get(message_id)
            .await?
            .ok_or_else(|| QuarantineError::not_found(message_id))?;

        if record.is_resolved() {
            return Err(QuarantineError::invalid_operation(message_id, "already resolved").into());
        }

        let topic = self.router.resolve_topic(&record.envelope).ok_or_else(|| {
            QuarantineError::invalid_operation(message_id, "original topic is unknown")
        })?;

        let outbound = self
            .router
            .replay_message(&record.envelope, &topic, &self.strip_attributes);
        let published_id = self.broker.publish(&topic, outbound).await?;

        let mut resolution = Resolution::new(operator, Some(format!("replayed as {published_id}")));
        resolution.replayed_to = Some(topic.clone());
        let resolved = self.sink.mark_resolved(message_id, resolution).await?;

        info!(
            operator,
            topic = %topic,
            published_id = %published_id,
            "Quarantined message replayed"
        );
        Ok(resolved)
    }

    /// Delete records resolved more than `age` ago
    pub async fn purge_resolved_older_than(&self, age: Duration) -> Result<u64> {
        let age = chrono::Duration::from_std(age).unwrap_or(chrono::Duration::MAX);
        let cutoff = Utc::now()
            .checked_sub_signed(age)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let purged = self.sink.purge_resolved_before(cutoff).await?;
        info!(purged, "Purged resolved quarantine records");
        Ok(purged)
    }
}
