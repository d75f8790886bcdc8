//! Sync Worker - 消费联系信息变更事件
//!
//! 从通道拉取信封，每个 userId 分区同时只有一个在处理，分区之间并发。
//!
//! Per delivery:
//! 1. Undecodable or unknown schema: poison, dead-letter immediately
//! 2. Event id already processed inside the dedup window: ack
//! 3. Apply to every order of the user through the version gate
//! 4. Success: remember the event id, then ack
//! 5. Transient failure: nack with backoff, or dead-letter once the
//!    redelivery ceiling is reached

use futures::future::join_all;
use message_bus::{Delivery, EventChannel};
use serde::Serialize;
use shared::util::now_millis;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use super::applier::{OrderSyncApplier, SyncReport};
use super::error::SyncError;
use super::policy::ReconciliationPolicy;

/// How often processed event ids are pruned
const DEDUP_PRUNE_INTERVAL: Duration = Duration::from_secs(600);

/// What happened to one delivery
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "camelCase")]
pub enum DeliveryOutcome {
    /// Applied (or found stale) and acknowledged
    Acked { seq: u64, report: SyncReport },
    /// Seen before, acknowledged without touching orders
    Duplicate { seq: u64 },
    /// Released for redelivery after `retry_after_ms`
    Retrying {
        seq: u64,
        delivery_count: u32,
        retry_after_ms: u64,
    },
    DeadLettered { seq: u64, reason: String },
}

/// Result of one poll cycle
#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    pub outcomes: Vec<DeliveryOutcome>,
}

impl BatchReport {
    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    pub fn acked(&self) -> usize {
        self.count(|o| matches!(o, DeliveryOutcome::Acked { .. }))
    }

    pub fn duplicates(&self) -> usize {
        self.count(|o| matches!(o, DeliveryOutcome::Duplicate { .. }))
    }

    pub fn retrying(&self) -> usize {
        self.count(|o| matches!(o, DeliveryOutcome::Retrying { .. }))
    }

    pub fn dead_lettered(&self) -> usize {
        self.count(|o| matches!(o, DeliveryOutcome::DeadLettered { .. }))
    }

    fn count(&self, f: impl Fn(&DeliveryOutcome) -> bool) -> usize {
        self.outcomes.iter().filter(|o| f(o)).count()
    }
}

/// Channel consumer with injected channel and store handles
pub struct SyncWorker {
    channel: Arc<dyn EventChannel>,
    applier: OrderSyncApplier,
    policy: ReconciliationPolicy,
}

impl SyncWorker {
    pub fn new(
        channel: Arc<dyn EventChannel>,
        applier: OrderSyncApplier,
        policy: ReconciliationPolicy,
    ) -> Self {
        Self {
            channel,
            applier,
            policy,
        }
    }

    /// Run until `shutdown` is cancelled
    ///
    /// Drains ready deliveries back to back, then waits for the channel to
    /// signal new work or for the poll interval to pass.
    pub async fn run(self, shutdown: CancellationToken) {
        tracing::info!(
            batch_size = self.policy.batch_size,
            max_redeliveries = self.policy.max_redeliveries,
            "Sync worker started"
        );

        let mut last_prune: Option<Instant> = None;

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            if last_prune.is_none_or(|t| t.elapsed() >= DEDUP_PRUNE_INTERVAL) {
                self.prune_dedup();
                last_prune = Some(Instant::now());
            }

            let idle = match self.run_once().await {
                Ok(batch) => batch.is_empty(),
                Err(e) => {
                    tracing::error!(error = %e, "Failed to poll channel");
                    true
                }
            };

            if idle {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = self.channel.wait_ready(self.policy.poll_interval) => {}
                }
            }
        }

        tracing::info!("Sync worker stopped");
    }

    /// Lease one batch of partition heads and process them concurrently
    pub async fn run_once(&self) -> Result<BatchReport, message_bus::ChannelError> {
        let deliveries = self.channel.poll(self.policy.batch_size).await?;
        if deliveries.is_empty() {
            return Ok(BatchReport::default());
        }

        let outcomes = join_all(deliveries.iter().map(|d| self.handle_delivery(d))).await;
        Ok(BatchReport { outcomes })
    }

    async fn handle_delivery(&self, delivery: &Delivery) -> DeliveryOutcome {
        match self.process(delivery).await {
            Ok(outcome) => outcome,
            Err(SyncError::Transient(reason)) => self.retry_later(delivery, reason).await,
            Err(e) => {
                tracing::error!(
                    seq = delivery.seq,
                    partition = %delivery.partition_key,
                    error = %e,
                    "Envelope can never be applied"
                );
                self.dead_letter(delivery, e.to_string()).await
            }
        }
    }

    /// Decode, dedup and apply one delivery, acking on success
    async fn process(&self, delivery: &Delivery) -> Result<DeliveryOutcome, SyncError> {
        let envelope = delivery.envelope()?;

        let event_id = envelope.event_id.to_string();
        match self.applier.store().is_event_processed(&event_id) {
            Ok(true) => {
                tracing::debug!(seq = delivery.seq, event_id = %event_id, "Duplicate envelope skipped");
                self.ack(delivery).await;
                return Ok(DeliveryOutcome::Duplicate { seq: delivery.seq });
            }
            Ok(false) => {}
            // The version gate still protects the orders
            Err(e) => tracing::warn!(event_id = %event_id, error = %e, "Dedup lookup failed"),
        }

        let report = self.applier.apply(&envelope).await?;
        if let Err(e) = self
            .applier
            .store()
            .record_processed_event(&event_id, now_millis())
        {
            tracing::warn!(event_id = %event_id, error = %e, "Failed to record processed event");
        }
        self.ack(delivery).await;
        tracing::info!(
            seq = delivery.seq,
            user_id = %envelope.user_id,
            user_version = envelope.user_version,
            matched = report.matched,
            applied = report.applied,
            stale = report.stale,
            "Envelope applied"
        );
        Ok(DeliveryOutcome::Acked {
            seq: delivery.seq,
            report,
        })
    }

    /// Nack with backoff, or dead-letter once the redelivery ceiling is reached
    async fn retry_later(&self, delivery: &Delivery, reason: String) -> DeliveryOutcome {
        if self.policy.should_dead_letter(delivery.delivery_count) {
            tracing::error!(
                seq = delivery.seq,
                partition = %delivery.partition_key,
                delivery_count = delivery.delivery_count,
                reason = %reason,
                "Max redeliveries exceeded"
            );
            let reason = format!(
                "max redeliveries ({}) exceeded: {}",
                self.policy.max_redeliveries, reason
            );
            return self.dead_letter(delivery, reason).await;
        }

        let retry_after = self.policy.redelivery_delay(delivery.delivery_count);
        tracing::warn!(
            seq = delivery.seq,
            partition = %delivery.partition_key,
            delivery_count = delivery.delivery_count,
            retry_after_ms = retry_after.as_millis() as u64,
            reason = %reason,
            "Envelope processing failed, will redeliver"
        );
        if let Err(e) = self.channel.nack(delivery, retry_after, &reason).await {
            tracing::error!(seq = delivery.seq, error = %e, "Failed to nack delivery");
        }
        DeliveryOutcome::Retrying {
            seq: delivery.seq,
            delivery_count: delivery.delivery_count,
            retry_after_ms: retry_after.as_millis() as u64,
        }
    }

    async fn ack(&self, delivery: &Delivery) {
        // An ack that fails leads to a redelivery, which the dedup table or the
        // version gate turns into a no-op
        if let Err(e) = self.channel.ack(delivery).await {
            tracing::error!(seq = delivery.seq, error = %e, "Failed to ack delivery");
        }
    }

    async fn dead_letter(&self, delivery: &Delivery, reason: String) -> DeliveryOutcome {
        if let Err(e) = self.channel.dead_letter(delivery, &reason).await {
            tracing::error!(seq = delivery.seq, error = %e, "Failed to dead-letter delivery");
        }
        DeliveryOutcome::DeadLettered {
            seq: delivery.seq,
            reason,
        }
    }

    fn prune_dedup(&self) {
        let cutoff = now_millis().saturating_sub(self.policy.dedup_window_millis());
        match self.applier.store().prune_processed_events(cutoff) {
            Ok(0) => {}
            Ok(n) => tracing::debug!(count = n, "Pruned processed event ids"),
            Err(e) => tracing::warn!(error = %e, "Failed to prune processed event ids"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use message_bus::{EnvelopeChannelExt, RedbChannel, RetryPolicy};
    use shared::message::EventEnvelope;
    use shared::models::{ContactInfo, Order};
    use std::sync::atomic::{AtomicBool, Ordering};

    use crate::storage::tests::{contact, order_create};
    use crate::storage::{CasOutcome, OrderStorage, OrderStore, StorageError, StorageResult};

    /// Store whose conditional update fails while `failing` is set
    struct FailingStore {
        inner: OrderStorage,
        failing: AtomicBool,
    }

    impl OrderStore for FailingStore {
        fn find_by_user_id(&self, user_id: &str) -> StorageResult<Vec<Order>> {
            self.inner.find_by_user_id(user_id)
        }
        fn find_by_order_id(&self, order_id: &str) -> StorageResult<Option<Order>> {
            self.inner.find_by_order_id(order_id)
        }
        fn list_orders(&self) -> StorageResult<Vec<Order>> {
            self.inner.list_orders()
        }
        fn apply_contact_update(
            &self,
            order_id: &str,
            contact: &ContactInfo,
            user_version: u64,
            now: i64,
        ) -> StorageResult<CasOutcome> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(StorageError::Unavailable("disk on fire".to_string()));
            }
            self.inner
                .apply_contact_update(order_id, contact, user_version, now)
        }
        fn is_event_processed(&self, event_id: &str) -> StorageResult<bool> {
            self.inner.is_event_processed(event_id)
        }
        fn record_processed_event(&self, event_id: &str, at: i64) -> StorageResult<()> {
            self.inner.record_processed_event(event_id, at)
        }
        fn prune_processed_events(&self, older_than: i64) -> StorageResult<usize> {
            self.inner.prune_processed_events(older_than)
        }
    }

    fn test_policy() -> ReconciliationPolicy {
        ReconciliationPolicy {
            store_retry: RetryPolicy::immediate(2),
            redelivery_backoff: RetryPolicy::immediate(10),
            ..Default::default()
        }
    }

    fn worker(channel: Arc<dyn EventChannel>, store: Arc<dyn OrderStore>) -> SyncWorker {
        let policy = test_policy();
        let applier = OrderSyncApplier::new(store, policy.store_retry);
        SyncWorker::new(channel, applier, policy)
    }

    fn envelope(version: u64, street: &str) -> EventEnvelope {
        EventEnvelope::new("u1", version, contact("a@x.com", street))
    }

    #[tokio::test]
    async fn test_applies_and_acks() {
        let channel = Arc::new(RedbChannel::open_in_memory().unwrap());
        let storage = OrderStorage::open_in_memory().unwrap();
        let order = storage.create(order_create("u1", Some(1))).unwrap();
        let worker = worker(channel.clone(), Arc::new(storage.clone()));

        let env = envelope(2, "A St");
        channel.send_envelope(&env).await.unwrap();

        let batch = worker.run_once().await.unwrap();
        assert_eq!(batch.acked(), 1);
        assert_eq!(channel.pending_count().await.unwrap(), 0);
        assert!(storage.is_event_processed(&env.event_id.to_string()).unwrap());

        let stored = storage.find_by_order_id(&order.order_id).unwrap().unwrap();
        assert_eq!(stored.delivery_address.street, "A St");
        assert_eq!(stored.last_synced_user_version, 2);
    }

    #[tokio::test]
    async fn test_partition_order_preserved() {
        let channel = Arc::new(RedbChannel::open_in_memory().unwrap());
        let storage = OrderStorage::open_in_memory().unwrap();
        let order = storage.create(order_create("u1", Some(1))).unwrap();
        let worker = worker(channel.clone(), Arc::new(storage.clone()));

        channel.send_envelope(&envelope(2, "A St")).await.unwrap();
        channel.send_envelope(&envelope(3, "B St")).await.unwrap();

        // One head per partition per poll
        assert_eq!(worker.run_once().await.unwrap().acked(), 1);
        assert_eq!(worker.run_once().await.unwrap().acked(), 1);
        assert!(worker.run_once().await.unwrap().is_empty());

        let stored = storage.find_by_order_id(&order.order_id).unwrap().unwrap();
        assert_eq!(stored.delivery_address.street, "B St");
        assert_eq!(stored.last_synced_user_version, 3);
    }

    #[tokio::test]
    async fn test_duplicate_event_id_is_short_circuited() {
        let channel = Arc::new(RedbChannel::open_in_memory().unwrap());
        let storage = OrderStorage::open_in_memory().unwrap();
        storage.create(order_create("u1", Some(1))).unwrap();
        let worker = worker(channel.clone(), Arc::new(storage.clone()));

        let env = envelope(2, "A St");
        channel.send_envelope(&env).await.unwrap();
        channel.send_envelope(&env).await.unwrap();

        assert_eq!(worker.run_once().await.unwrap().acked(), 1);
        assert_eq!(worker.run_once().await.unwrap().duplicates(), 1);
        assert_eq!(channel.pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_crash_before_ack_is_noop_on_redelivery() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("channel.redb");
        let storage = OrderStorage::open_in_memory().unwrap();
        let order = storage.create(order_create("u1", Some(1))).unwrap();
        let applier = OrderSyncApplier::new(Arc::new(storage.clone()), RetryPolicy::immediate(1));

        {
            let channel = RedbChannel::open(&path).unwrap();
            channel.send_envelope(&envelope(2, "A St")).await.unwrap();
            // Apply, then crash before the processed-event record and the ack
            let delivery = channel.poll(1).await.unwrap().remove(0);
            applier.apply(&delivery.envelope().unwrap()).await.unwrap();
        }
        let applied = storage.find_by_order_id(&order.order_id).unwrap().unwrap();

        let channel = Arc::new(RedbChannel::open(&path).unwrap());
        let worker = worker(channel.clone(), Arc::new(storage.clone()));
        let batch = worker.run_once().await.unwrap();

        match &batch.outcomes[..] {
            [DeliveryOutcome::Acked { report, .. }] => {
                assert_eq!(report.applied, 0);
                assert_eq!(report.stale, 1);
            }
            other => panic!("unexpected outcomes: {other:?}"),
        }
        let after = storage.find_by_order_id(&order.order_id).unwrap().unwrap();
        assert_eq!(after, applied);
        assert_eq!(channel.pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_poison_after_max_redeliveries() {
        let channel = Arc::new(RedbChannel::open_in_memory().unwrap());
        let inner = OrderStorage::open_in_memory().unwrap();
        let order = inner.create(order_create("u1", Some(1))).unwrap();
        let store = Arc::new(FailingStore {
            inner: inner.clone(),
            failing: AtomicBool::new(true),
        });
        let worker = worker(channel.clone(), store);

        channel.send_envelope(&envelope(2, "A St")).await.unwrap();

        for attempt in 1..10 {
            let batch = worker.run_once().await.unwrap();
            assert_eq!(batch.retrying(), 1, "delivery {attempt} should be retried");
        }
        let batch = worker.run_once().await.unwrap();
        assert_eq!(batch.dead_lettered(), 1);

        let dead = channel.dead_letters().await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].delivery_count, 10);
        assert_eq!(channel.pending_count().await.unwrap(), 0);

        let unchanged = inner.find_by_order_id(&order.order_id).unwrap().unwrap();
        assert_eq!(unchanged, order);
    }

    #[tokio::test]
    async fn test_recovers_when_store_comes_back() {
        let channel = Arc::new(RedbChannel::open_in_memory().unwrap());
        let inner = OrderStorage::open_in_memory().unwrap();
        let order = inner.create(order_create("u1", Some(1))).unwrap();
        let store = Arc::new(FailingStore {
            inner: inner.clone(),
            failing: AtomicBool::new(true),
        });
        let worker = worker(channel.clone(), store.clone());

        channel.send_envelope(&envelope(2, "A St")).await.unwrap();
        assert_eq!(worker.run_once().await.unwrap().retrying(), 1);

        store.failing.store(false, Ordering::SeqCst);
        assert_eq!(worker.run_once().await.unwrap().acked(), 1);

        let stored = inner.find_by_order_id(&order.order_id).unwrap().unwrap();
        assert_eq!(stored.last_synced_user_version, 2);
    }

    #[tokio::test]
    async fn test_undecodable_payload_is_dead_lettered_immediately() {
        let channel = Arc::new(RedbChannel::open_in_memory().unwrap());
        let storage = OrderStorage::open_in_memory().unwrap();
        let worker = worker(channel.clone(), Arc::new(storage));

        channel.send("u1", b"{\"garbage\":true}").await.unwrap();

        let batch = worker.run_once().await.unwrap();
        assert_eq!(batch.dead_lettered(), 1);
        let dead = channel.dead_letters().await.unwrap();
        assert_eq!(dead[0].delivery_count, 1);
        assert!(dead[0].reason.contains("malformed"));
    }

    #[tokio::test]
    async fn test_unsupported_schema_is_dead_lettered_without_retry() {
        let channel = Arc::new(RedbChannel::open_in_memory().unwrap());
        let storage = OrderStorage::open_in_memory().unwrap();
        let order = storage.create(order_create("u1", Some(1))).unwrap();
        let worker = worker(channel.clone(), Arc::new(storage.clone()));

        let mut env = envelope(2, "A St");
        env.schema_version = 99;
        channel
            .send("u1", &serde_json::to_vec(&env).unwrap())
            .await
            .unwrap();

        let batch = worker.run_once().await.unwrap();
        match &batch.outcomes[..] {
            [DeliveryOutcome::DeadLettered { reason, .. }] => {
                assert!(reason.starts_with("poison message"));
                assert!(reason.contains("schema version 99"));
            }
            other => panic!("unexpected outcomes: {other:?}"),
        }
        assert_eq!(channel.pending_count().await.unwrap(), 0);
        assert!(!storage.is_event_processed(&env.event_id.to_string()).unwrap());

        let unchanged = storage.find_by_order_id(&order.order_id).unwrap().unwrap();
        assert_eq!(unchanged, order);
    }

    #[tokio::test]
    async fn test_partitions_processed_in_parallel() {
        let channel = Arc::new(RedbChannel::open_in_memory().unwrap());
        let storage = OrderStorage::open_in_memory().unwrap();
        storage.create(order_create("u1", Some(0))).unwrap();
        storage.create(order_create("u2", Some(0))).unwrap();
        let worker = worker(channel.clone(), Arc::new(storage.clone()));

        for user in ["u1", "u2"] {
            let env = EventEnvelope::new(user, 1, contact("a@x.com", "A St"));
            channel.send_envelope(&env).await.unwrap();
        }

        let batch = worker.run_once().await.unwrap();
        assert_eq!(batch.acked(), 2);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let channel = Arc::new(RedbChannel::open_in_memory().unwrap());
        let storage = OrderStorage::open_in_memory().unwrap();
        let order = storage.create(order_create("u1", Some(1))).unwrap();
        let worker = worker(channel.clone(), Arc::new(storage.clone()));

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(worker.run(shutdown.clone()));

        channel.send_envelope(&envelope(2, "A St")).await.unwrap();

        let mut synced = false;
        for _ in 0..100 {
            let stored = storage.find_by_order_id(&order.order_id).unwrap().unwrap();
            if stored.last_synced_user_version == 2 {
                synced = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(synced);

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
