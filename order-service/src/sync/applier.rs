//! Contact change applier
//!
//! Applies one user contact state to every order of that user through the
//! store's conditional update. Shared by the channel consumer and the
//! reconciliation sweep so both obey the same version gate.

use message_bus::RetryPolicy;
use serde::Serialize;
use shared::message::EventEnvelope;
use shared::models::ContactInfo;
use shared::util::now_millis;
use std::sync::Arc;

use super::error::SyncError;
use crate::storage::{CasOutcome, OrderStore, StorageResult};

/// Per-envelope application counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    /// Orders referencing the user
    pub matched: usize,
    pub applied: usize,
    /// Discarded by the version gate
    pub stale: usize,
    /// Deleted between lookup and update
    pub missing: usize,
}

impl SyncReport {
    fn record(&mut self, outcome: CasOutcome) {
        match outcome {
            CasOutcome::Applied { .. } => self.applied += 1,
            CasOutcome::Stale { .. } => self.stale += 1,
            CasOutcome::Missing => self.missing += 1,
        }
    }
}

#[derive(Clone)]
pub struct OrderSyncApplier {
    store: Arc<dyn OrderStore>,
    retry: RetryPolicy,
}

impl OrderSyncApplier {
    pub fn new(store: Arc<dyn OrderStore>, retry: RetryPolicy) -> Self {
        Self { store, retry }
    }

    pub fn store(&self) -> &Arc<dyn OrderStore> {
        &self.store
    }

    pub async fn apply(&self, envelope: &EventEnvelope) -> Result<SyncReport, SyncError> {
        self.apply_contact(&envelope.user_id, &envelope.contact(), envelope.user_version)
            .await
    }

    /// Offer `contact` at `user_version` to every order of `user_id`
    ///
    /// Returns only after every matching order has either taken the update or
    /// rejected it as stale. A store failure that outlives the retry budget
    /// aborts with [`SyncError::Transient`]; orders already updated keep their
    /// new state and are skipped as stale on the next delivery.
    pub async fn apply_contact(
        &self,
        user_id: &str,
        contact: &ContactInfo,
        user_version: u64,
    ) -> Result<SyncReport, SyncError> {
        let orders = self
            .with_retry("find_by_user_id", || self.store.find_by_user_id(user_id))
            .await?;

        let mut report = SyncReport {
            matched: orders.len(),
            ..Default::default()
        };

        for order in &orders {
            if user_version <= order.last_synced_user_version {
                report.stale += 1;
                continue;
            }
            let outcome = self
                .with_retry("apply_contact_update", || {
                    self.store.apply_contact_update(
                        &order.order_id,
                        contact,
                        user_version,
                        now_millis(),
                    )
                })
                .await?;

            if let CasOutcome::Applied { previous_version } = outcome {
                tracing::debug!(
                    order_id = %order.order_id,
                    user_id = %user_id,
                    from_version = previous_version,
                    to_version = user_version,
                    "Order contact synced"
                );
            }
            report.record(outcome);
        }

        Ok(report)
    }

    async fn with_retry<T>(
        &self,
        op: &'static str,
        mut f: impl FnMut() -> StorageResult<T>,
    ) -> Result<T, SyncError> {
        let mut attempts = 0;
        loop {
            attempts += 1;
            let err = match f() {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            if !self.retry.can_retry(attempts) {
                tracing::error!(op, attempts, error = %err, "Store retries exhausted");
                return Err(err.into());
            }

            let delay = self.retry.delay_for(attempts);
            tracing::warn!(
                op,
                attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Store operation failed, retrying"
            );
            drop(err);
            tokio::time::sleep(delay).await;
        }
    }
}
