//! Reconciliation sweep
//!
//! Catches orders the channel never fixed: publishes that degraded, envelopes
//! that were dead-lettered, orders created with an unknown user version.
//! Re-fetches the user and re-applies through the same conditional update the
//! consumer uses, so a sweep racing a live envelope can never regress an order.

use async_trait::async_trait;
use serde::Serialize;
use shared::models::{Order, User};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::applier::{OrderSyncApplier, SyncReport};
use super::error::SyncError;
use super::policy::ReconciliationPolicy;

/// Source of truth for current user state
#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn fetch_user(&self, user_id: &str) -> Result<Option<User>, SyncError>;
}

/// [`UserDirectory`] over the user service REST API
#[derive(Debug, Clone)]
pub struct HttpUserDirectory {
    client: reqwest::Client,
    base_url: String,
}

impl HttpUserDirectory {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, SyncError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SyncError::Transient(format!("http client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl UserDirectory for HttpUserDirectory {
    async fn fetch_user(&self, user_id: &str) -> Result<Option<User>, SyncError> {
        let url = format!("{}/users/{}", self.base_url, user_id);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| SyncError::Transient(format!("GET {url}: {e}")))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(SyncError::Transient(format!(
                "GET {url}: status {}",
                response.status()
            )));
        }

        let user = response
            .json::<User>()
            .await
            .map_err(|e| SyncError::Transient(format!("GET {url}: {e}")))?;
        Ok(Some(user))
    }
}

/// Result of one sweep pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub users_checked: usize,
    pub orders_checked: usize,
    /// Orders whose synced version lagged past the threshold
    pub lagging_orders: usize,
    pub applied: usize,
    /// Users referenced by orders but unknown to the directory
    pub missing_users: usize,
    /// Users whose fetch or apply failed; retried next pass
    pub failed_users: usize,
}

pub struct ReconciliationSweep {
    applier: OrderSyncApplier,
    directory: Arc<dyn UserDirectory>,
    policy: ReconciliationPolicy,
}

impl ReconciliationSweep {
    pub fn new(
        applier: OrderSyncApplier,
        directory: Arc<dyn UserDirectory>,
        policy: ReconciliationPolicy,
    ) -> Self {
        Self {
            applier,
            directory,
            policy,
        }
    }

    /// Run a sweep every `sweep_interval` until `shutdown` is cancelled
    ///
    /// Returns at once when the interval is zero; callers skip spawning it.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        if self.policy.sweep_interval.is_zero() {
            return;
        }
        tracing::info!(
            interval_secs = self.policy.sweep_interval.as_secs(),
            staleness_threshold = self.policy.staleness_threshold,
            "Reconciliation sweep started"
        );

        let mut interval = tokio::time::interval(self.policy.sweep_interval);
        // The first tick fires immediately; skip it so startup is not a sweep
        interval.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    match self.run_once().await {
                        Ok(report) if report.lagging_orders > 0 || report.failed_users > 0 => {
                            tracing::info!(?report, "Reconciliation sweep finished");
                        }
                        Ok(_) => tracing::debug!("Reconciliation sweep found nothing to fix"),
                        Err(e) => tracing::error!(error = %e, "Reconciliation sweep failed"),
                    }
                }
            }
        }

        tracing::info!("Reconciliation sweep stopped");
    }

    /// One full pass over every order
    pub async fn run_once(&self) -> Result<SweepReport, SyncError> {
        let orders = self.applier.store().list_orders()?;

        let mut by_user: BTreeMap<String, Vec<Order>> = BTreeMap::new();
        for order in orders {
            by_user.entry(order.user_id.clone()).or_default().push(order);
        }

        let mut report = SweepReport {
            users_checked: by_user.len(),
            ..Default::default()
        };

        for (user_id, orders) in by_user {
            report.orders_checked += orders.len();

            let user = match self.directory.fetch_user(&user_id).await {
                Ok(Some(user)) => user,
                Ok(None) => {
                    tracing::warn!(user_id = %user_id, orders = orders.len(), "Orders reference unknown user");
                    report.missing_users += 1;
                    continue;
                }
                Err(e) => {
                    tracing::warn!(user_id = %user_id, error = %e, "User fetch failed during sweep");
                    report.failed_users += 1;
                    continue;
                }
            };

            let lagging = orders
                .iter()
                .filter(|o| self.policy.is_stale(o.last_synced_user_version, user.version))
                .count();
            if lagging == 0 {
                continue;
            }
            report.lagging_orders += lagging;

            match self
                .applier
                .apply_contact(&user.user_id, &user.contact(), user.version)
                .await
            {
                Ok(applied) => {
                    tracing::info!(
                        user_id = %user.user_id,
                        user_version = user.version,
                        lagging,
                        applied = applied.applied,
                        "Lagging orders reconciled"
                    );
                    report.applied += applied.applied;
                }
                Err(e) => {
                    tracing::warn!(user_id = %user.user_id, error = %e, "Reconcile apply failed");
                    report.failed_users += 1;
                }
            }
        }

        Ok(report)
    }

    /// Re-apply the current state of one user to all of its orders
    ///
    /// The manual recovery path for a dead-lettered envelope. Ignores the
    /// staleness threshold; the version gate still decides per order.
    pub async fn resync_user(&self, user_id: &str) -> Result<SyncReport, SyncError> {
        let user = self
            .directory
            .fetch_user(user_id)
            .await?
            .ok_or_else(|| SyncError::UserNotFound(user_id.to_string()))?;

        let report = self
            .applier
            .apply_contact(&user.user_id, &user.contact(), user.version)
            .await?;
        tracing::info!(
            user_id = %user_id,
            user_version = user.version,
            applied = report.applied,
            stale = report.stale,
            "User resynced"
        );
        Ok(report)
    }
}
