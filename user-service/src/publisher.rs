//! Contact change publisher
//!
//! Turns a committed user update into an [`EventEnvelope`] and hands it to the
//! channel. Runs after the user write has been committed and never undoes it:
//! when the retry budget runs out the caller gets [`PublishOutcome::Degraded`]
//! and the reconciliation sweep on the order side closes the gap.

use message_bus::{EnvelopeChannelExt, EventChannel, RetryPolicy};
use serde::Serialize;
use shared::message::EventEnvelope;
use shared::models::{ContactInfo, DeliveryAddress};
use std::sync::Arc;
use uuid::Uuid;

/// Result of one publish call
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum PublishOutcome {
    #[serde(rename_all = "camelCase")]
    Published {
        event_id: Uuid,
        seq: u64,
        attempts: u32,
    },
    /// The user write stands but orders will lag until the next sweep
    #[serde(rename_all = "camelCase")]
    Degraded {
        event_id: Uuid,
        attempts: u32,
        reason: String,
    },
}

impl PublishOutcome {
    pub fn is_published(&self) -> bool {
        matches!(self, PublishOutcome::Published { .. })
    }
}

/// Publisher with an injected channel handle
#[derive(Clone)]
pub struct Publisher {
    channel: Arc<dyn EventChannel>,
    retry: RetryPolicy,
    source: Option<String>,
}

impl Publisher {
    pub fn new(channel: Arc<dyn EventChannel>, retry: RetryPolicy) -> Self {
        Self {
            channel,
            retry,
            source: None,
        }
    }

    /// Tag envelopes with the emitting service revision
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }

    /// Publish the contact state of `user_id` as of `user_version`
    ///
    /// Channel retries resend the same envelope, so a send that succeeded
    /// but reported failure shows up downstream as a duplicate `eventId`.
    pub async fn publish(
        &self,
        user_id: &str,
        emails: Vec<String>,
        delivery_address: DeliveryAddress,
        user_version: u64,
    ) -> PublishOutcome {
        let mut envelope =
            EventEnvelope::new(user_id, user_version, ContactInfo::new(emails, delivery_address));
        if let Some(source) = &self.source {
            envelope = envelope.with_source(source.clone());
        }
        let event_id = envelope.event_id;

        let mut attempts = 0;
        loop {
            attempts += 1;
            let err = match self.channel.send_envelope(&envelope).await {
                Ok(seq) => {
                    tracing::info!(
                        user_id = %user_id,
                        user_version,
                        event_id = %event_id,
                        seq,
                        attempts,
                        "Contact change published"
                    );
                    return PublishOutcome::Published {
                        event_id,
                        seq,
                        attempts,
                    };
                }
                Err(e) => e,
            };

            if !err.is_transient() || !self.retry.can_retry(attempts) {
                tracing::warn!(
                    user_id = %user_id,
                    user_version,
                    event_id = %event_id,
                    attempts,
                    error = %err,
                    "Publish retries exhausted, contact sync degraded"
                );
                return PublishOutcome::Degraded {
                    event_id,
                    attempts,
                    reason: err.to_string(),
                };
            }

            let delay = self.retry.delay_for(attempts);
            tracing::warn!(
                user_id = %user_id,
                event_id = %event_id,
                attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Publish failed, retrying"
            );
            drop(err);
            tokio::time::sleep(delay).await;
        }
    }
}
