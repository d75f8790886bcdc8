//! Channel abstraction
//!
//! ```text
//!  Publisher ──send──▶ ┌──────────────────────────────┐
//!                      │ partition "u1": [s3, s7, ..]  │ ──poll──▶ Delivery(s3)
//!                      │ partition "u2": [s5, ..]      │ ──poll──▶ Delivery(s5)
//!                      └──────────────┬───────────────┘
//!                                     │ dead_letter
//!                                     ▼
//!                               dead letter sink
//! ```
//!
//! At-least-once: a delivery stays at the head of its partition until it is
//! acked or dead-lettered. Only the head of a partition is handed out, so
//! messages sharing a key are processed one at a time and in send order.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use shared::message::{EnvelopeError, EventEnvelope};
use std::time::Duration;

use crate::error::ChannelResult;

/// A message leased to a consumer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Channel-wide sequence number
    pub seq: u64,
    pub partition_key: String,
    /// Times this message has been handed out, including this one
    pub delivery_count: u32,
    pub enqueued_at: i64,
    pub payload: Vec<u8>,
}

impl Delivery {
    /// Decode the payload as a contact change envelope
    pub fn envelope(&self) -> Result<EventEnvelope, EnvelopeError> {
        EventEnvelope::from_bytes(&self.payload)
    }
}

/// A message removed from its partition after it could not be processed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    pub seq: u64,
    pub partition_key: String,
    pub delivery_count: u32,
    pub enqueued_at: i64,
    pub dead_lettered_at: i64,
    pub reason: String,
    pub payload: Vec<u8>,
}

impl DeadLetter {
    /// Payload decoded as an envelope, if it is one
    pub fn envelope(&self) -> Option<EventEnvelope> {
        EventEnvelope::from_bytes(&self.payload).ok()
    }
}

/// Durable, at-least-once, per-key ordered transport
#[async_trait]
pub trait EventChannel: Send + Sync {
    /// Append a payload to the tail of `partition_key`, returning its sequence
    async fn send(&self, partition_key: &str, payload: &[u8]) -> ChannelResult<u64>;

    /// Lease up to `max` partition heads that are due for delivery
    async fn poll(&self, max: usize) -> ChannelResult<Vec<Delivery>>;

    /// Remove a processed message and release its partition
    async fn ack(&self, delivery: &Delivery) -> ChannelResult<()>;

    /// Release the partition and hold the message back for `retry_after`
    async fn nack(
        &self,
        delivery: &Delivery,
        retry_after: Duration,
        reason: &str,
    ) -> ChannelResult<()>;

    /// Move the message to the dead letter sink and release its partition
    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> ChannelResult<()>;

    async fn dead_letters(&self) -> ChannelResult<Vec<DeadLetter>>;

    /// Put a dead letter back at the tail of its partition with a fresh
    /// delivery count; returns the new sequence
    async fn requeue_dead_letter(&self, seq: u64) -> ChannelResult<u64>;

    /// Messages not yet acked or dead-lettered
    async fn pending_count(&self) -> ChannelResult<u64>;

    /// Wait until new work may be available, or `timeout` elapses
    async fn wait_ready(&self, timeout: Duration) {
        tokio::time::sleep(timeout).await;
    }
}

/// Envelope helpers on top of the raw byte channel
#[async_trait]
pub trait EnvelopeChannelExt: EventChannel {
    /// Send an envelope partitioned by its user id
    async fn send_envelope(&self, envelope: &EventEnvelope) -> ChannelResult<u64> {
        let payload = envelope.to_bytes()?;
        self.send(&envelope.user_id, &payload).await
    }
}

impl<T: EventChannel + ?Sized> EnvelopeChannelExt for T {}
