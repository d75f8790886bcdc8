//! redb-backed durable channel
//!
//! # Tables
//!
//! | Table | Key | Value | Purpose |
//! |-------|-----|-------|---------|
//! | `messages` | `seq` | `StoredMessage` | Pending messages |
//! | `partitions` | `(partition_key, seq)` | `()` | Per-key order index |
//! | `dead_letter` | `seq` | `DeadLetter` | Dead letter sink |
//! | `sequence_counter` | `"seq"` | `u64` | Global sequence |
//!
//! Delivery counts are durable so the redelivery ceiling survives a restart.
//! Leases live in memory only: a crashed consumer releases every partition it
//! held and the unacked heads are delivered again.
//!
//! `poll` hands out partition heads oldest first (lowest `seq`), so a partition
//! waiting behind busier keys moves to the front as newer messages arrive.

use async_trait::async_trait;
use dashmap::DashMap;
use redb::{
    Database, ReadableDatabase, ReadableTable, ReadableTableMetadata, TableDefinition,
};
use serde::{Deserialize, Serialize};
use shared::util::now_millis;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

use crate::channel::{DeadLetter, Delivery, EventChannel};
use crate::error::{ChannelError, ChannelResult};

const MESSAGES_TABLE: TableDefinition<u64, &[u8]> = TableDefinition::new("messages");

const PARTITIONS_TABLE: TableDefinition<(&str, u64), ()> = TableDefinition::new("partitions");

const DEAD_LETTER_TABLE: TableDefinition<u64, &[u8]> = TableDefinition::new("dead_letter");

const SEQUENCE_TABLE: TableDefinition<&str, u64> = TableDefinition::new("sequence_counter");

const SEQUENCE_KEY: &str = "seq";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredMessage {
    seq: u64,
    partition_key: String,
    payload: Vec<u8>,
    delivery_count: u32,
    enqueued_at: i64,
    /// Not deliverable before this instant (millis)
    not_before: i64,
    last_error: Option<String>,
}

impl StoredMessage {
    fn to_delivery(&self) -> Delivery {
        Delivery {
            seq: self.seq,
            partition_key: self.partition_key.clone(),
            delivery_count: self.delivery_count,
            enqueued_at: self.enqueued_at,
            payload: self.payload.clone(),
        }
    }
}

/// Durable channel backed by redb
#[derive(Clone)]
pub struct RedbChannel {
    db: Arc<Database>,
    /// partition_key -> leased seq
    leases: Arc<DashMap<String, u64>>,
    notify: Arc<Notify>,
}

impl std::fmt::Debug for RedbChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbChannel")
            .field("leases", &self.leases.len())
            .finish()
    }
}

impl RedbChannel {
    /// Open or create the channel database at the given path
    pub fn open(path: impl AsRef<Path>) -> ChannelResult<Self> {
        let db = Database::create(path)?;
        Self::init(db)
    }

    /// Open an in-memory channel (tests, ephemeral runs)
    pub fn open_in_memory() -> ChannelResult<Self> {
        let db = Database::builder().create_with_backend(redb::backends::InMemoryBackend::new())?;
        Self::init(db)
    }

    fn init(db: Database) -> ChannelResult<Self> {
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(MESSAGES_TABLE)?;
            let _ = write_txn.open_table(PARTITIONS_TABLE)?;
            let _ = write_txn.open_table(DEAD_LETTER_TABLE)?;

            let mut seq_table = write_txn.open_table(SEQUENCE_TABLE)?;
            if seq_table.get(SEQUENCE_KEY)?.is_none() {
                seq_table.insert(SEQUENCE_KEY, 0u64)?;
            }
        }
        write_txn.commit()?;

        Ok(Self {
            db: Arc::new(db),
            leases: Arc::new(DashMap::new()),
            notify: Arc::new(Notify::new()),
        })
    }

    fn enqueue(&self, partition_key: &str, payload: &[u8]) -> ChannelResult<u64> {
        let now = now_millis();
        let txn = self.db.begin_write()?;
        let seq = {
            let mut seq_table = txn.open_table(SEQUENCE_TABLE)?;
            let seq = seq_table
                .get(SEQUENCE_KEY)?
                .map(|guard| guard.value())
                .unwrap_or(0)
                + 1;
            seq_table.insert(SEQUENCE_KEY, seq)?;

            let message = StoredMessage {
                seq,
                partition_key: partition_key.to_string(),
                payload: payload.to_vec(),
                delivery_count: 0,
                enqueued_at: now,
                not_before: now,
                last_error: None,
            };
            let value = serde_json::to_vec(&message)?;

            let mut messages = txn.open_table(MESSAGES_TABLE)?;
            messages.insert(seq, value.as_slice())?;
            let mut partitions = txn.open_table(PARTITIONS_TABLE)?;
            partitions.insert((partition_key, seq), ())?;
            seq
        };
        txn.commit()?;
        Ok(seq)
    }

    fn lease_heads(&self, max: usize) -> ChannelResult<Vec<Delivery>> {
        if max == 0 {
            return Ok(Vec::new());
        }

        let now = now_millis();
        let txn = self.db.begin_write()?;
        let deliveries = {
            // Head of every partition
            let mut heads: Vec<(String, u64)> = Vec::new();
            {
                let partitions = txn.open_table(PARTITIONS_TABLE)?;
                for result in partitions.iter()? {
                    let (key, _) = result?;
                    let (partition_key, seq) = key.value();
                    if heads.last().is_some_and(|(p, _)| p == partition_key) {
                        continue;
                    }
                    heads.push((partition_key.to_string(), seq));
                }
            }
            heads.sort_unstable_by_key(|(_, seq)| *seq);

            let mut messages = txn.open_table(MESSAGES_TABLE)?;
            let mut deliveries = Vec::new();
            for (partition_key, seq) in heads {
                if deliveries.len() >= max {
                    break;
                }
                if self.leases.contains_key(&partition_key) {
                    continue;
                }

                let stored = match messages.get(seq)? {
                    Some(value) => serde_json::from_slice::<StoredMessage>(value.value())?,
                    None => {
                        tracing::warn!(seq, partition = %partition_key, "Partition index points at missing message");
                        continue;
                    }
                };
                if stored.not_before > now {
                    continue;
                }

                let mut stored = stored;
                stored.delivery_count = stored.delivery_count.saturating_add(1);
                let value = serde_json::to_vec(&stored)?;
                messages.insert(seq, value.as_slice())?;

                self.leases.insert(partition_key, seq);
                deliveries.push(stored.to_delivery());
            }
            deliveries
        };

        if let Err(e) = txn.commit() {
            for delivery in &deliveries {
                self.release(delivery);
            }
            return Err(e.into());
        }
        Ok(deliveries)
    }

    fn release(&self, delivery: &Delivery) {
        self.leases
            .remove_if(&delivery.partition_key, |_, seq| *seq == delivery.seq);
    }

    fn remove_message(&self, delivery: &Delivery) -> ChannelResult<()> {
        let txn = self.db.begin_write()?;
        {
            let mut messages = txn.open_table(MESSAGES_TABLE)?;
            messages.remove(delivery.seq)?;
            let mut partitions = txn.open_table(PARTITIONS_TABLE)?;
            partitions.remove((delivery.partition_key.as_str(), delivery.seq))?;
        }
        txn.commit()?;
        Ok(())
    }

    fn defer(&self, delivery: &Delivery, retry_after: Duration, reason: &str) -> ChannelResult<()> {
        let txn = self.db.begin_write()?;
        {
            let mut messages = txn.open_table(MESSAGES_TABLE)?;
            let stored = match messages.get(delivery.seq)? {
                Some(value) => Some(serde_json::from_slice::<StoredMessage>(value.value())?),
                None => None,
            };

            if let Some(mut stored) = stored {
                let delay_ms = i64::try_from(retry_after.as_millis()).unwrap_or(i64::MAX);
                stored.not_before = now_millis().saturating_add(delay_ms);
                stored.last_error = Some(reason.to_string());
                let value = serde_json::to_vec(&stored)?;
                messages.insert(delivery.seq, value.as_slice())?;
            }
        }
        txn.commit()?;
        Ok(())
    }

    fn move_to_dead_letter(&self, delivery: &Delivery, reason: &str) -> ChannelResult<()> {
        let txn = self.db.begin_write()?;
        {
            let mut messages = txn.open_table(MESSAGES_TABLE)?;
            let mut partitions = txn.open_table(PARTITIONS_TABLE)?;
            let mut dead_letter_table = txn.open_table(DEAD_LETTER_TABLE)?;

            let stored = match messages.get(delivery.seq)? {
                Some(value) => Some(serde_json::from_slice::<StoredMessage>(value.value())?),
                None => None,
            };

            if let Some(stored) = stored {
                let dead_letter = DeadLetter {
                    seq: stored.seq,
                    partition_key: stored.partition_key,
                    delivery_count: stored.delivery_count,
                    enqueued_at: stored.enqueued_at,
                    dead_lettered_at: now_millis(),
                    reason: reason.to_string(),
                    payload: stored.payload,
                };
                let value = serde_json::to_vec(&dead_letter)?;
                dead_letter_table.insert(delivery.seq, value.as_slice())?;

                messages.remove(delivery.seq)?;
                partitions.remove((delivery.partition_key.as_str(), delivery.seq))?;
            }
        }
        txn.commit()?;
        Ok(())
    }

    fn load_dead_letters(&self) -> ChannelResult<Vec<DeadLetter>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(DEAD_LETTER_TABLE)?;

        let mut entries = Vec::new();
        for result in table.iter()? {
            let (_key, value) = result?;
            let entry: DeadLetter = serde_json::from_slice(value.value())?;
            entries.push(entry);
        }
        Ok(entries)
    }

    fn take_dead_letter(&self, seq: u64) -> ChannelResult<DeadLetter> {
        let txn = self.db.begin_write()?;
        let entry = {
            let mut table = txn.open_table(DEAD_LETTER_TABLE)?;
            let entry = match table.get(seq)? {
                Some(value) => serde_json::from_slice::<DeadLetter>(value.value())?,
                None => return Err(ChannelError::DeadLetterNotFound(seq)),
            };
            table.remove(seq)?;
            entry
        };
        txn.commit()?;
        Ok(entry)
    }

    fn count_pending(&self) -> ChannelResult<u64> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(MESSAGES_TABLE)?;
        Ok(table.len()?)
    }
}

#[async_trait]
impl EventChannel for RedbChannel {
    async fn send(&self, partition_key: &str, payload: &[u8]) -> ChannelResult<u64> {
        let seq = self.enqueue(partition_key, payload)?;
        tracing::debug!(seq, partition = %partition_key, "Message enqueued");
        self.notify.notify_one();
        Ok(seq)
    }

    async fn poll(&self, max: usize) -> ChannelResult<Vec<Delivery>> {
        self.lease_heads(max)
    }

    async fn ack(&self, delivery: &Delivery) -> ChannelResult<()> {
        let result = self.remove_message(delivery);
        self.release(delivery);
        result?;
        // The next message in this partition may be due now
        self.notify.notify_one();
        Ok(())
    }

    async fn nack(
        &self,
        delivery: &Delivery,
        retry_after: Duration,
        reason: &str,
    ) -> ChannelResult<()> {
        let result = self.defer(delivery, retry_after, reason);
        self.release(delivery);
        result?;
        tracing::debug!(
            seq = delivery.seq,
            partition = %delivery.partition_key,
            delivery_count = delivery.delivery_count,
            retry_after_ms = retry_after.as_millis() as u64,
            "Message nacked"
        );
        Ok(())
    }

    async fn dead_letter(&self, delivery: &Delivery, reason: &str) -> ChannelResult<()> {
        let result = self.move_to_dead_letter(delivery, reason);
        self.release(delivery);
        result?;
        tracing::warn!(
            seq = delivery.seq,
            partition = %delivery.partition_key,
            delivery_count = delivery.delivery_count,
            reason = %reason,
            "Message moved to dead letter sink"
        );
        self.notify.notify_one();
        Ok(())
    }

    async fn dead_letters(&self) -> ChannelResult<Vec<DeadLetter>> {
        self.load_dead_letters()
    }

    async fn requeue_dead_letter(&self, seq: u64) -> ChannelResult<u64> {
        let entry = self.take_dead_letter(seq)?;
        let new_seq = self.enqueue(&entry.partition_key, &entry.payload)?;
        tracing::info!(
            old_seq = seq,
            new_seq,
            partition = %entry.partition_key,
            "Dead letter requeued"
        );
        self.notify.notify_one();
        Ok(new_seq)
    }

    async fn pending_count(&self) -> ChannelResult<u64> {
        self.count_pending()
    }

    async fn wait_ready(&self, timeout: Duration) {
        let _ = tokio::time::timeout(timeout, self.notify.notified()).await;
    }
}
