//! redb-based order storage
//!
//! # Tables
//!
//! | Table | Key | Value | Purpose |
//! |-------|-----|-------|---------|
//! | `orders` | `order_id` | `Order` | Order documents |
//! | `user_orders` | `(user_id, order_id)` | `()` | Orders by user |
//! | `processed_events` | `event_id` | `processed_at` | Redelivery short-circuit |
//!
//! The contact update is a compare-and-set on `lastSyncedUserVersion` inside a
//! single write transaction, so two writers racing on the same order can never
//! interleave their reads and writes.

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition, WriteTransaction};
use shared::error::AppError;
use shared::models::{ContactApply, ContactInfo, Order, OrderCreate, OrderStatus};
use shared::util::{new_id, now_millis};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

/// Table for order documents: key = order_id, value = JSON-serialized Order
const ORDERS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("orders");

/// Index of orders per user: key = (user_id, order_id)
const USER_ORDERS_TABLE: TableDefinition<(&str, &str), ()> = TableDefinition::new("user_orders");

/// Processed envelopes: key = event_id, value = processed_at (millis)
const PROCESSED_EVENTS_TABLE: TableDefinition<&str, i64> =
    TableDefinition::new("processed_events");

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] redb::DatabaseError),

    #[error("Transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    #[error("Table error: {0}")]
    Table(#[from] redb::TableError),

    #[error("Storage error: {0}")]
    Storage(#[from] redb::StorageError),

    #[error("Commit error: {0}")]
    Commit(#[from] redb::CommitError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Order not found: {0}")]
    OrderNotFound(String),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

impl From<StorageError> for AppError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::OrderNotFound(id) => AppError::order_not_found(&id),
            other => AppError::database(other.to_string()),
        }
    }
}

/// Outcome of the conditional contact update on one order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasOutcome {
    Applied { previous_version: u64 },
    /// `userVersion <= lastSyncedUserVersion`, order untouched
    Stale { synced_version: u64 },
    /// Order vanished between lookup and update
    Missing,
}

/// Document-store adapter used by the sync worker and the sweep
pub trait OrderStore: Send + Sync {
    fn find_by_user_id(&self, user_id: &str) -> StorageResult<Vec<Order>>;

    fn find_by_order_id(&self, order_id: &str) -> StorageResult<Option<Order>>;

    fn list_orders(&self) -> StorageResult<Vec<Order>>;

    /// Set both contact fields and `lastSyncedUserVersion` if and only if
    /// `user_version` is newer than the stored one
    fn apply_contact_update(
        &self,
        order_id: &str,
        contact: &ContactInfo,
        user_version: u64,
        now: i64,
    ) -> StorageResult<CasOutcome>;

    fn is_event_processed(&self, event_id: &str) -> StorageResult<bool>;

    fn record_processed_event(&self, event_id: &str, processed_at: i64) -> StorageResult<()>;

    /// Drop processed-event records older than `older_than` (millis)
    fn prune_processed_events(&self, older_than: i64) -> StorageResult<usize>;
}

/// Previous and current state of an order after a status edit
#[derive(Debug, Clone)]
pub struct OrderChange {
    pub previous: Order,
    pub current: Order,
}

/// Order storage backed by redb
#[derive(Clone)]
pub struct OrderStorage {
    db: Arc<Database>,
}

impl std::fmt::Debug for OrderStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderStorage").finish_non_exhaustive()
    }
}

impl OrderStorage {
    /// Open or create the database at the given path
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let db = Database::create(path)?;
        Self::init(db)
    }

    /// Open an in-memory database (tests, ephemeral runs)
    pub fn open_in_memory() -> StorageResult<Self> {
        let db = Database::builder().create_with_backend(redb::backends::InMemoryBackend::new())?;
        Self::init(db)
    }

    fn init(db: Database) -> StorageResult<Self> {
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(ORDERS_TABLE)?;
            let _ = write_txn.open_table(USER_ORDERS_TABLE)?;
            let _ = write_txn.open_table(PROCESSED_EVENTS_TABLE)?;
        }
        write_txn.commit()?;
        Ok(Self { db: Arc::new(db) })
    }

    /// Create an order with a contact snapshot taken at `data.user_version`
    pub fn create(&self, data: OrderCreate) -> StorageResult<Order> {
        let now = now_millis();
        let order = Order {
            order_id: new_id(),
            user_id: data.user_id,
            items: data.items,
            order_status: data.order_status,
            user_emails: data.user_emails,
            delivery_address: data.delivery_address,
            created_at: now,
            updated_at: now,
            last_synced_user_version: data.user_version.unwrap_or(0),
        };

        let txn = self.db.begin_write()?;
        Self::put_order(&txn, &order)?;
        {
            let mut index = txn.open_table(USER_ORDERS_TABLE)?;
            index.insert((order.user_id.as_str(), order.order_id.as_str()), ())?;
        }
        txn.commit()?;

        Ok(order)
    }

    pub fn find_by_status(&self, status: OrderStatus) -> StorageResult<Vec<Order>> {
        Ok(self
            .list_orders()?
            .into_iter()
            .filter(|o| o.order_status == status)
            .collect())
    }

    /// Direct status edit; contact fields and sync version are left alone
    pub fn update_status(&self, order_id: &str, status: OrderStatus) -> StorageResult<OrderChange> {
        let txn = self.db.begin_write()?;
        let previous = Self::load_order(&txn, order_id)?
            .ok_or_else(|| StorageError::OrderNotFound(order_id.to_string()))?;

        let mut current = previous.clone();
        current.order_status = status;
        current.touch(now_millis());
        Self::put_order(&txn, &current)?;
        txn.commit()?;

        Ok(OrderChange { previous, current })
    }

    fn load_order(txn: &WriteTransaction, order_id: &str) -> StorageResult<Option<Order>> {
        let table = txn.open_table(ORDERS_TABLE)?;
        let order = match table.get(order_id)? {
            Some(value) => Some(serde_json::from_slice(value.value())?),
            None => None,
        };
        Ok(order)
    }

    fn put_order(txn: &WriteTransaction, order: &Order) -> StorageResult<()> {
        let mut table = txn.open_table(ORDERS_TABLE)?;
        let value = serde_json::to_vec(order)?;
        table.insert(order.order_id.as_str(), value.as_slice())?;
        Ok(())
    }
}

impl OrderStore for OrderStorage {
    fn find_by_user_id(&self, user_id: &str) -> StorageResult<Vec<Order>> {
        let read_txn = self.db.begin_read()?;
        let index = read_txn.open_table(USER_ORDERS_TABLE)?;
        let orders_table = read_txn.open_table(ORDERS_TABLE)?;

        let mut orders = Vec::new();
        for result in index.range((user_id, "")..)? {
            let (key, _) = result?;
            let (owner, order_id) = key.value();
            if owner != user_id {
                break;
            }
            if let Some(value) = orders_table.get(order_id)? {
                let order: Order = serde_json::from_slice(value.value())?;
                orders.push(order);
            }
        }
        Ok(orders)
    }

    fn find_by_order_id(&self, order_id: &str) -> StorageResult<Option<Order>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(ORDERS_TABLE)?;
        match table.get(order_id)? {
            Some(value) => Ok(Some(serde_json::from_slice(value.value())?)),
            None => Ok(None),
        }
    }

    fn list_orders(&self) -> StorageResult<Vec<Order>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(ORDERS_TABLE)?;

        let mut orders = Vec::new();
        for result in table.iter()? {
            let (_key, value) = result?;
            let order: Order = serde_json::from_slice(value.value())?;
            orders.push(order);
        }
        orders.sort_by_key(|o| o.created_at);
        Ok(orders)
    }

    fn apply_contact_update(
        &self,
        order_id: &str,
        contact: &ContactInfo,
        user_version: u64,
        now: i64,
    ) -> StorageResult<CasOutcome> {
        let txn = self.db.begin_write()?;
        let Some(mut order) = Self::load_order(&txn, order_id)? else {
            return Ok(CasOutcome::Missing);
        };

        let outcome = match order.apply_user_contact(contact, user_version, now) {
            ContactApply::Stale { synced_version } => {
                // Nothing to write; dropping the txn aborts it
                return Ok(CasOutcome::Stale { synced_version });
            }
            ContactApply::Applied { previous_version } => CasOutcome::Applied { previous_version },
        };

        Self::put_order(&txn, &order)?;
        txn.commit()?;
        Ok(outcome)
    }

    fn is_event_processed(&self, event_id: &str) -> StorageResult<bool> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(PROCESSED_EVENTS_TABLE)?;
        Ok(table.get(event_id)?.is_some())
    }

    fn record_processed_event(&self, event_id: &str, processed_at: i64) -> StorageResult<()> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(PROCESSED_EVENTS_TABLE)?;
            table.insert(event_id, processed_at)?;
        }
        txn.commit()?;
        Ok(())
    }

    fn prune_processed_events(&self, older_than: i64) -> StorageResult<usize> {
        let txn = self.db.begin_write()?;
        let removed = {
            let mut table = txn.open_table(PROCESSED_EVENTS_TABLE)?;

            // Collect first (can't iterate and mutate simultaneously)
            let expired: Vec<String> = table
                .iter()?
                .filter_map(|r| r.ok())
                .filter(|(_, v)| v.value() < older_than)
                .map(|(k, _)| k.value().to_string())
                .collect();

            for event_id in &expired {
                table.remove(event_id.as_str())?;
            }
            expired.len()
        };
        txn.commit()?;
        Ok(removed)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use shared::models::{DeliveryAddress, OrderItem};

    pub(crate) fn address(street: &str) -> DeliveryAddress {
        DeliveryAddress {
            street: street.to_string(),
            city: "Springfield".to_string(),
            state: "IL".to_string(),
            postal_code: "62701".to_string(),
            country: "US".to_string(),
        }
    }

    pub(crate) fn contact(email: &str, street: &str) -> ContactInfo {
        ContactInfo::new(vec![email.to_string()], address(street))
    }

    pub(crate) fn order_create(user_id: &str, user_version: Option<u64>) -> OrderCreate {
        OrderCreate {
            user_id: user_id.to_string(),
            items: vec![OrderItem {
                item_id: "prod001".to_string(),
                quantity: 2,
                price: 19.99,
            }],
            user_emails: vec!["old@x.com".to_string()],
            delivery_address: address("1 Old Rd"),
            order_status: OrderStatus::UnderProcess,
            user_version,
        }
    }

    #[test]
    fn test_create_and_find() {
        let storage = OrderStorage::open_in_memory().unwrap();
        let a = storage.create(order_create("u1", None)).unwrap();
        let b = storage.create(order_create("u1", Some(3))).unwrap();
        storage.create(order_create("u10", None)).unwrap();

        assert_eq!(a.last_synced_user_version, 0);
        assert_eq!(b.last_synced_user_version, 3);

        let mut ids: Vec<String> = storage
            .find_by_user_id("u1")
            .unwrap()
            .into_iter()
            .map(|o| o.order_id)
            .collect();
        ids.sort();
        let mut expected = vec![a.order_id.clone(), b.order_id.clone()];
        expected.sort();
        assert_eq!(ids, expected);

        assert!(storage.find_by_user_id("nobody").unwrap().is_empty());
        assert_eq!(storage.find_by_order_id(&a.order_id).unwrap().unwrap(), a);
        assert_eq!(storage.list_orders().unwrap().len(), 3);
    }

    #[test]
    fn test_apply_contact_update_cas() {
        let storage = OrderStorage::open_in_memory().unwrap();
        let order = storage.create(order_create("u1", Some(1))).unwrap();
        let now = now_millis();

        let outcome = storage
            .apply_contact_update(&order.order_id, &contact("new@x.com", "2 New Rd"), 2, now)
            .unwrap();
        assert_eq!(outcome, CasOutcome::Applied { previous_version: 1 });

        // Equal and older versions are discarded
        for version in [2, 1] {
            let outcome = storage
                .apply_contact_update(&order.order_id, &contact("x@x.com", "X"), version, now)
                .unwrap();
            assert_eq!(outcome, CasOutcome::Stale { synced_version: 2 });
        }

        let stored = storage.find_by_order_id(&order.order_id).unwrap().unwrap();
        assert_eq!(stored.user_emails, vec!["new@x.com".to_string()]);
        assert_eq!(stored.delivery_address.street, "2 New Rd");
        assert_eq!(stored.last_synced_user_version, 2);

        let outcome = storage
            .apply_contact_update("missing", &contact("x@x.com", "X"), 9, now)
            .unwrap();
        assert_eq!(outcome, CasOutcome::Missing);
    }

    #[test]
    fn test_concurrent_same_version_applies_once() {
        const WRITERS: usize = 8;

        let storage = OrderStorage::open_in_memory().unwrap();
        let order = storage.create(order_create("u1", Some(1))).unwrap();
        let now = now_millis();
        let barrier = Arc::new(std::sync::Barrier::new(WRITERS));

        let handles: Vec<_> = (0..WRITERS)
            .map(|i| {
                let storage = storage.clone();
                let barrier = barrier.clone();
                let order_id = order.order_id.clone();
                std::thread::spawn(move || {
                    let street = format!("{i} Race Rd");
                    barrier.wait();
                    let outcome = storage
                        .apply_contact_update(&order_id, &contact("race@x.com", &street), 2, now)
                        .unwrap();
                    (street, outcome)
                })
            })
            .collect();
        let results: Vec<(String, CasOutcome)> =
            handles.into_iter().map(|h| h.join().unwrap()).collect();

        let winners: Vec<&String> = results
            .iter()
            .filter(|(_, outcome)| *outcome == CasOutcome::Applied { previous_version: 1 })
            .map(|(street, _)| street)
            .collect();
        let stale = results
            .iter()
            .filter(|(_, outcome)| *outcome == CasOutcome::Stale { synced_version: 2 })
            .count();
        assert_eq!(winners.len(), 1);
        assert_eq!(stale, WRITERS - 1);

        // Exactly the winner's contact, never a blend of writers
        let stored = storage.find_by_order_id(&order.order_id).unwrap().unwrap();
        assert_eq!(stored.last_synced_user_version, 2);
        assert_eq!(&stored.delivery_address.street, winners[0]);
        assert_eq!(stored.user_emails, vec!["race@x.com".to_string()]);
        assert_eq!(stored.updated_at, order.updated_at.max(now));
        assert_eq!(stored.order_id, order.order_id);
        assert_eq!(stored.items, order.items);
        assert_eq!(stored.order_status, order.order_status);
    }

    #[test]
    fn test_update_status_keeps_contact() {
        let storage = OrderStorage::open_in_memory().unwrap();
        let order = storage.create(order_create("u1", Some(1))).unwrap();

        let change = storage
            .update_status(&order.order_id, OrderStatus::Shipping)
            .unwrap();
        assert_eq!(change.previous.order_status, OrderStatus::UnderProcess);
        assert_eq!(change.current.order_status, OrderStatus::Shipping);
        assert_eq!(change.current.last_synced_user_version, 1);
        assert_eq!(change.current.user_emails, order.user_emails);

        assert_eq!(
            storage.find_by_status(OrderStatus::Shipping).unwrap().len(),
            1
        );
        assert!(
            storage
                .find_by_status(OrderStatus::Delivered)
                .unwrap()
                .is_empty()
        );
        assert!(matches!(
            storage.update_status("missing", OrderStatus::Delivered),
            Err(StorageError::OrderNotFound(_))
        ));
    }

    #[test]
    fn test_processed_events_prune() {
        let storage = OrderStorage::open_in_memory().unwrap();
        storage.record_processed_event("e-old", 1_000).unwrap();
        storage.record_processed_event("e-new", 5_000).unwrap();

        assert!(storage.is_event_processed("e-old").unwrap());
        assert!(!storage.is_event_processed("e-unknown").unwrap());

        assert_eq!(storage.prune_processed_events(2_000).unwrap(), 1);
        assert!(!storage.is_event_processed("e-old").unwrap());
        assert!(storage.is_event_processed("e-new").unwrap());
    }
}
