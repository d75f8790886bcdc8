//! redb-based user storage
//!
//! # Tables
//!
//! | Table | Key | Value | Purpose |
//! |-------|-----|-------|---------|
//! | `users` | `user_id` | `User` | User documents |
//! | `user_emails` | `email` (lowercase) | `user_id` | Email uniqueness index |

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition, WriteTransaction};
use shared::error::{AppError, ErrorCode};
use shared::models::{User, UserCreate, UserUpdate};
use shared::util::{new_id, now_millis};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

/// Table for user documents: key = user_id, value = JSON-serialized User
const USERS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("users");

/// Email index: key = lowercase email, value = owning user_id
const EMAIL_INDEX_TABLE: TableDefinition<&str, &str> = TableDefinition::new("user_emails");

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

    #[error("User not found: {0}")]
    UserNotFound(String),

    #[error("Email already in use: {0}")]
    EmailInUse(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

impl From<StorageError> for AppError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::UserNotFound(id) => AppError::user_not_found(&id),
            StorageError::EmailInUse(email) => {
                AppError::new(ErrorCode::EmailInUse).with_detail("email", email)
            }
            other => AppError::database(other.to_string()),
        }
    }
}

/// Previous and current state of a user after an update
#[derive(Debug, Clone)]
pub struct UserChange {
    pub previous: User,
    pub current: User,
}

/// User storage backed by redb
#[derive(Clone)]
pub struct UserStorage {
    db: Arc<Database>,
}

impl std::fmt::Debug for UserStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserStorage").finish_non_exhaustive()
    }
}

impl UserStorage {
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
            let _ = write_txn.open_table(USERS_TABLE)?;
            let _ = write_txn.open_table(EMAIL_INDEX_TABLE)?;
        }
        write_txn.commit()?;
        Ok(Self { db: Arc::new(db) })
    }

    /// Create a user at version 0
    pub fn create(&self, data: UserCreate) -> StorageResult<User> {
        let now = now_millis();
        let user = User {
            user_id: new_id(),
            emails: data.emails,
            delivery_address: data.delivery_address,
            first_name: data.first_name,
            last_name: data.last_name,
            phone_number: data.phone_number,
            created_at: now,
            updated_at: now,
            version: 0,
        };

        let txn = self.db.begin_write()?;
        Self::claim_emails(&txn, &user.user_id, &user.emails)?;
        Self::put_user(&txn, &user)?;
        txn.commit()?;

        tracing::debug!(user_id = %user.user_id, "User created");
        Ok(user)
    }

    pub fn get(&self, user_id: &str) -> StorageResult<Option<User>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(USERS_TABLE)?;
        match table.get(user_id)? {
            Some(value) => Ok(Some(serde_json::from_slice(value.value())?)),
            None => Ok(None),
        }
    }

    pub fn list(&self) -> StorageResult<Vec<User>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(USERS_TABLE)?;

        let mut users = Vec::new();
        for result in table.iter()? {
            let (_key, value) = result?;
            let user: User = serde_json::from_slice(value.value())?;
            users.push(user);
        }
        users.sort_by_key(|u| u.created_at);
        Ok(users)
    }

    /// Apply a contact update, bump `version` and commit
    ///
    /// Returns both the stored state before the write and the committed state.
    pub fn update(&self, user_id: &str, data: UserUpdate) -> StorageResult<UserChange> {
        let txn = self.db.begin_write()?;
        let previous = {
            let table = txn.open_table(USERS_TABLE)?;
            let previous = match table.get(user_id)? {
                Some(value) => serde_json::from_slice::<User>(value.value())?,
                None => return Err(StorageError::UserNotFound(user_id.to_string())),
            };
            previous
        };

        let mut current = previous.clone();
        if let Some(emails) = data.emails {
            Self::release_emails(&txn, user_id, &previous.emails)?;
            Self::claim_emails(&txn, user_id, &emails)?;
            current.emails = emails;
        }
        if let Some(address) = data.delivery_address {
            current.delivery_address = address;
        }
        current.version = previous.version + 1;
        current.updated_at = now_millis().max(previous.updated_at);

        Self::put_user(&txn, &current)?;
        txn.commit()?;

        tracing::debug!(user_id = %user_id, version = current.version, "User updated");
        Ok(UserChange { previous, current })
    }

    fn put_user(txn: &WriteTransaction, user: &User) -> StorageResult<()> {
        let mut table = txn.open_table(USERS_TABLE)?;
        let value = serde_json::to_vec(user)?;
        table.insert(user.user_id.as_str(), value.as_slice())?;
        Ok(())
    }

    fn claim_emails(txn: &WriteTransaction, user_id: &str, emails: &[String]) -> StorageResult<()> {
        let mut index = txn.open_table(EMAIL_INDEX_TABLE)?;
        for email in emails {
            let key = email.to_lowercase();
            let owner = index.get(key.as_str())?.map(|guard| guard.value().to_string());
            if owner.as_deref().is_some_and(|owner| owner != user_id) {
                return Err(StorageError::EmailInUse(email.clone()));
            }
            index.insert(key.as_str(), user_id)?;
        }
        Ok(())
    }

    fn release_emails(
        txn: &WriteTransaction,
        user_id: &str,
        emails: &[String],
    ) -> StorageResult<()> {
        let mut index = txn.open_table(EMAIL_INDEX_TABLE)?;
        for email in emails {
            let key = email.to_lowercase();
            let owned = index
                .get(key.as_str())?
                .is_some_and(|guard| guard.value() == user_id);
            if owned {
                index.remove(key.as_str())?;
            }
        }
        Ok(())
    }
}
