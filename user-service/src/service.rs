//! User service
//!
//! Commit first, publish second. The publish outcome is reported back to the
//! caller but never turns a committed write into an error.

use serde::Serialize;
use shared::error::AppResult;
use shared::models::{User, UserCreate, UserUpdate};
use validator::Validate;

use crate::publisher::{PublishOutcome, Publisher};
use crate::storage::UserStorage;

/// Result of a user update
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserUpdateResult {
    pub previous: User,
    pub current: User,
    pub sync: PublishOutcome,
    /// Serving revision of the user service
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
}

#[derive(Clone)]
pub struct UserService {
    storage: UserStorage,
    publisher: Publisher,
}

impl UserService {
    pub fn new(storage: UserStorage, publisher: Publisher) -> Self {
        Self { storage, publisher }
    }

    pub fn storage(&self) -> &UserStorage {
        &self.storage
    }

    pub fn revision(&self) -> Option<&str> {
        self.publisher.source()
    }

    pub fn create(&self, data: UserCreate) -> AppResult<User> {
        data.validate()?;
        let user = self.storage.create(data)?;
        tracing::info!(user_id = %user.user_id, "User created");
        Ok(user)
    }

    pub fn get(&self, user_id: &str) -> AppResult<Option<User>> {
        Ok(self.storage.get(user_id)?)
    }

    pub fn list(&self) -> AppResult<Vec<User>> {
        Ok(self.storage.list()?)
    }

    /// Update contact fields and publish the new state
    pub async fn update(&self, user_id: &str, data: UserUpdate) -> AppResult<UserUpdateResult> {
        data.validate_request()?;
        let change = self.storage.update(user_id, data)?;

        let current = &change.current;
        let sync = self
            .publisher
            .publish(
                &current.user_id,
                current.emails.clone(),
                current.delivery_address.clone(),
                current.version,
            )
            .await;

        if !sync.is_published() {
            tracing::warn!(
                user_id = %user_id,
                version = current.version,
                "User updated without publishing, orders will catch up on the next sweep"
            );
        }

        Ok(UserUpdateResult {
            previous: change.previous,
            current: change.current,
            sync,
            revision: self.revision().map(str::to_string),
        })
    }
}
