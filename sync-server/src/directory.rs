//! In-process user directory
//!
//! When both services share this process the reconciliation sweep reads users
//! straight from the user store instead of going through HTTP.

use async_trait::async_trait;
use order_service::sync::{SyncError, UserDirectory};
use shared::models::User;
use user_service::UserStorage;

#[derive(Debug, Clone)]
pub struct LocalUserDirectory {
    storage: UserStorage,
}

impl LocalUserDirectory {
    pub fn new(storage: UserStorage) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl UserDirectory for LocalUserDirectory {
    async fn fetch_user(&self, user_id: &str) -> Result<Option<User>, SyncError> {
        self.storage
            .get(user_id)
            .map_err(|e| SyncError::Transient(format!("user store: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::models::{DeliveryAddress, UserCreate};

    #[tokio::test]
    async fn test_fetch_user() {
        let storage = UserStorage::open_in_memory().unwrap();
        let user = storage
            .create(UserCreate {
                emails: vec!["a@x.com".to_string()],
                delivery_address: DeliveryAddress {
                    street: "1 Rd".to_string(),
                    city: "c".to_string(),
                    state: "s".to_string(),
                    postal_code: "p".to_string(),
                    country: "co".to_string(),
                },
                first_name: None,
                last_name: None,
                phone_number: None,
            })
            .unwrap();

        let directory = LocalUserDirectory::new(storage);
        let fetched = directory.fetch_user(&user.user_id).await.unwrap();
        assert_eq!(fetched, Some(user));
        assert_eq!(directory.fetch_user("missing").await.unwrap(), None);
    }
}
