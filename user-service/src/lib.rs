//! User service
//!
//! Owns user records and publishes a contact change envelope after every
//! committed update. Store and channel handles are injected by the host.

pub mod api;
pub mod publisher;
pub mod service;
pub mod storage;

pub use publisher::{PublishOutcome, Publisher};
pub use service::{UserService, UserUpdateResult};
pub use storage::{StorageError, UserChange, UserStorage};
