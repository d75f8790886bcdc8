//! Data models
//!
//! Shared between the user service, the order service and the sync worker.
//! JSON field names are camelCase; timestamps are unix millis.

pub mod contact;
pub mod order;
pub mod user;

// Re-exports
pub use contact::*;
pub use order::*;
pub use user::*;
