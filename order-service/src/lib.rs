//! Order service
//!
//! Owns order records with a denormalized copy of the user's contact data,
//! kept current by consuming contact change envelopes from the channel.

pub mod api;
pub mod service;
pub mod storage;
pub mod sync;

pub use service::{OrderService, OrderStatusChange};
pub use storage::{CasOutcome, OrderChange, OrderStorage, OrderStore, StorageError};
