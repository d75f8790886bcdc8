//! Contact synchronisation from the user service
//!
//! - [`SyncWorker`]: channel consumer with dedup, retry and dead-letter
//! - [`OrderSyncApplier`]: version-gated application to all orders of a user
//! - [`ReconciliationSweep`]: periodic repair of lagging orders
//! - [`ReconciliationPolicy`]: redelivery ceiling, backoff and sweep settings

pub mod applier;
pub mod error;
pub mod policy;
pub mod reconcile;
pub mod worker;

pub use applier::{OrderSyncApplier, SyncReport};
pub use error::SyncError;
pub use policy::{DEFAULT_MAX_REDELIVERIES, ReconciliationPolicy};
pub use reconcile::{HttpUserDirectory, ReconciliationSweep, SweepReport, UserDirectory};
pub use worker::{BatchReport, DeliveryOutcome, SyncWorker};
