//! Shared types for the user and order services
//!
//! Domain models, the contact change event envelope, error types
//! and response structures used across crates.

pub mod error;
pub mod message;
pub mod models;
pub mod util;

// Re-exports
pub use axum::Json;
pub use http;
pub use serde::{Deserialize, Serialize};

pub use message::{ENVELOPE_SCHEMA_VERSION, EnvelopeError, EventEnvelope};
