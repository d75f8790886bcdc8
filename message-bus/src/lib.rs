//! Durable event channel between the user and order services
//!
//! - [`EventChannel`]: transport contract (send, lease, ack, nack, dead-letter)
//! - [`RedbChannel`]: durable implementation on an embedded redb file
//! - [`RetryPolicy`]: bounded exponential backoff shared by producers and consumers

pub mod channel;
pub mod error;
pub mod retry;
pub mod storage;

pub use channel::{DeadLetter, Delivery, EnvelopeChannelExt, EventChannel};
pub use error::{ChannelError, ChannelResult};
pub use retry::RetryPolicy;
pub use storage::RedbChannel;
