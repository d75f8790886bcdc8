//! 事件信封定义
//!
//! 用户服务发布、订单服务消费的联系信息变更事件。
//! 信封一经构建即不可变，通道只搬运其序列化字节。

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{ContactInfo, DeliveryAddress};
use crate::util::now_millis;

/// Envelope contract version understood by this build
pub const ENVELOPE_SCHEMA_VERSION: u16 = 1;

/// Contact change event for one user version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    pub schema_version: u16,
    /// Unique per publish attempt
    pub event_id: Uuid,
    /// Channel partition key
    pub user_id: String,
    /// The user's `version` after the committed write
    pub user_version: u64,
    pub emails: Vec<String>,
    pub delivery_address: DeliveryAddress,
    pub emitted_at: i64,
    /// Emitting service revision (e.g. "v1", "v2")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

/// Why a payload could not be turned into an envelope
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("unsupported envelope schema version {0}")]
    UnsupportedSchema(u16),
}

impl EventEnvelope {
    pub fn new(user_id: impl Into<String>, user_version: u64, contact: ContactInfo) -> Self {
        Self {
            schema_version: ENVELOPE_SCHEMA_VERSION,
            event_id: Uuid::new_v4(),
            user_id: user_id.into(),
            user_version,
            emails: contact.emails,
            delivery_address: contact.delivery_address,
            emitted_at: now_millis(),
            source: None,
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Contact snapshot carried by this envelope
    pub fn contact(&self) -> ContactInfo {
        ContactInfo::new(self.emails.clone(), self.delivery_address.clone())
    }

    pub fn is_supported_schema(&self) -> bool {
        self.schema_version == ENVELOPE_SCHEMA_VERSION
    }

    /// 序列化为二进制
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// 从二进制解析，拒绝未知的 schema 版本
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        let envelope: Self = serde_json::from_slice(bytes)?;
        if !envelope.is_supported_schema() {
            return Err(EnvelopeError::UnsupportedSchema(envelope.schema_version));
        }
        Ok(envelope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::contact::sample_address;

    fn contact() -> ContactInfo {
        ContactInfo::new(vec!["a@x.com".to_string()], sample_address("1 Road"))
    }

    #[test]
    fn test_envelope_new() {
        let a = EventEnvelope::new("u1", 2, contact()).with_source("v2");
        let b = EventEnvelope::new("u1", 2, contact());

        assert_eq!(a.schema_version, ENVELOPE_SCHEMA_VERSION);
        assert_ne!(a.event_id, b.event_id);
        assert_eq!(a.source.as_deref(), Some("v2"));
        assert_eq!(a.contact(), contact());
    }

    #[test]
    fn test_envelope_wire_shape() {
        let envelope = EventEnvelope::new("u1", 3, contact());
        let json: serde_json::Value = serde_json::from_slice(&envelope.to_bytes().unwrap()).unwrap();

        assert_eq!(json["schemaVersion"], 1);
        assert_eq!(json["userId"], "u1");
        assert_eq!(json["userVersion"], 3);
        assert_eq!(json["deliveryAddress"]["street"], "1 Road");
        assert!(json.get("source").is_none());

        let parsed = EventEnvelope::from_bytes(&envelope.to_bytes().unwrap()).unwrap();
        assert_eq!(parsed, envelope);
    }

    #[test]
    fn test_from_bytes_rejects_garbage_and_unknown_schema() {
        assert!(matches!(
            EventEnvelope::from_bytes(b"{not json"),
            Err(EnvelopeError::Malformed(_))
        ));

        let mut envelope = EventEnvelope::new("u1", 1, contact());
        envelope.schema_version = 99;
        let bytes = envelope.to_bytes().unwrap();
        assert!(matches!(
            EventEnvelope::from_bytes(&bytes),
            Err(EnvelopeError::UnsupportedSchema(99))
        ));
    }
}
