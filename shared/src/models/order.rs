//! Order Model

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use validator::Validate;

use super::contact::{ContactInfo, DeliveryAddress, validate_emails};

/// Order status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderStatus {
    #[serde(rename = "under process")]
    UnderProcess,
    #[serde(rename = "shipping")]
    Shipping,
    #[serde(rename = "delivered")]
    Delivered,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::UnderProcess => "under process",
            OrderStatus::Shipping => "shipping",
            OrderStatus::Delivered => "delivered",
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "under process" => Ok(OrderStatus::UnderProcess),
            "shipping" => Ok(OrderStatus::Shipping),
            "delivered" => Ok(OrderStatus::Delivered),
            other => Err(format!("unknown order status: {other}")),
        }
    }
}

/// Order line item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct OrderItem {
    #[validate(length(min = 1, max = 200))]
    pub item_id: String,
    #[validate(range(min = 1))]
    pub quantity: u32,
    #[validate(range(min = 0.0))]
    pub price: f64,
}

/// Result of offering a user contact change to an order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContactApply {
    /// Contact fields replaced, `lastSyncedUserVersion` advanced
    Applied { previous_version: u64 },
    /// Incoming version not newer than what the order already holds
    Stale { synced_version: u64 },
}

/// Order entity (owned by the order service)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    /// Assigned at creation, immutable
    pub order_id: String,
    /// Foreign reference, the order service never mutates the user
    pub user_id: String,
    pub items: Vec<OrderItem>,
    pub order_status: OrderStatus,
    /// Denormalized from the user as of `last_synced_user_version`
    pub user_emails: Vec<String>,
    /// Denormalized from the user as of `last_synced_user_version`
    pub delivery_address: DeliveryAddress,
    pub created_at: i64,
    pub updated_at: i64,
    /// Highest user version applied to this order
    pub last_synced_user_version: u64,
}

impl Order {
    /// Denormalized contact data currently held by the order
    pub fn contact(&self) -> ContactInfo {
        ContactInfo::new(self.user_emails.clone(), self.delivery_address.clone())
    }

    /// Last-writer-wins by user version
    ///
    /// Replaces both contact fields together and advances the synced version,
    /// or leaves the order untouched when `user_version` is not strictly newer.
    /// Wall-clock time never decides; `now` only feeds `updated_at`.
    pub fn apply_user_contact(
        &mut self,
        contact: &ContactInfo,
        user_version: u64,
        now: i64,
    ) -> ContactApply {
        if user_version <= self.last_synced_user_version {
            return ContactApply::Stale {
                synced_version: self.last_synced_user_version,
            };
        }

        let previous_version = self.last_synced_user_version;
        self.user_emails = contact.emails.clone();
        self.delivery_address = contact.delivery_address.clone();
        self.last_synced_user_version = user_version;
        self.touch(now);

        ContactApply::Applied { previous_version }
    }

    /// Advance `updated_at` without letting it move backwards
    pub fn touch(&mut self, now: i64) {
        self.updated_at = self.updated_at.max(now);
    }
}

/// Create order payload
#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct OrderCreate {
    #[validate(length(min = 1, max = 100))]
    pub user_id: String,
    #[validate(length(min = 1), nested)]
    pub items: Vec<OrderItem>,
    #[validate(custom(function = "validate_emails"))]
    pub user_emails: Vec<String>,
    #[validate(nested)]
    pub delivery_address: DeliveryAddress,
    pub order_status: OrderStatus,
    /// User version the contact snapshot was taken at (0 when unknown)
    #[serde(default)]
    pub user_version: Option<u64>,
}

/// Update order status payload
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct OrderStatusUpdate {
    pub order_status: OrderStatus,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::contact::sample_address;

    fn sample_order(synced: u64) -> Order {
        Order {
            order_id: "o1".to_string(),
            user_id: "u1".to_string(),
            items: vec![OrderItem {
                item_id: "prod001".to_string(),
                quantity: 2,
                price: 19.99,
            }],
            order_status: OrderStatus::UnderProcess,
            user_emails: vec!["a@x.com".to_string()],
            delivery_address: sample_address("1 Old Rd"),
            created_at: 1_000,
            updated_at: 1_000,
            last_synced_user_version: synced,
        }
    }

    #[test]
    fn test_status_serde_names() {
        let json = serde_json::to_string(&OrderStatus::UnderProcess).unwrap();
        assert_eq!(json, "\"under process\"");
        assert_eq!(
            "shipping".parse::<OrderStatus>().unwrap(),
            OrderStatus::Shipping
        );
        assert!("lost".parse::<OrderStatus>().is_err());
    }

    #[test]
    fn test_apply_newer_contact() {
        let mut order = sample_order(0);
        let contact = ContactInfo::new(vec!["b@x.com".to_string()], sample_address("2 New Rd"));

        let result = order.apply_user_contact(&contact, 1, 2_000);

        assert_eq!(result, ContactApply::Applied { previous_version: 0 });
        assert_eq!(order.user_emails, vec!["b@x.com".to_string()]);
        assert_eq!(order.delivery_address.street, "2 New Rd");
        assert_eq!(order.last_synced_user_version, 1);
        assert_eq!(order.updated_at, 2_000);
    }

    #[test]
    fn test_apply_equal_or_older_is_stale() {
        let mut order = sample_order(3);
        let before = order.clone();
        let contact = ContactInfo::new(vec!["c@x.com".to_string()], sample_address("3 Rd"));

        assert_eq!(
            order.apply_user_contact(&contact, 3, 5_000),
            ContactApply::Stale { synced_version: 3 }
        );
        assert_eq!(
            order.apply_user_contact(&contact, 2, 5_000),
            ContactApply::Stale { synced_version: 3 }
        );
        assert_eq!(order, before);
    }

    #[test]
    fn test_updated_at_never_moves_backwards() {
        let mut order = sample_order(0);
        let contact = ContactInfo::new(vec!["b@x.com".to_string()], sample_address("2 Rd"));
        // Clock skew: "now" earlier than the stored timestamp
        order.apply_user_contact(&contact, 1, 500);
        assert_eq!(order.updated_at, 1_000);
    }

    #[test]
    fn test_order_create_validation() {
        let json = r#"{
            "userId": "u1",
            "items": [{"itemId": "prod001", "quantity": 2, "price": 19.99}],
            "userEmails": ["a@x.com"],
            "deliveryAddress": {"street":"s","city":"c","state":"st","postalCode":"p","country":"co"},
            "orderStatus": "under process"
        }"#;
        let create: OrderCreate = serde_json::from_str(json).unwrap();
        assert!(create.validate().is_ok());
        assert!(create.user_version.is_none());

        let with_synced = json.replace(
            r#""orderStatus""#,
            r#""lastSyncedUserVersion": 9, "orderStatus""#,
        );
        let err = serde_json::from_str::<OrderCreate>(&with_synced).unwrap_err();
        assert!(err.to_string().contains("unknown field `lastSyncedUserVersion`"));

        let empty_items = OrderCreate {
            items: vec![],
            ..create
        };
        assert!(empty_items.validate().is_err());
    }
}
