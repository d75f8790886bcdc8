//! User Model

use serde::{Deserialize, Serialize};
use validator::Validate;

use super::contact::{ContactInfo, DeliveryAddress, validate_emails};
use crate::error::AppError;

/// User entity (owned by the user service)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    /// Stable id assigned at creation, never reused
    pub user_id: String,
    pub emails: Vec<String>,
    pub delivery_address: DeliveryAddress,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone_number: Option<String>,
    pub created_at: i64,
    /// Non-decreasing across mutations
    pub updated_at: i64,
    /// 0 on creation, +1 on every successful update
    pub version: u64,
}

impl User {
    /// Contact data as of this user version
    pub fn contact(&self) -> ContactInfo {
        ContactInfo::new(self.emails.clone(), self.delivery_address.clone())
    }
}

/// Create user payload
#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct UserCreate {
    #[validate(custom(function = "validate_emails"))]
    pub emails: Vec<String>,
    #[validate(nested)]
    pub delivery_address: DeliveryAddress,
    #[validate(length(max = 200))]
    pub first_name: Option<String>,
    #[validate(length(max = 200))]
    pub last_name: Option<String>,
    #[validate(length(max = 100))]
    pub phone_number: Option<String>,
}

/// Update user payload - only contact fields are mutable
#[derive(Debug, Clone, Default, Deserialize, Validate)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct UserUpdate {
    #[validate(custom(function = "validate_emails"))]
    pub emails: Option<Vec<String>>,
    #[validate(nested)]
    pub delivery_address: Option<DeliveryAddress>,
}

impl UserUpdate {
    /// Field validation plus the "at least one field" rule
    pub fn validate_request(&self) -> Result<(), AppError> {
        if self.emails.is_none() && self.delivery_address.is_none() {
            return Err(AppError::validation(
                "Either emails or deliveryAddress is required",
            ));
        }
        self.validate()?;
        Ok(())
    }
}
