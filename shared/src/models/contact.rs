//! Contact Model
//!
//! 用户联系信息 (邮箱 + 收货地址)，在订单上冗余存储。

use serde::{Deserialize, Serialize};
use validator::{Validate, ValidateEmail, ValidationError};

/// Email addresses (RFC 5321)
pub const MAX_EMAIL_LEN: usize = 254;

/// Structured delivery address, all five fields required
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryAddress {
    #[validate(length(min = 1, max = 500))]
    pub street: String,
    #[validate(length(min = 1, max = 500))]
    pub city: String,
    #[validate(length(min = 1, max = 500))]
    pub state: String,
    #[validate(length(min = 1, max = 500))]
    pub postal_code: String,
    #[validate(length(min = 1, max = 500))]
    pub country: String,
}

/// The user data an order denormalizes
///
/// Always travels as one unit so an order never holds emails from one user
/// version and an address from another.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactInfo {
    pub emails: Vec<String>,
    pub delivery_address: DeliveryAddress,
}

impl ContactInfo {
    pub fn new(emails: Vec<String>, delivery_address: DeliveryAddress) -> Self {
        Self {
            emails,
            delivery_address,
        }
    }
}

/// Validate a list of email addresses: non-empty, each syntactically valid,
/// no duplicates
pub fn validate_emails(emails: &[String]) -> Result<(), ValidationError> {
    if emails.is_empty() {
        return Err(ValidationError::new("emails_empty")
            .with_message("emails must contain at least one address".into()));
    }
    for (idx, email) in emails.iter().enumerate() {
        if email.len() > MAX_EMAIL_LEN || !email.validate_email() {
            let mut err = ValidationError::new("email_invalid")
                .with_message("emails must be an array of valid email addresses".into());
            err.add_param("value".into(), email);
            return Err(err);
        }
        if emails[..idx].contains(email) {
            return Err(ValidationError::new("email_duplicate")
                .with_message("emails must not contain duplicates".into()));
        }
    }
    Ok(())
}

#[cfg(test)]
pub(crate) fn sample_address(street: &str) -> DeliveryAddress {
    DeliveryAddress {
        street: street.to_string(),
        city: "TestCity".to_string(),
        state: "TC".to_string(),
        postal_code: "11111".to_string(),
        country: "Testland".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_requires_all_fields() {
        assert!(sample_address("123 Main St").validate().is_ok());

        let mut address = sample_address("123 Main St");
        address.postal_code = String::new();
        let errors = address.validate().unwrap_err();
        assert!(errors.field_errors().contains_key("postal_code"));
    }

    #[test]
    fn test_validate_emails() {
        assert!(validate_emails(&["a@x.com".to_string()]).is_ok());
        assert!(validate_emails(&[]).is_err());
        assert!(validate_emails(&["not-an-email".to_string()]).is_err());
        assert!(validate_emails(&["a@x.com".to_string(), "a@x.com".to_string()]).is_err());
    }

    #[test]
    fn test_address_json_uses_camel_case() {
        let json = serde_json::to_value(sample_address("1 Road")).unwrap();
        assert_eq!(json["postalCode"], "11111");
        assert!(json.get("postal_code").is_none());
    }
}
