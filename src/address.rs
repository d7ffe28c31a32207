//! Email addresses and their validation.

use crate::error::MailError;
use email_address::EmailAddress;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Longest address accepted for recipients and carbon copies.
pub const MAX_ADDRESS_LEN: usize = 254;

/// An email address with an optional display name.
///
/// ```
/// use mailtrack::Address;
///
/// let addr: Address = "user@example.com".into();
/// assert_eq!(addr.email, "user@example.com");
///
/// let addr: Address = ("Alice", "alice@example.com").into();
/// assert_eq!(addr.formatted(), "Alice <alice@example.com>");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    /// Optional display name (e.g., "Alice Smith")
    pub name: Option<String>,
    /// Email address (e.g., "alice@example.com")
    pub email: String,
}

impl Address {
    /// Create an address without validation.
    ///
    /// Logs a warning when the value does not even contain an `@`.
    /// Use [`Address::parse`] on untrusted input.
    pub fn new(email: impl Into<String>) -> Self {
        let email = email.into();
        if email.is_empty() || !email.contains('@') {
            tracing::warn!(email = %email, "Creating address with potentially invalid email");
        }
        Self { name: None, email }
    }

    /// Create an address with a display name, without validation.
    pub fn with_name(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::new(email)
        }
    }

    /// Parse and validate an address.
    ///
    /// Surrounding whitespace is trimmed. The address must be RFC 5321/5322
    /// valid and at most [`MAX_ADDRESS_LEN`] characters.
    ///
    /// ```
    /// use mailtrack::Address;
    ///
    /// assert!(Address::parse(" a@b.com ").is_ok());
    /// assert!(Address::parse("not-an-email").is_err());
    /// assert!(Address::parse("").is_err());
    /// ```
    pub fn parse(email: &str) -> Result<Self, MailError> {
        let email = email.trim();
        if email.chars().count() > MAX_ADDRESS_LEN {
            return Err(MailError::InvalidAddress(format!(
                "'{}' is longer than {} characters",
                email, MAX_ADDRESS_LEN
            )));
        }
        if !EmailAddress::is_valid(email) {
            return Err(MailError::InvalidAddress(format!(
                "'{}' is not a valid email address",
                email
            )));
        }

        Ok(Self {
            name: None,
            email: email.to_string(),
        })
    }

    /// Convert the domain part to ASCII (Punycode) for SMTP.
    ///
    /// ```
    /// use mailtrack::Address;
    ///
    /// let addr = Address::new("user@例え.jp");
    /// assert_eq!(addr.to_ascii().unwrap(), "user@xn--r8jz45g.jp");
    /// ```
    pub fn to_ascii(&self) -> Result<String, MailError> {
        let (local, domain) = self.email.split_once('@').ok_or_else(|| {
            MailError::InvalidAddress(format!("'{}' is missing @ symbol", self.email))
        })?;

        let ascii_domain = idna::domain_to_ascii(domain).map_err(|e| {
            MailError::InvalidAddress(format!(
                "Failed to convert domain '{}' to ASCII: {:?}",
                domain, e
            ))
        })?;

        Ok(format!("{}@{}", local, ascii_domain))
    }

    /// Format as "Name <email>" or just "email" if no name.
    pub fn formatted(&self) -> String {
        match &self.name {
            Some(name) if !name.is_empty() => format!("{} <{}>", name, self.email),
            _ => self.email.clone(),
        }
    }

    /// Format for a message header, quoting and escaping the display name.
    pub fn formatted_rfc5322(&self) -> String {
        match &self.name {
            Some(name) if !name.is_empty() => {
                // Escape backslashes first, then quotes
                let escaped = name.replace('\\', "\\\\").replace('"', "\\\"");
                format!("\"{}\" <{}>", escaped, self.email)
            }
            _ => self.email.clone(),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.formatted())
    }
}

impl From<&str> for Address {
    fn from(email: &str) -> Self {
        Self::new(email)
    }
}

impl From<String> for Address {
    fn from(email: String) -> Self {
        Self::new(email)
    }
}

impl From<(&str, &str)> for Address {
    fn from((name, email): (&str, &str)) -> Self {
        Self::with_name(name, email)
    }
}

/// Validate a user-supplied address field, reporting the field on failure.
pub fn validate_address(field: &'static str, value: &str) -> Result<Address, MailError> {
    if value.trim().is_empty() {
        return Err(MailError::validation(field, "is required"));
    }
    Address::parse(value).map_err(|e| match e {
        MailError::InvalidAddress(message) => MailError::validation(field, message),
        other => other,
    })
}
