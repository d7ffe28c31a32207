//! Mail transport trait and delivery result types.
//!
//! The transport is a black box: it either accepts the message or fails with a
//! [`DeliveryError`] that says whether another attempt could help.
//!
//! `#[async_trait]` is used instead of native async traits because the
//! delivery worker holds the transport as `Arc<dyn Mailer>`, chosen at runtime
//! from configuration.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::email::Email;
use crate::error::DeliveryError;

/// Result of a successful delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryResult {
    /// Message ID assigned by the transport
    pub message_id: String,
}

impl DeliveryResult {
    /// Create a new delivery result with a message ID.
    pub fn new(message_id: impl Into<String>) -> Self {
        Self {
            message_id: message_id.into(),
        }
    }
}

/// Trait for mail transports.
///
/// ```ignore
/// use mailtrack::{Email, Mailer};
/// use mailtrack::providers::LoggerMailer;
///
/// let mailer = LoggerMailer::new();
/// let result = mailer.deliver(&Email::new().to("a@b.com").subject("Hi")).await?;
/// println!("Sent with ID: {}", result.message_id);
/// ```
#[async_trait]
pub trait Mailer: Send + Sync {
    /// Send a single message.
    async fn deliver(&self, email: &Email) -> Result<DeliveryResult, DeliveryError>;

    /// Get the provider name (for logging/metrics).
    fn provider_name(&self) -> &'static str {
        "unknown"
    }
}
