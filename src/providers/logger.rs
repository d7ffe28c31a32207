//! Logger mailer that only logs messages.
//!
//! Useful for staging environments, or to watch the dispatch pipeline end to
//! end without a real SMTP relay.

use async_trait::async_trait;

use crate::email::Email;
use crate::error::DeliveryError;
use crate::mailer::{DeliveryResult, Mailer};

/// Logger mailer that emits tracing events for messages. Always succeeds.
pub struct LoggerMailer {
    /// If true, log full message details. If false, just log recipient summary.
    log_full: bool,
}

impl LoggerMailer {
    /// Create a logger mailer with brief output (just recipients).
    pub fn new() -> Self {
        Self { log_full: false }
    }

    /// Create a logger mailer with full message details.
    pub fn full() -> Self {
        Self { log_full: true }
    }
}

impl Default for LoggerMailer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Mailer for LoggerMailer {
    async fn deliver(&self, email: &Email) -> Result<DeliveryResult, DeliveryError> {
        let message_id = uuid::Uuid::new_v4().to_string();

        if self.log_full {
            tracing::info!(
                message_id = %message_id,
                from = ?email.from.as_ref().map(|a| a.formatted()),
                to = ?email.to.iter().map(|a| a.formatted()).collect::<Vec<_>>(),
                cc = ?email.cc.iter().map(|a| a.formatted()).collect::<Vec<_>>(),
                subject = %email.subject,
                headers = ?email.headers,
                "Email logged (full)"
            );
            if let Some(ref html) = email.html_body {
                tracing::debug!(body = %html, "HTML body");
            }
        } else {
            tracing::info!(
                message_id = %message_id,
                to = ?email.to.iter().map(|a| &a.email).collect::<Vec<_>>(),
                subject = %email.subject,
                "Email logged"
            );
        }

        Ok(DeliveryResult::new(message_id))
    }

    fn provider_name(&self) -> &'static str {
        "logger"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Address;

    #[tokio::test]
    async fn test_logger_always_succeeds() {
        let email = Email::new()
            .from(Address::with_name("Alice", "alice@example.com"))
            .to("bob@example.com")
            .cc("charlie@example.com")
            .subject("Test Subject")
            .html_body("<p>HTML</p>");

        for mailer in [LoggerMailer::new(), LoggerMailer::full()] {
            let delivery = mailer.deliver(&email).await.unwrap();
            assert!(!delivery.message_id.is_empty());
        }
    }

    #[test]
    fn test_provider_name() {
        assert_eq!(LoggerMailer::default().provider_name(), "logger");
        assert!(!LoggerMailer::default().log_full);
    }
}
