//! Local mailer for development and testing.
//!
//! Captures messages in memory so tests can assert on what the delivery worker
//! sent, and can be scripted to fail so the retry paths can be exercised.
//!
//! ```rust,ignore
//! use mailtrack::providers::LocalMailer;
//! use mailtrack::testing::*;
//!
//! let mailer = LocalMailer::new();
//! mailer.fail_transient(2); // first two attempts time out
//!
//! // ... run the pool ...
//!
//! assert_email_sent(&mailer);
//! assert_eq!(mailer.attempts(), 3);
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::sync::Arc;

use crate::email::Email;
use crate::error::DeliveryError;
use crate::mailer::{DeliveryResult, Mailer};

/// A captured message with metadata.
#[derive(Debug, Clone)]
pub struct SentEmail {
    /// Message ID handed back to the caller.
    pub id: String,
    /// The message content.
    pub email: Email,
    /// When the message was accepted.
    pub sent_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
enum Failure {
    #[default]
    None,
    /// Fail the next `n` attempts with a transient error.
    Transient(usize),
    /// Fail every attempt with a transient error.
    AlwaysTransient,
    /// Fail every attempt with a terminal error.
    Terminal(String),
}

#[derive(Debug, Default)]
struct Inner {
    sent: RwLock<Vec<SentEmail>>,
    failure: RwLock<Failure>,
    attempts: RwLock<usize>,
}

/// Local mailer that stores messages in memory.
///
/// Clones share captured messages and failure state.
#[derive(Debug, Clone, Default)]
pub struct LocalMailer {
    inner: Arc<Inner>,
}

impl LocalMailer {
    /// Create a new local mailer.
    pub fn new() -> Self {
        Self::default()
    }

    // =========================================================================
    // Failure Simulation
    // =========================================================================

    /// Fail the next `times` attempts with a transient error.
    pub fn fail_transient(&self, times: usize) {
        *self.inner.failure.write() = Failure::Transient(times);
    }

    /// Fail every attempt with a transient error.
    pub fn fail_always(&self) {
        *self.inner.failure.write() = Failure::AlwaysTransient;
    }

    /// Fail every attempt with a terminal error.
    pub fn fail_terminal(&self, message: impl Into<String>) {
        *self.inner.failure.write() = Failure::Terminal(message.into());
    }

    /// Clear the failure state.
    pub fn clear_failure(&self) {
        *self.inner.failure.write() = Failure::None;
    }

    // =========================================================================
    // Inspection
    // =========================================================================

    /// Every delivery attempt seen, successful or not.
    pub fn attempts(&self) -> usize {
        *self.inner.attempts.read()
    }

    /// All captured messages, newest first.
    pub fn emails(&self) -> Vec<SentEmail> {
        self.inner.sent.read().iter().rev().cloned().collect()
    }

    /// The most recently accepted message.
    pub fn last_email(&self) -> Option<SentEmail> {
        self.inner.sent.read().last().cloned()
    }

    /// Number of accepted messages.
    pub fn email_count(&self) -> usize {
        self.inner.sent.read().len()
    }

    /// Whether an accepted message went to `email` (as To or CC).
    pub fn sent_to(&self, email: &str) -> bool {
        self.inner.sent.read().iter().any(|stored| {
            stored
                .email
                .recipients()
                .any(|addr| addr.email.eq_ignore_ascii_case(email))
        })
    }

    /// Remove and return all captured messages, newest first.
    pub fn flush(&self) -> Vec<SentEmail> {
        let mut sent = self.inner.sent.write();
        let mut drained: Vec<SentEmail> = sent.drain(..).collect();
        drained.reverse();
        drained
    }

    /// Find captured messages matching a predicate.
    pub fn find_emails<F>(&self, predicate: F) -> Vec<SentEmail>
    where
        F: Fn(&Email) -> bool,
    {
        self.emails()
            .into_iter()
            .filter(|stored| predicate(&stored.email))
            .collect()
    }

    fn next_failure(&self) -> Option<DeliveryError> {
        let mut failure = self.inner.failure.write();
        match &mut *failure {
            Failure::None => None,
            Failure::Transient(0) => {
                *failure = Failure::None;
                None
            }
            Failure::Transient(remaining) => {
                *remaining -= 1;
                Some(DeliveryError::Transient("simulated timeout".into()))
            }
            Failure::AlwaysTransient => Some(DeliveryError::Transient("simulated timeout".into())),
            Failure::Terminal(message) => Some(DeliveryError::Terminal(message.clone())),
        }
    }
}

#[async_trait]
impl Mailer for LocalMailer {
    async fn deliver(&self, email: &Email) -> Result<DeliveryResult, DeliveryError> {
        *self.inner.attempts.write() += 1;

        if let Some(err) = self.next_failure() {
            return Err(err);
        }

        let id = uuid::Uuid::new_v4().to_string();
        self.inner.sent.write().push(SentEmail {
            id: id.clone(),
            email: email.clone(),
            sent_at: Utc::now(),
        });
        Ok(DeliveryResult::new(id))
    }

    fn provider_name(&self) -> &'static str {
        "local"
    }
}
