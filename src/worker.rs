//! A single delivery attempt and the decision that follows it.
//!
//! ```text
//! Pending -> attempt -> Sent
//!                    -> RetryScheduled -> attempt -> ...
//!                    -> Failed
//! ```
//!
//! [`DeliveryWorker::run`] does not spawn or sleep. It returns a
//! [`JobOutcome`] and the pool acts on it, so the worker itself can be driven
//! directly in tests.

use std::sync::Arc;
use std::time::Duration;
use tracing::Instrument;

#[cfg(feature = "metrics")]
use std::time::Instant;

use crate::compose::Composer;
use crate::dispatch::DeliveryJob;
use crate::error::DeliveryError;
use crate::mail::{Mail, MailStatus};
use crate::mailer::Mailer;
use crate::retry;
use crate::storage::MailStore;

/// Total delivery attempts per mail, first try included.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
/// Pause between a transient failure and the next attempt.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(10);
/// Tries for recording a mail's final status.
pub const STATUS_WRITE_ATTEMPTS: u32 = 5;
const STATUS_WRITE_PAUSE: Duration = Duration::from_millis(200);

/// Fixed-delay retry policy for transient transport failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            delay: DEFAULT_RETRY_DELAY,
        }
    }
}

impl RetryPolicy {
    /// Whether attempt number `attempt` (1-based) may be followed by another.
    pub const fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// How a job ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// Delivered; the mail is now `Sent`.
    Sent { message_id: String },
    /// Transient failure; attempt number `attempt` should run after `delay`.
    RetryScheduled { attempt: u32, delay: Duration },
    /// Given up; the mail is now `Failed`.
    Failed { reason: String },
    /// Nothing to do (mail deleted or already final).
    Skipped,
}

/// Executes delivery jobs against the transport.
#[derive(Clone)]
pub struct DeliveryWorker {
    store: Arc<dyn MailStore>,
    mailer: Arc<dyn Mailer>,
    composer: Composer,
    policy: RetryPolicy,
    status_pause: Duration,
}

impl DeliveryWorker {
    pub fn new(store: Arc<dyn MailStore>, mailer: Arc<dyn Mailer>, composer: Composer) -> Self {
        Self {
            store,
            mailer,
            composer,
            policy: RetryPolicy::default(),
            status_pause: STATUS_WRITE_PAUSE,
        }
    }

    /// Pause between tries of a failed status write.
    pub fn status_write_pause(mut self, pause: Duration) -> Self {
        self.status_pause = pause;
        self
    }

    /// Replace the retry policy.
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// The active retry policy.
    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Run one attempt of `job`. Never panics, never returns an error.
    pub async fn run(&self, job: &DeliveryJob) -> JobOutcome {
        let span = tracing::info_span!(
            "mailtrack.deliver",
            provider = self.mailer.provider_name(),
            mail_id = job.mail_id,
            attempt = job.attempt,
        );
        self.run_inner(job).instrument(span).await
    }

    async fn run_inner(&self, job: &DeliveryJob) -> JobOutcome {
        let mail = match self.store.mail(job.mail_id).await {
            Ok(Some(mail)) => mail,
            Ok(None) => {
                tracing::debug!("Mail no longer exists, dropping job");
                return JobOutcome::Skipped;
            }
            Err(e) => {
                return self
                    .transient_or_fail(job, None, format!("mail lookup failed: {}", e))
                    .await;
            }
        };

        if mail.status.is_final() {
            #[cfg(feature = "metrics")]
            metrics::counter!("mailtrack_duplicate_schedules_total").increment(1);
            tracing::warn!(status = %mail.status, "Mail already delivered or failed, dropping duplicate job");
            return JobOutcome::Skipped;
        }

        let email = match self.composer.compose(&mail) {
            Ok(email) => email,
            Err(e) => return self.fail(&mail, e.to_string()).await,
        };

        tracing::debug!("Delivering mail");

        #[cfg(feature = "metrics")]
        let start = Instant::now();

        let result = self.mailer.deliver(&email).await;

        #[cfg(feature = "metrics")]
        {
            let provider = self.mailer.provider_name();
            let status = match &result {
                Ok(_) => "success",
                Err(e) if e.is_retryable() => "transient",
                Err(_) => "terminal",
            };
            metrics::counter!("mailtrack_deliveries_total", "provider" => provider, "status" => status)
                .increment(1);
            metrics::histogram!("mailtrack_delivery_duration_seconds", "provider" => provider)
                .record(start.elapsed().as_secs_f64());
        }

        match result {
            Ok(delivery) => {
                self.record_status(mail.id, MailStatus::Sent).await;
                tracing::info!(message_id = %delivery.message_id, "Mail delivered");
                JobOutcome::Sent {
                    message_id: delivery.message_id,
                }
            }
            Err(DeliveryError::Transient(reason)) => {
                self.transient_or_fail(job, Some(&mail), reason).await
            }
            Err(DeliveryError::Terminal(reason)) => self.fail(&mail, reason).await,
        }
    }

    async fn transient_or_fail(
        &self,
        job: &DeliveryJob,
        mail: Option<&Mail>,
        reason: String,
    ) -> JobOutcome {
        if self.policy.should_retry(job.attempt) {
            tracing::warn!(reason = %reason, delay_secs = self.policy.delay.as_secs(), "Transient delivery failure, retrying");
            return JobOutcome::RetryScheduled {
                attempt: job.attempt + 1,
                delay: self.policy.delay,
            };
        }

        match mail {
            Some(mail) => {
                self.fail(mail, format!("gave up after {} attempts: {}", job.attempt, reason))
                    .await
            }
            None => self.abandon(job, reason).await,
        }
    }

    /// Give up on `job`'s mail without another attempt and mark it `Failed`.
    ///
    /// Used when a retry was due but could not be queued.
    pub async fn abandon(&self, job: &DeliveryJob, reason: String) -> JobOutcome {
        self.record_status(job.mail_id, MailStatus::Failed).await;
        tracing::error!(mail_id = job.mail_id, attempt = job.attempt, reason = %reason, "Delivery abandoned");
        JobOutcome::Failed { reason }
    }

    async fn fail(&self, mail: &Mail, reason: String) -> JobOutcome {
        self.record_status(mail.id, MailStatus::Failed).await;
        tracing::error!(reason = %reason, recipient = %mail.recipient, "Mail delivery failed");
        JobOutcome::Failed { reason }
    }

    /// Write a final status, retrying transient store failures.
    async fn record_status(&self, mail_id: i64, status: MailStatus) {
        let store = &self.store;
        let result = retry::with_retries(STATUS_WRITE_ATTEMPTS, self.status_pause, "mail status", || async move {
            store.set_status(mail_id, status).await.map(|_| ())
        })
        .await;
        if let Err(e) = result {
            tracing::error!(error = %e, mail_id, status = %status, "Could not record mail status");
        }
    }
}
