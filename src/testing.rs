//! Testing utilities and assertion helpers.
//!
//! Assertions read what a [`LocalMailer`] captured; the async helpers wait
//! for the delivery pipeline to settle.
//!
//! # Example
//!
//! ```rust,ignore
//! use mailtrack::providers::LocalMailer;
//! use mailtrack::testing::*;
//!
//! #[tokio::test]
//! async fn test_welcome_flow() {
//!     let mailer = LocalMailer::new();
//!
//!     // ... create a mail and let the pool deliver it ...
//!
//!     assert_email_sent(&mailer);
//!     assert_email_to(&mailer, "user@example.com");
//!     assert_email_subject_contains(&mailer, "Welcome");
//!     assert_email_html_matches(&mailer, r#"<img src="https://t\.example\.com/\w+""#);
//! }
//! ```

use regex::Regex;
use std::time::Duration;

use crate::identifier::PublicKey;
use crate::mail::{Mail, MailStatus};
use crate::providers::{LocalMailer, SentEmail};
use crate::service::MailAggregateService;

// ============================================================================
// Helper Functions
// ============================================================================

/// Format a list of emails for error messages.
fn format_email_summary(emails: &[SentEmail]) -> String {
    if emails.is_empty() {
        return "  (no emails sent)".to_string();
    }

    emails
        .iter()
        .enumerate()
        .map(|(i, stored)| {
            let e = &stored.email;
            let to = e
                .recipients()
                .map(|a| a.email.as_str())
                .collect::<Vec<_>>()
                .join(", ");
            format!("  {}. To: [{}], Subject: \"{}\"", i + 1, to, e.subject)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn last_sent(mailer: &LocalMailer) -> SentEmail {
    mailer
        .last_email()
        .expect("Expected at least one email to be sent, but none were sent")
}

// ============================================================================
// Assertions
// ============================================================================

/// Assert that at least one email was sent.
///
/// # Panics
///
/// Panics if no emails were sent.
pub fn assert_email_sent(mailer: &LocalMailer) {
    assert!(
        mailer.email_count() > 0,
        "Expected at least one email to be sent, but none were sent"
    );
}

/// Assert that no emails were sent.
///
/// # Panics
///
/// Panics if any email was sent.
pub fn assert_no_email_sent(mailer: &LocalMailer) {
    let emails = mailer.emails();
    assert!(
        emails.is_empty(),
        "Expected no emails to be sent, but {} were sent.\n\nEmails sent:\n{}",
        emails.len(),
        format_email_summary(&emails)
    );
}

/// Assert that exactly N emails were sent.
///
/// # Panics
///
/// Panics if the count doesn't match.
pub fn assert_email_count(mailer: &LocalMailer, expected: usize) {
    let actual = mailer.email_count();
    assert!(
        actual == expected,
        "Expected {} email(s) to be sent, but {} were sent.\n\nEmails sent:\n{}",
        expected,
        actual,
        format_email_summary(&mailer.emails())
    );
}

/// Assert that an email was sent to a specific primary recipient.
///
/// # Panics
///
/// Panics if no email was sent to the address.
pub fn assert_email_to(mailer: &LocalMailer, email: &str) {
    let emails = mailer.emails();
    let found = emails
        .iter()
        .any(|stored| stored.email.to.iter().any(|a| a.email.eq_ignore_ascii_case(email)));

    assert!(
        found,
        "Expected an email to be sent to '{}'.\n\nEmails sent:\n{}",
        email,
        format_email_summary(&emails)
    );
}

/// Assert that an email carried `email` as a carbon copy.
///
/// # Panics
///
/// Panics if no email copied the address.
pub fn assert_email_cc(mailer: &LocalMailer, email: &str) {
    let emails = mailer.emails();
    let found = emails
        .iter()
        .any(|stored| stored.email.cc.iter().any(|a| a.email.eq_ignore_ascii_case(email)));

    assert!(
        found,
        "Expected an email with '{}' in CC.\n\nEmails sent:\n{}",
        email,
        format_email_summary(&emails)
    );
}

/// Assert that an email with subject containing text was sent.
///
/// # Panics
///
/// Panics if no matching email was found.
pub fn assert_email_subject_contains(mailer: &LocalMailer, text: &str) {
    let emails = mailer.emails();
    let found = emails.iter().any(|stored| stored.email.subject.contains(text));

    assert!(
        found,
        "Expected an email with subject containing '{}'.\n\nEmails sent:\n{}",
        text,
        format_email_summary(&emails)
    );
}

/// Assert the last email HTML body matches a regex pattern.
///
/// # Panics
///
/// Panics if no email was sent or the HTML body doesn't match.
pub fn assert_email_html_matches(mailer: &LocalMailer, pattern: &str) {
    let last = last_sent(mailer);
    let html = last.email.html_body.as_deref().unwrap_or("");
    let re = Regex::new(pattern).expect("Invalid regex pattern");

    assert!(
        re.is_match(html),
        "Expected HTML body to match pattern '{}', but it didn't.\n\nHTML body (first 500 chars):\n{}",
        pattern,
        html.chars().take(500).collect::<String>()
    );
}

/// Assert the last email carried a header with the given value.
///
/// # Panics
///
/// Panics if no email was sent or the header is missing or different.
pub fn assert_email_header(mailer: &LocalMailer, name: &str, value: &str) {
    let last = last_sent(mailer);
    assert_eq!(
        last.email.headers.get(name).map(String::as_str),
        Some(value),
        "Unexpected value for header '{}'",
        name
    );
}

/// Refute that an email was sent to a specific address (To or CC).
///
/// # Panics
///
/// Panics if an email was sent to the address.
pub fn refute_email_to(mailer: &LocalMailer, email: &str) {
    assert!(
        !mailer.sent_to(email),
        "Expected no email to be sent to '{}'.\n\nEmails sent:\n{}",
        email,
        format_email_summary(&mailer.emails())
    );
}

// ============================================================================
// Pipeline Helpers
// ============================================================================

/// Poll until the mail reaches `status`, or panic after `timeout`.
///
/// Works under a paused Tokio clock: each poll sleeps, which lets pending
/// timers (scheduled sends, retry delays) fire.
pub async fn wait_for_status(
    service: &MailAggregateService,
    key: &PublicKey,
    status: MailStatus,
    timeout: Duration,
) -> Mail {
    let poll = Duration::from_millis(10);
    let mut waited = Duration::ZERO;
    loop {
        let mail = service.get_mail(key).await.expect("mail should exist");
        if mail.status == status {
            return mail;
        }
        if waited >= timeout {
            panic!(
                "Mail {} still {} after {:?}, expected {}",
                key, mail.status, timeout, status
            );
        }
        tokio::time::sleep(poll).await;
        waited += poll;
    }
}
