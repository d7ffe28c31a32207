//! Local adapter tests.

use mailtrack::providers::LocalMailer;
use mailtrack::{DeliveryError, Email, Mailer};

fn email(subject: &str) -> Email {
    Email::new()
        .from("noreply@example.com")
        .to("reader@example.com")
        .subject(subject)
        .html_body("<p>Hello!</p>")
}

// ============================================================================
// Capture
// ============================================================================

#[tokio::test]
async fn captures_sent_emails() {
    let mailer = LocalMailer::new();

    let result = mailer.deliver(&email("Hello")).await.unwrap();
    assert!(!result.message_id.is_empty());

    assert_eq!(mailer.email_count(), 1);
    assert_eq!(mailer.attempts(), 1);
    assert!(mailer.sent_to("READER@example.com"));
    assert_eq!(mailer.last_email().unwrap().id, result.message_id);
}

#[tokio::test]
async fn lists_newest_first_and_flushes() {
    let mailer = LocalMailer::new();
    mailer.deliver(&email("First")).await.unwrap();
    mailer.deliver(&email("Second")).await.unwrap();

    let emails = mailer.emails();
    assert_eq!(emails[0].email.subject, "Second");
    assert_eq!(mailer.find_emails(|e| e.subject == "First").len(), 1);

    let flushed = mailer.flush();
    assert_eq!(flushed.len(), 2);
    assert_eq!(mailer.email_count(), 0);
}

#[tokio::test]
async fn clones_share_captures() {
    let mailer = LocalMailer::new();
    let clone = mailer.clone();
    clone.deliver(&email("Shared")).await.unwrap();
    assert_eq!(mailer.email_count(), 1);
}

// ============================================================================
// Failure Simulation
// ============================================================================

#[tokio::test]
async fn transient_failures_run_out() {
    let mailer = LocalMailer::new();
    mailer.fail_transient(2);

    for _ in 0..2 {
        let err = mailer.deliver(&email("Retry")).await.unwrap_err();
        assert!(err.is_retryable());
    }
    assert!(mailer.deliver(&email("Retry")).await.is_ok());
    assert_eq!(mailer.attempts(), 3);
    assert_eq!(mailer.email_count(), 1);
}

#[tokio::test]
async fn terminal_failure_until_cleared() {
    let mailer = LocalMailer::new();
    mailer.fail_terminal("550 mailbox unavailable");

    let err = mailer.deliver(&email("Nope")).await.unwrap_err();
    assert!(matches!(err, DeliveryError::Terminal(ref m) if m.contains("550")));
    assert!(mailer.deliver(&email("Nope")).await.is_err());

    mailer.clear_failure();
    assert!(mailer.deliver(&email("Yes")).await.is_ok());
    assert_eq!(mailer.email_count(), 1);
}

#[test]
fn provider_name_returns_local() {
    assert_eq!(LocalMailer::new().provider_name(), "local");
}
