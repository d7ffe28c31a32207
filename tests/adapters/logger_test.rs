//! Logger adapter tests.

use mailtrack::providers::LoggerMailer;
use mailtrack::{Email, Mailer};

#[tokio::test]
async fn deliver_returns_ok() {
    let mailer = LoggerMailer::new();

    let email = Email::new()
        .from("noreply@example.com")
        .to("reader@example.com")
        .subject("Hello")
        .html_body("<p>Hello!</p>");

    let delivery = mailer.deliver(&email).await.unwrap();
    assert!(!delivery.message_id.is_empty());
}

#[tokio::test]
async fn deliver_with_full_logging_returns_ok() {
    let mailer = LoggerMailer::full();

    let email = Email::new()
        .from(("Sender", "noreply@example.com"))
        .to("reader@example.com")
        .cc("copy@example.com")
        .subject("Hello")
        .html_body("<h1>Hello!</h1>")
        .text_body("Hello!")
        .header("X-Mail-Key", "abc123");

    let delivery = mailer.deliver(&email).await.unwrap();
    assert!(!delivery.message_id.is_empty());
}

#[test]
fn provider_name_returns_logger() {
    assert_eq!(LoggerMailer::new().provider_name(), "logger");
}
