//! Create, schedule and deliver mails end to end.
//!
//! Run with: cargo test --test pipeline_test

mod common;

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use common::Harness;
use mailtrack::testing::*;
use mailtrack::{
    EventKind, EventSpec, EventStore, IdentifierIssuer, KeyStrategy, MailError, MailRef,
    MailRequest, MailStatus, PublicKey, RetryPolicy,
};

fn request() -> MailRequest {
    MailRequest::new("Welcome", "<p>Hello there</p>", "user@example.com")
}

// ============================================================================
// Immediate delivery
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_created_mail_is_sent_with_one_open_event() {
    let h = Harness::new();

    let mail = h.service.create_mail(request()).await.unwrap();
    assert_eq!(mail.status, MailStatus::Pending);
    assert!(!mail.public_key.as_str().is_empty());

    let sent = wait_for_status(&h.service, &mail.public_key, MailStatus::Sent, Duration::from_secs(5)).await;
    assert!(sent.modified_time >= mail.modified_time);

    assert_email_count(&h.mailer, 1);
    assert_email_to(&h.mailer, "user@example.com");
    assert_email_subject_contains(&h.mailer, "Welcome");
    assert_email_header(&h.mailer, "X-Mail-Key", mail.public_key.as_str());

    let events = h.events.events_for(MailRef(mail.id)).await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, EventKind::Open);
    assert_eq!(events[0].redirect_to, None);
}

#[tokio::test(start_paused = true)]
async fn test_sent_mail_embeds_pixel_and_copies() {
    let h = Harness::new();

    let mail = h
        .service
        .create_mail(request().cc("boss@example.com"))
        .await
        .unwrap();
    wait_for_status(&h.service, &mail.public_key, MailStatus::Sent, Duration::from_secs(5)).await;

    let pixel = mail.pixel().unwrap();
    assert_email_cc(&h.mailer, "boss@example.com");
    assert_email_html_matches(
        &h.mailer,
        &format!(r#"<img src="https://t\.example\.com/{}""#, pixel.public_key),
    );
}

#[tokio::test(start_paused = true)]
async fn test_requested_events_are_recorded_as_given() {
    let h = Harness::new();

    let mail = h
        .service
        .create_mail(
            request()
                .event(EventSpec::open())
                .event(EventSpec::link_click("https://example.com/welcome")),
        )
        .await
        .unwrap();

    let events = h.events.events_for(MailRef(mail.id)).await.unwrap();
    assert_eq!(events.len(), 2);
    for event in &events {
        match event.event_type {
            EventKind::Open => assert_eq!(event.redirect_to, None),
            EventKind::LinkClick => assert_eq!(
                event.redirect_to.as_deref(),
                Some("https://example.com/welcome")
            ),
        }
    }
    assert_eq!(mail.redirects().count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_open_event_with_redirect_is_stripped() {
    let h = Harness::new();

    let mut spec = EventSpec::open();
    spec.redirect_to = Some("https://example.com/ignored".into());
    let mail = h.service.create_mail(request().event(spec)).await.unwrap();

    let events = h.events.events_for(MailRef(mail.id)).await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].redirect_to, None);
    assert_eq!(mail.redirects().count(), 0);
}

// ============================================================================
// Scheduling
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_scheduled_mail_is_not_sent_early() {
    let h = Harness::new();

    let at = Utc::now() + chrono::Duration::seconds(120);
    let mail = h.service.create_mail(request().scheduled_at(at)).await.unwrap();

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_no_email_sent(&h.mailer);
    assert_eq!(h.service.get_mail(&mail.public_key).await.unwrap().status, MailStatus::Pending);

    wait_for_status(&h.service, &mail.public_key, MailStatus::Sent, Duration::from_secs(120)).await;
    assert_email_count(&h.mailer, 1);
}

#[tokio::test(start_paused = true)]
async fn test_mail_deleted_before_due_is_never_sent() {
    let h = Harness::new();

    let at = Utc::now() + chrono::Duration::seconds(30);
    let mail = h.service.create_mail(request().scheduled_at(at)).await.unwrap();
    h.service.delete_mail(&mail.public_key).await.unwrap();

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(h.mailer.attempts(), 0);
    assert_eq!(h.pool.stats().skipped, 1);
}

#[tokio::test]
async fn test_schedule_failure_rolls_back_the_mail() {
    let Harness {
        pool,
        service,
        store,
        events,
        ..
    } = Harness::new();
    pool.shutdown().await;

    let err = service.create_mail(request()).await.unwrap_err();
    assert!(matches!(err, MailError::Dispatch(_)));
    assert_eq!(err.status_code(), 503);
    assert_eq!(store.mail_count(), 0);
    assert_eq!(store.tracker_count(), 0);
    assert_eq!(events.event_count(), 0);
}

// ============================================================================
// Retries
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_transient_failures_retry_then_succeed() {
    let h = Harness::new();
    h.mailer.fail_transient(2);

    let mail = h.service.create_mail(request()).await.unwrap();
    wait_for_status(&h.service, &mail.public_key, MailStatus::Sent, Duration::from_secs(60)).await;

    assert_eq!(h.mailer.attempts(), 3);
    assert_email_count(&h.mailer, 1);
    assert_eq!(h.pool.stats().retried, 2);
}

#[tokio::test(start_paused = true)]
async fn test_persistent_transient_failure_gives_up_after_five_attempts() {
    let h = Harness::new();
    h.mailer.fail_always();

    let mail = h.service.create_mail(request()).await.unwrap();
    wait_for_status(&h.service, &mail.public_key, MailStatus::Failed, Duration::from_secs(120)).await;

    // Nothing else is queued once the mail has failed.
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(h.mailer.attempts(), 5);
    assert_no_email_sent(&h.mailer);
    assert_eq!(h.pool.stats().failed, 1);
}

#[tokio::test(start_paused = true)]
async fn test_terminal_failure_is_not_retried() {
    let h = Harness::with_policy(RetryPolicy {
        max_attempts: 3,
        delay: Duration::from_secs(1),
    });
    h.mailer.fail_terminal("550 mailbox unavailable");

    let mail = h.service.create_mail(request()).await.unwrap();
    wait_for_status(&h.service, &mail.public_key, MailStatus::Failed, Duration::from_secs(10)).await;

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(h.mailer.attempts(), 1);
}

// ============================================================================
// Public keys
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_creators_get_distinct_keys() {
    // The first few candidates all collide.
    let counter = Arc::new(AtomicUsize::new(0));
    let issuer = IdentifierIssuer::new(KeyStrategy::RandomToken).with_generator(move || {
        let n = counter.fetch_add(1, Ordering::SeqCst);
        if n < 8 {
            PublicKey::new("dup")
        } else {
            PublicKey::new(format!("k{}", n))
        }
    });
    let h = Harness::with_issuer(issuer);

    let tasks: Vec<_> = (0..8)
        .map(|i| {
            let service = h.service.clone();
            tokio::spawn(async move {
                service
                    .create_mail(MailRequest::new("Hi", "Body", format!("user{}@example.com", i)))
                    .await
            })
        })
        .collect();

    let mut keys = HashSet::new();
    for task in tasks {
        let mail = task.await.unwrap().unwrap();
        assert!(keys.insert(mail.public_key.to_string()));
    }
    assert_eq!(keys.len(), 8);
    assert_eq!(h.store.mail_count(), 8);
}

#[tokio::test]
async fn test_exhausted_key_budget_fails_the_request() {
    let issuer = IdentifierIssuer::new(KeyStrategy::RandomToken)
        .max_attempts(3)
        .with_generator(|| PublicKey::new("always-the-same"));
    let h = Harness::with_issuer(issuer);

    h.service.create_mail(request()).await.unwrap();
    let err = h.service.create_mail(request()).await.unwrap_err();
    assert!(matches!(err, MailError::IdentifierExhausted { attempts: 3, .. }));
    assert_eq!(err.status_code(), 500);
    assert_eq!(h.store.mail_count(), 1);
}

// ============================================================================
// Validation
// ============================================================================

#[tokio::test]
async fn test_invalid_requests_write_nothing() {
    let h = Harness::new();

    let err = h
        .service
        .create_mail(MailRequest::new("", "Body", "user@example.com"))
        .await
        .unwrap_err();
    assert_eq!(err.field(), Some("subject"));

    let err = h
        .service
        .create_mail(MailRequest::new("Hi", "Body", "not-an-address"))
        .await
        .unwrap_err();
    assert_eq!(err.status_code(), 400);

    let err = h
        .service
        .create_mail(request().attachment(42))
        .await
        .unwrap_err();
    assert_eq!(err.field(), Some("attachment_ids"));

    assert_eq!(h.store.mail_count(), 0);
    assert_eq!(h.events.event_count(), 0);
}
