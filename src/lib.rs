//! # mailtrack
//!
//! Schedule and deliver email, then track opens and link clicks.
//!
//! A created mail is persisted with its carbon copies and trackers, handed to
//! a pool of delivery workers (immediately or at its scheduled time), and
//! moved to `Sent` or `Failed` by the worker. Every mail gets a tracking pixel
//! and one redirect link per requested click event; hits on those keys are
//! turned into append-only events with a per-hit enrichment log.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use mailtrack::blob::MemoryFileStore;
//! use mailtrack::event::MemoryEventStore;
//! use mailtrack::storage::MemoryStore;
//! use mailtrack::providers::LocalMailer;
//! use mailtrack::*;
//!
//! let store = Arc::new(MemoryStore::new());
//! let events = Arc::new(MemoryEventStore::new());
//! let mailer = Arc::new(LocalMailer::new());
//!
//! let worker = DeliveryWorker::new(store.clone(), mailer, Composer::new());
//! let pool = DeliveryPool::start(PoolConfig::default(), worker);
//! let service = MailAggregateService::new(
//!     store.clone(),
//!     events.clone(),
//!     Arc::new(MemoryFileStore::new()),
//!     pool.dispatcher(),
//! );
//!
//! let mail = service
//!     .create_mail(
//!         MailRequest::new("Hello", "<p>Hi</p>", "user@example.com")
//!             .event(EventSpec::link_click("https://example.com/welcome")),
//!     )
//!     .await?;
//! ```
//!
//! ## Environment Variables
//!
//! | Variable | Description |
//! |----------|-------------|
//! | `EMAIL_PROVIDER` | `smtp`, `local`, `logger`, `logger_full` |
//! | `EMAIL_FROM` | Default sender email |
//! | `EMAIL_FROM_NAME` | Default sender name |
//! | `SMTP_HOST` | SMTP server host |
//! | `SMTP_PORT` | SMTP server port (default: 587) |
//! | `SMTP_USERNAME` | SMTP username |
//! | `SMTP_PASSWORD` | SMTP password |
//! | `DISPATCH_WORKERS` | Delivery workers (default: 4) |
//! | `DISPATCH_QUEUE_CAPACITY` | Ready-job queue size (default: 1024) |
//! | `DELIVERY_MAX_ATTEMPTS` | Attempts per mail (default: 5) |
//! | `DELIVERY_RETRY_DELAY_SECS` | Delay between attempts (default: 10) |
//! | `PUBLIC_KEY_STRATEGY` | `random` or `sortable` (default: random) |
//! | `PUBLIC_KEY_MAX_RETRIES` | Key generation budget (default: 10) |
//! | `TRACKING_BASE_URL` | Public tracking URL; enables the open pixel |
//! | `ATTACHMENT_ROOT` | Attachment blob directory (default: ./media) |
//! | `BIND_ADDR` | Server listen address (default: 0.0.0.0:8080) |
//!
//! ## Feature Flags
//!
//! - `smtp` - SMTP transport via lettre
//! - `local` - LocalMailer and test assertions (default)
//! - `http` - Axum JSON API and tracking endpoint
//! - `server` - `mailtrack-server` binary
//! - `metrics` - Prometheus-style metrics (counters/histograms)
//!
//! ## Metrics
//!
//! Enable `features = ["metrics"]` to emit Prometheus-style metrics:
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `mailtrack_deliveries_total` | Counter | provider, status | Delivery attempts |
//! | `mailtrack_delivery_duration_seconds` | Histogram | provider | Delivery duration |
//! | `mailtrack_tracking_hits_total` | Counter | event_type, resolved | Tracking hits |
//! | `mailtrack_event_log_dropped_total` | Counter | | Enrichment logs given up on |
//! | `mailtrack_duplicate_schedules_total` | Counter | | Jobs for already-final mails |
//!
//! Install a recorder (e.g., `metrics-exporter-prometheus`) in your app to collect them.

/// The version of the mailtrack crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

mod address;
mod email;
mod error;
mod mailer;
mod retry;

pub mod attachment;
pub mod blob;
pub mod compose;
pub mod config;
pub mod dispatch;
pub mod event;
pub mod identifier;
pub mod mail;
pub mod providers;
pub mod service;
pub mod storage;
pub mod tracking;
pub mod useragent;
pub mod worker;

#[cfg(feature = "local")]
pub mod testing;

#[cfg(feature = "http")]
pub mod http;

// Re-exports
pub use address::{validate_address, Address};
pub use attachment::{Attachment, AttachmentType, UploadRequest};
pub use compose::Composer;
pub use config::Config;
pub use dispatch::{DeliveryJob, DeliveryPool, Dispatcher, JobHandle, PoolConfig};
pub use email::Email;
pub use error::{DeliveryError, MailError, StoreError};
pub use event::{Engagement, EventKind, EventStore, MailEvent, MailEventLog, MailRef};
pub use identifier::{Entity, IdentifierIssuer, KeyStrategy, PublicKey};
pub use mail::{EventSpec, Mail, MailRequest, MailStatus, Tracker, TrackerKind};
pub use mailer::{DeliveryResult, Mailer};
pub use service::{AttachmentDeletion, MailAggregateService};
pub use storage::MailStore;
pub use tracking::{Ack, RequestMetadata, TrackingIngestor, TrackingResponse};
pub use worker::{DeliveryWorker, JobOutcome, RetryPolicy};
