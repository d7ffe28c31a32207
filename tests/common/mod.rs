//! Shared wiring for integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use mailtrack::blob::MemoryFileStore;
use mailtrack::event::MemoryEventStore;
use mailtrack::providers::LocalMailer;
use mailtrack::storage::MemoryStore;
use mailtrack::{
    Composer, DeliveryPool, DeliveryWorker, IdentifierIssuer, MailAggregateService, PoolConfig,
    RetryPolicy, TrackingIngestor,
};

pub const TRACKING_BASE: &str = "https://t.example.com/";

/// In-memory collaborators, a running pool, and the two entry points.
pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub events: Arc<MemoryEventStore>,
    pub files: Arc<MemoryFileStore>,
    pub mailer: LocalMailer,
    pub pool: DeliveryPool,
    pub service: MailAggregateService,
    pub ingestor: TrackingIngestor,
}

impl Harness {
    pub fn new() -> Self {
        Self::build(RetryPolicy::default(), IdentifierIssuer::default())
    }

    pub fn with_policy(policy: RetryPolicy) -> Self {
        Self::build(policy, IdentifierIssuer::default())
    }

    pub fn with_issuer(issuer: IdentifierIssuer) -> Self {
        Self::build(RetryPolicy::default(), issuer)
    }

    fn build(policy: RetryPolicy, issuer: IdentifierIssuer) -> Self {
        let store = Arc::new(MemoryStore::new());
        let events = Arc::new(MemoryEventStore::new());
        let files = Arc::new(MemoryFileStore::new());
        let mailer = LocalMailer::new();
        let composer = Composer::new()
            .from("noreply@example.com")
            .tracking_base_url(TRACKING_BASE)
            .unwrap();

        let worker = DeliveryWorker::new(store.clone(), Arc::new(mailer.clone()), composer.clone())
            .retry_policy(policy);
        let pool = DeliveryPool::start(PoolConfig::default(), worker);

        let service = MailAggregateService::new(
            store.clone(),
            events.clone(),
            files.clone(),
            pool.dispatcher(),
        )
        .issuer(issuer)
        .composer(composer)
        .retry_pause(Duration::from_millis(1));
        let ingestor =
            TrackingIngestor::new(store.clone(), events.clone()).write_retries(3, Duration::from_millis(1));

        Self {
            store,
            events,
            files,
            mailer,
            pool,
            service,
            ingestor,
        }
    }
}
