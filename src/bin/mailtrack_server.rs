//! Standalone mailtrack server.
//!
//! Configuration comes from the environment (see [`mailtrack::Config`]);
//! log verbosity from `RUST_LOG`.

use std::net::SocketAddr;
use std::sync::Arc;

use mailtrack::blob::LocalFileStore;
use mailtrack::event::MemoryEventStore;
use mailtrack::storage::MemoryStore;
use mailtrack::{Config, DeliveryPool, DeliveryWorker, MailAggregateService, TrackingIngestor};
use tower_http::trace::TraceLayer;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env()?;

    let store = Arc::new(MemoryStore::new());
    let events = Arc::new(MemoryEventStore::new());
    let files = Arc::new(LocalFileStore::new(config.attachment_root.clone()));
    let composer = config.composer()?;

    let worker = DeliveryWorker::new(store.clone(), config.mailer()?, composer.clone())
        .retry_policy(config.retry);
    let pool = DeliveryPool::start(config.pool, worker);

    let service = MailAggregateService::new(store.clone(), events.clone(), files, pool.dispatcher())
        .issuer(config.issuer())
        .composer(composer);
    let ingestor = TrackingIngestor::new(store, events);

    let app = mailtrack::http::create_router(service, ingestor).layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    tracing::info!(
        addr = %config.bind_addr,
        provider = %config.provider_name()?,
        attachment_root = %config.attachment_root.display(),
        "mailtrack server listening"
    );

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Could not listen for ctrl-c");
            }
            tracing::info!("Shutdown signal received");
        })
        .await?;

    pool.shutdown().await;
    tracing::info!(version = mailtrack::VERSION, "mailtrack server stopped");
    Ok(())
}
