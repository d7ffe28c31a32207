//! Inbound tracking hits: pixel loads and redirect-link clicks.
//!
//! [`TrackingIngestor::ingest`] never fails. A miss or a storage outage only
//! changes what gets recorded, never what the client receives: pixels always
//! come back as an image, resolved redirects always forward.

use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::Instrument;
use ulid::Ulid;

use crate::event::{EventStore, MailEvent, MailEventLog, MailRef};
use crate::identifier::PublicKey;
use crate::mail::{Mail, Tracker, TrackerKind};
use crate::retry::with_retries;
use crate::storage::MailStore;
use crate::useragent;

/// A transparent 1x1 GIF.
pub const PIXEL_GIF: &[u8] = &[
    0x47, 0x49, 0x46, 0x38, 0x39, 0x61, 0x01, 0x00, 0x01, 0x00, 0x80, 0x00, 0x00, 0x00, 0x00,
    0x00, 0xff, 0xff, 0xff, 0x21, 0xf9, 0x04, 0x01, 0x00, 0x00, 0x00, 0x00, 0x2c, 0x00, 0x00,
    0x00, 0x00, 0x01, 0x00, 0x01, 0x00, 0x00, 0x02, 0x02, 0x44, 0x01, 0x00, 0x3b,
];

/// Content type served with [`PIXEL_GIF`].
pub const PIXEL_CONTENT_TYPE: &str = "image/gif";

/// Default number of tries for each event store write.
pub const DEFAULT_WRITE_ATTEMPTS: u32 = 3;

// Edge proxies put the client's location in these.
const GEO_HEADERS: &[(&str, &str)] = &[
    ("cf-ipcountry", "country"),
    ("x-geo-country", "country"),
    ("x-geo-region", "region"),
    ("x-geo-city", "city"),
];

/// What the client asked with.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestMetadata {
    pub ip_address: String,
    /// Header map with lower-cased names.
    pub headers: BTreeMap<String, String>,
}

impl RequestMetadata {
    /// Metadata for a hit from `ip_address`.
    pub fn new(ip_address: impl Into<String>) -> Self {
        Self {
            ip_address: ip_address.into(),
            headers: BTreeMap::new(),
        }
    }

    /// Record a header. Names are case-insensitive; later values win.
    pub fn header(mut self, name: impl AsRef<str>, value: impl Into<String>) -> Self {
        self.headers
            .insert(name.as_ref().trim().to_ascii_lowercase(), value.into());
        self
    }

    /// The `User-Agent` header, or an empty string.
    pub fn user_agent(&self) -> &str {
        self.headers.get("user-agent").map(String::as_str).unwrap_or("")
    }

    /// The `Referer` header, if sent.
    pub fn referrer(&self) -> Option<&str> {
        self.headers
            .get("referer")
            .or_else(|| self.headers.get("referrer"))
            .map(String::as_str)
            .filter(|r| !r.is_empty())
    }

    /// Location fields supplied by an edge proxy.
    pub fn geo_location(&self) -> BTreeMap<String, String> {
        let mut geo = BTreeMap::new();
        for (header, field) in GEO_HEADERS {
            if let Some(value) = self.headers.get(*header).map(|v| v.trim()) {
                // "XX" is Cloudflare's "unknown".
                if !value.is_empty() && value != "XX" {
                    geo.entry(field.to_string())
                        .or_insert_with(|| value.to_string());
                }
            }
        }
        geo
    }
}

/// Response to send for a hit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackingResponse {
    /// Serve [`PIXEL_GIF`].
    Pixel,
    /// Forward the client to this URL.
    Redirect(String),
}

/// Result of one ingestion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    pub response: TrackingResponse,
    /// The appended event, if any.
    pub event_id: Option<Ulid>,
    /// Whether the enrichment log was written.
    pub logged: bool,
}

impl Ack {
    fn miss() -> Self {
        Self {
            response: TrackingResponse::Pixel,
            event_id: None,
            logged: false,
        }
    }
}

/// Turns tracking hits into events and logs.
#[derive(Clone)]
pub struct TrackingIngestor {
    store: Arc<dyn MailStore>,
    events: Arc<dyn EventStore>,
    write_attempts: u32,
    retry_pause: Duration,
    dropped_logs: Arc<AtomicU64>,
}

impl TrackingIngestor {
    /// Create an ingestor over the two stores.
    pub fn new(store: Arc<dyn MailStore>, events: Arc<dyn EventStore>) -> Self {
        Self {
            store,
            events,
            write_attempts: DEFAULT_WRITE_ATTEMPTS,
            retry_pause: Duration::from_millis(25),
            dropped_logs: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Override the per-write retry policy.
    pub fn write_retries(mut self, attempts: u32, pause: Duration) -> Self {
        self.write_attempts = attempts.max(1);
        self.retry_pause = pause;
        self
    }

    /// Logs given up on since startup.
    pub fn dropped_logs(&self) -> u64 {
        self.dropped_logs.load(Ordering::Relaxed)
    }

    /// Record a hit on `key` and decide the response.
    pub async fn ingest(&self, key: &str, meta: RequestMetadata) -> Ack {
        let span = tracing::info_span!("mailtrack.ingest", key = %key);
        self.ingest_inner(key, meta).instrument(span).await
    }

    async fn ingest_inner(&self, key: &str, meta: RequestMetadata) -> Ack {
        let Some((tracker, mail)) = self.resolve(key).await else {
            #[cfg(feature = "metrics")]
            metrics::counter!("mailtrack_tracking_hits_total", "event_type" => "none", "resolved" => "false")
                .increment(1);
            return Ack::miss();
        };

        let kind = tracker.kind.event_kind();
        #[cfg(feature = "metrics")]
        metrics::counter!("mailtrack_tracking_hits_total", "event_type" => kind.as_str(), "resolved" => "true")
            .increment(1);

        let response = match (&tracker.kind, &tracker.redirect_to) {
            (TrackerKind::Redirect, Some(url)) => TrackingResponse::Redirect(url.clone()),
            _ => TrackingResponse::Pixel,
        };

        let event = MailEvent::new(kind, MailRef(mail.id), tracker.redirect_to.clone());
        let event_id = event.id;

        let events = &self.events;
        if let Err(e) = with_retries(self.write_attempts, self.retry_pause, "event", || {
            events.append_event(event.clone())
        })
        .await
        {
            tracing::error!(error = %e, mail_id = mail.id, event_type = %kind, "Dropped tracking event");
            return Ack {
                response,
                event_id: None,
                logged: false,
            };
        }

        let log = build_log(event_id, &meta);
        let logged = match with_retries(self.write_attempts, self.retry_pause, "log", || {
            events.append_log(log.clone())
        })
        .await
        {
            Ok(()) => true,
            Err(e) => {
                self.dropped_logs.fetch_add(1, Ordering::Relaxed);
                #[cfg(feature = "metrics")]
                metrics::counter!("mailtrack_event_log_dropped_total").increment(1);
                tracing::error!(error = %e, event_id = %event_id, "Dropped event log after retries");
                false
            }
        };

        tracing::info!(mail_id = mail.id, event_type = %kind, "Tracking hit recorded");
        Ack {
            response,
            event_id: Some(event_id),
            logged,
        }
    }

    /// Find the tracker and confirm its mail still exists.
    async fn resolve(&self, key: &str) -> Option<(Tracker, Mail)> {
        let key = PublicKey::new(key.trim());
        if key.as_str().is_empty() {
            return None;
        }

        let tracker = match self.store.tracker_by_key(&key).await {
            Ok(Some(tracker)) => tracker,
            Ok(None) => {
                tracing::warn!(key = %key, "Tracking hit on unknown key");
                return None;
            }
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Tracker lookup failed");
                return None;
            }
        };

        match self.store.mail(tracker.mail_id).await {
            Ok(Some(mail)) => Some((tracker, mail)),
            Ok(None) => {
                tracing::warn!(key = %key, mail_id = tracker.mail_id, "Tracker points at a missing mail");
                None
            }
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Mail lookup failed");
                None
            }
        }
    }
}

fn build_log(event_id: Ulid, meta: &RequestMetadata) -> MailEventLog {
    let agent = useragent::parse(meta.user_agent());
    MailEventLog {
        id: Ulid::new(),
        event_id,
        ip_address: meta.ip_address.clone(),
        user_agent: meta.user_agent().to_string(),
        browser: agent.browser,
        os: agent.os,
        device_type: agent.device_type.as_str().to_string(),
        headers: meta.headers.clone(),
        geo_location: meta.geo_location(),
        is_bot: agent.is_bot,
        referrer: meta.referrer().map(str::to_string),
        created_time: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_headers_are_case_insensitive() {
        let meta = RequestMetadata::new("198.51.100.4")
            .header("User-Agent", "curl/8.0")
            .header("REFERER", "https://mail.example.com/");
        assert_eq!(meta.user_agent(), "curl/8.0");
        assert_eq!(meta.referrer(), Some("https://mail.example.com/"));
    }

    #[test]
    fn test_geo_from_edge_headers() {
        let meta = RequestMetadata::new("198.51.100.4")
            .header("CF-IPCountry", "DE")
            .header("X-Geo-Country", "FR")
            .header("X-Geo-City", "Berlin");
        let geo = meta.geo_location();
        assert_eq!(geo.get("country").map(String::as_str), Some("DE"));
        assert_eq!(geo.get("city").map(String::as_str), Some("Berlin"));

        let unknown = RequestMetadata::new("x").header("cf-ipcountry", "XX");
        assert!(unknown.geo_location().is_empty());
    }

    #[test]
    fn test_log_fields_from_metadata() {
        let meta = RequestMetadata::new("203.0.113.1").header(
            "user-agent",
            "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
        );
        let log = build_log(Ulid::new(), &meta);
        assert_eq!(log.browser, "Chrome");
        assert_eq!(log.device_type, "desktop");
        assert!(!log.is_bot);
        assert_eq!(log.referrer, None);
    }

    #[test]
    fn test_pixel_is_a_gif() {
        assert!(PIXEL_GIF.starts_with(b"GIF89a"));
        assert_eq!(PIXEL_GIF.last(), Some(&0x3b));
    }
}
