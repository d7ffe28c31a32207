//! Engagement events and their per-hit logs.
//!
//! The event store is separate from the relational store. A [`MailEvent`]
//! points back at its mail through [`MailRef`], a plain copy of the mail's row
//! id that nothing enforces; readers re-check it against the mail store.
//!
//! Both record kinds are append-only. There is no update path.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use ulid::Ulid;

use crate::error::{MailError, StoreError};

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "open")]
    Open,
    #[serde(rename = "link-click")]
    LinkClick,
}

impl EventKind {
    /// Wire name (`open` / `link-click`).
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Open => "open",
            EventKind::LinkClick => "link-click",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cross-store reference to a relational mail row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MailRef(pub i64);

impl MailRef {
    /// The referenced row id.
    pub fn id(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for MailRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An engagement fact. Immutable once written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailEvent {
    pub id: Ulid,
    pub event_type: EventKind,
    pub sql_mail_id: MailRef,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redirect_to: Option<String>,
    pub created_time: DateTime<Utc>,
}

impl MailEvent {
    /// Build an event, keeping `redirect_to` only for link clicks.
    ///
    /// ```
    /// use mailtrack::event::{EventKind, MailEvent, MailRef};
    ///
    /// let open = MailEvent::new(EventKind::Open, MailRef(7), Some("https://x.io/".into()));
    /// assert_eq!(open.redirect_to, None);
    /// ```
    pub fn new(event_type: EventKind, mail: MailRef, redirect_to: Option<String>) -> Self {
        let redirect_to = match event_type {
            EventKind::LinkClick => redirect_to.filter(|url| !url.is_empty()),
            EventKind::Open => None,
        };
        Self {
            id: Ulid::new(),
            event_type,
            sql_mail_id: mail,
            redirect_to,
            created_time: Utc::now(),
        }
    }
}

/// Request metadata captured for one tracking hit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailEventLog {
    pub id: Ulid,
    pub event_id: Ulid,
    pub ip_address: String,
    pub user_agent: String,
    pub browser: String,
    pub os: String,
    pub device_type: String,
    pub headers: BTreeMap<String, String>,
    pub geo_location: BTreeMap<String, String>,
    pub is_bot: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub referrer: Option<String>,
    pub created_time: DateTime<Utc>,
}

/// Append-only store for events and logs.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Append an event.
    async fn append_event(&self, event: MailEvent) -> Result<(), StoreError>;

    /// Append a log entry. The parent event is not checked.
    async fn append_log(&self, log: MailEventLog) -> Result<(), StoreError>;

    /// Events referencing `mail`, oldest first.
    async fn events_for(&self, mail: MailRef) -> Result<Vec<MailEvent>, StoreError>;

    /// Logs of one event, oldest first.
    async fn logs_for(&self, event_id: Ulid) -> Result<Vec<MailEventLog>, StoreError>;
}

/// In-memory event store.
#[derive(Debug, Default)]
pub struct MemoryEventStore {
    events: RwLock<Vec<MailEvent>>,
    logs: RwLock<Vec<MailEventLog>>,
    failing_events: RwLock<usize>,
    failing_logs: RwLock<usize>,
}

impl MemoryEventStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `times` event appends fail.
    pub fn fail_next_event_writes(&self, times: usize) {
        *self.failing_events.write() = times;
    }

    /// Make the next `times` log appends fail.
    pub fn fail_next_log_writes(&self, times: usize) {
        *self.failing_logs.write() = times;
    }

    /// Every stored event.
    pub fn all_events(&self) -> Vec<MailEvent> {
        self.events.read().clone()
    }

    /// Every stored log.
    pub fn all_logs(&self) -> Vec<MailEventLog> {
        self.logs.read().clone()
    }

    /// Number of stored events.
    pub fn event_count(&self) -> usize {
        self.events.read().len()
    }

    /// Number of stored logs.
    pub fn log_count(&self) -> usize {
        self.logs.read().len()
    }
}

fn take_failure(counter: &RwLock<usize>) -> Result<(), StoreError> {
    let mut remaining = counter.write();
    if *remaining > 0 {
        *remaining -= 1;
        return Err(StoreError::Unavailable("simulated event store outage".into()));
    }
    Ok(())
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn append_event(&self, event: MailEvent) -> Result<(), StoreError> {
        take_failure(&self.failing_events)?;
        self.events.write().push(event);
        Ok(())
    }

    async fn append_log(&self, log: MailEventLog) -> Result<(), StoreError> {
        take_failure(&self.failing_logs)?;
        self.logs.write().push(log);
        Ok(())
    }

    async fn events_for(&self, mail: MailRef) -> Result<Vec<MailEvent>, StoreError> {
        Ok(self
            .events
            .read()
            .iter()
            .filter(|e| e.sql_mail_id == mail)
            .cloned()
            .collect())
    }

    async fn logs_for(&self, event_id: Ulid) -> Result<Vec<MailEventLog>, StoreError> {
        Ok(self
            .logs
            .read()
            .iter()
            .filter(|l| l.event_id == event_id)
            .cloned()
            .collect())
    }
}

/// An event together with its hits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EventWithLogs {
    #[serde(flatten)]
    pub event: MailEvent,
    pub logs: Vec<MailEventLog>,
}

/// Everything recorded for one mail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Engagement {
    pub mail: MailRef,
    pub opens: usize,
    pub clicks: usize,
    pub events: Vec<EventWithLogs>,
}

impl Engagement {
    /// Collect events and logs for `mail`.
    ///
    /// Open and click counts come from log entries (physical hits), not from
    /// the events themselves.
    pub async fn load<S>(store: &S, mail: MailRef) -> Result<Self, MailError>
    where
        S: EventStore + ?Sized,
    {
        let mut events = Vec::new();
        let (mut opens, mut clicks) = (0, 0);
        for event in store.events_for(mail).await? {
            let logs = store.logs_for(event.id).await?;
            match event.event_type {
                EventKind::Open => opens += logs.len(),
                EventKind::LinkClick => clicks += logs.len(),
            }
            events.push(EventWithLogs { event, logs });
        }
        Ok(Self {
            mail,
            opens,
            clicks,
            events,
        })
    }
}
