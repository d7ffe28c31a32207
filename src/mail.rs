//! The mail aggregate: mail rows, their carbon copies, and their trackers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::address::validate_address;
use crate::error::MailError;
use crate::event::EventKind;
use crate::identifier::PublicKey;

/// Longest accepted subject.
pub const MAX_SUBJECT_LEN: usize = 256;
/// Longest accepted body.
pub const MAX_BODY_LEN: usize = 8096;
/// Longest accepted tag.
pub const MAX_TAG_LEN: usize = 100;

/// Delivery state of a mail.
///
/// Only the delivery worker moves a mail out of `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MailStatus {
    #[default]
    Pending,
    Sent,
    Failed,
    Unknown,
}

impl MailStatus {
    /// Stable numeric code (1 = pending ... 4 = unknown).
    pub fn code(&self) -> u8 {
        match self {
            MailStatus::Pending => 1,
            MailStatus::Sent => 2,
            MailStatus::Failed => 3,
            MailStatus::Unknown => 4,
        }
    }

    /// Inverse of [`code`](Self::code). Unrecognised codes map to `Unknown`.
    pub fn from_code(code: u8) -> Self {
        match code {
            1 => MailStatus::Pending,
            2 => MailStatus::Sent,
            3 => MailStatus::Failed,
            _ => MailStatus::Unknown,
        }
    }

    /// Human-readable label.
    pub fn label(&self) -> &'static str {
        match self {
            MailStatus::Pending => "Pending",
            MailStatus::Sent => "Sent",
            MailStatus::Failed => "Failed",
            MailStatus::Unknown => "Unknown",
        }
    }

    /// Whether the mail has left the dispatch pipeline.
    pub fn is_final(&self) -> bool {
        matches!(self, MailStatus::Sent | MailStatus::Failed)
    }
}

impl fmt::Display for MailStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A secondary recipient, owned by exactly one mail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CarbonCopy {
    pub id: i64,
    pub email_address: String,
    pub created_time: DateTime<Utc>,
}

/// What a tracking hit on a tracker means.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackerKind {
    /// 1x1 image; a load means the mail was opened.
    Pixel,
    /// Link that records a click and forwards to `redirect_to`.
    Redirect,
}

impl TrackerKind {
    /// Event recorded for a hit on this kind of tracker.
    pub fn event_kind(&self) -> EventKind {
        match self {
            TrackerKind::Pixel => EventKind::Open,
            TrackerKind::Redirect => EventKind::LinkClick,
        }
    }
}

/// An addressable tracking endpoint belonging to one mail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tracker {
    pub id: i64,
    pub public_key: PublicKey,
    pub mail_id: i64,
    pub kind: TrackerKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redirect_to: Option<String>,
    pub created_time: DateTime<Utc>,
}

/// A stored mail with its owned rows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mail {
    pub id: i64,
    pub public_key: PublicKey,
    pub subject: String,
    pub body: String,
    pub recipient: String,
    pub scheduled_time: Option<DateTime<Utc>>,
    pub status: MailStatus,
    pub tags: Vec<String>,
    pub carbon_copies: Vec<CarbonCopy>,
    pub attachment_ids: Vec<i64>,
    pub trackers: Vec<Tracker>,
    pub created_time: DateTime<Utc>,
    pub modified_time: DateTime<Utc>,
}

impl Mail {
    /// Whether the mail should be sent now rather than at a later instant.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.scheduled_time.map_or(true, |at| at <= now)
    }

    /// The mail's open-tracking pixel.
    pub fn pixel(&self) -> Option<&Tracker> {
        self.trackers.iter().find(|t| t.kind == TrackerKind::Pixel)
    }

    /// Redirect trackers, in creation order.
    pub fn redirects(&self) -> impl Iterator<Item = &Tracker> {
        self.trackers
            .iter()
            .filter(|t| t.kind == TrackerKind::Redirect)
    }
}

/// An initial tracking event requested at mail creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventSpec {
    pub event_type: EventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect_to: Option<String>,
}

impl EventSpec {
    /// An open event.
    pub fn open() -> Self {
        Self {
            event_type: EventKind::Open,
            redirect_to: None,
        }
    }

    /// A link-click event forwarding to `url`.
    pub fn link_click(url: impl Into<String>) -> Self {
        Self {
            event_type: EventKind::LinkClick,
            redirect_to: Some(url.into()),
        }
    }
}

/// Mail creation input, as accepted from API callers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MailRequest {
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub recipient: String,
    #[serde(default)]
    pub scheduled_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub carbon_copies: Vec<String>,
    #[serde(default)]
    pub attachment_ids: Vec<i64>,
    #[serde(default)]
    pub events: Vec<EventSpec>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl MailRequest {
    /// Start a request with the three required fields.
    pub fn new(
        subject: impl Into<String>,
        body: impl Into<String>,
        recipient: impl Into<String>,
    ) -> Self {
        Self {
            subject: subject.into(),
            body: body.into(),
            recipient: recipient.into(),
            ..Self::default()
        }
    }

    /// Send at `at` instead of immediately.
    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_time = Some(at);
        self
    }

    /// Add a carbon-copy recipient.
    pub fn cc(mut self, address: impl Into<String>) -> Self {
        self.carbon_copies.push(address.into());
        self
    }

    /// Reference an uploaded attachment by row id.
    pub fn attachment(mut self, id: i64) -> Self {
        self.attachment_ids.push(id);
        self
    }

    /// Request an initial tracking event.
    pub fn event(mut self, spec: EventSpec) -> Self {
        self.events.push(spec);
        self
    }

    /// Tag the mail.
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    /// Check every field and normalise the request.
    ///
    /// Redirect targets on non-click events are stripped here, so nothing
    /// downstream ever sees an open carrying a URL.
    pub fn validate(&self) -> Result<ValidMail, MailError> {
        let subject = required_text("subject", &self.subject, MAX_SUBJECT_LEN)?;
        let body = required_text("body", &self.body, MAX_BODY_LEN)?;
        let recipient = validate_address("recipient", &self.recipient)?.email;

        let carbon_copies = self
            .carbon_copies
            .iter()
            .map(|cc| validate_address("carbon_copies", cc).map(|a| a.email))
            .collect::<Result<Vec<_>, _>>()?;

        let mut attachment_ids = self.attachment_ids.clone();
        attachment_ids.sort_unstable();
        attachment_ids.dedup();

        let events = self
            .events
            .iter()
            .map(normalize_event)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(ValidMail {
            subject,
            body,
            recipient,
            scheduled_time: self.scheduled_time,
            carbon_copies,
            attachment_ids,
            events,
            tags: normalize_tags(&self.tags)?,
        })
    }
}

/// A validated creation request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidMail {
    pub subject: String,
    pub body: String,
    pub recipient: String,
    pub scheduled_time: Option<DateTime<Utc>>,
    pub carbon_copies: Vec<String>,
    pub attachment_ids: Vec<i64>,
    pub events: Vec<EventSpec>,
    pub tags: Vec<String>,
}

/// A tracker row to insert alongside its mail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTracker {
    pub public_key: PublicKey,
    pub kind: TrackerKind,
    pub redirect_to: Option<String>,
}

/// Everything written in one atomic mail insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMail {
    pub public_key: PublicKey,
    pub subject: String,
    pub body: String,
    pub recipient: String,
    pub scheduled_time: Option<DateTime<Utc>>,
    pub tags: Vec<String>,
    pub carbon_copies: Vec<String>,
    pub attachment_ids: Vec<i64>,
    pub trackers: Vec<NewTracker>,
}

fn required_text(field: &'static str, value: &str, max: usize) -> Result<String, MailError> {
    if value.trim().is_empty() {
        return Err(MailError::validation(field, "is required"));
    }
    if value.chars().count() > max {
        return Err(MailError::validation(
            field,
            format!("must be at most {} characters", max),
        ));
    }
    Ok(value.to_string())
}

fn normalize_event(spec: &EventSpec) -> Result<EventSpec, MailError> {
    match spec.event_type {
        EventKind::Open => Ok(EventSpec::open()),
        EventKind::LinkClick => {
            let target = spec
                .redirect_to
                .as_deref()
                .ok_or_else(|| MailError::validation("events", "link-click requires redirect_to"))?;
            Ok(EventSpec::link_click(validate_redirect(target)?))
        }
    }
}

/// Accept only absolute http(s) URLs as redirect targets.
pub fn validate_redirect(target: &str) -> Result<String, MailError> {
    let parsed = url::Url::parse(target.trim())
        .map_err(|e| MailError::validation("redirect_to", format!("'{}': {}", target, e)))?;
    if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
        return Err(MailError::validation(
            "redirect_to",
            format!("'{}' is not an http(s) URL", target),
        ));
    }
    Ok(parsed.to_string())
}

fn normalize_tags(tags: &[String]) -> Result<Vec<String>, MailError> {
    let mut out: Vec<String> = Vec::with_capacity(tags.len());
    for tag in tags {
        let tag = tag.trim().to_lowercase();
        if tag.is_empty() {
            continue;
        }
        if tag.chars().count() > MAX_TAG_LEN {
            return Err(MailError::validation(
                "tags",
                format!("'{}' is longer than {} characters", tag, MAX_TAG_LEN),
            ));
        }
        if !out.contains(&tag) {
            out.push(tag);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_status_codes_round_trip() {
        for status in [
            MailStatus::Pending,
            MailStatus::Sent,
            MailStatus::Failed,
            MailStatus::Unknown,
        ] {
            assert_eq!(MailStatus::from_code(status.code()), status);
        }
        assert_eq!(MailStatus::from_code(99), MailStatus::Unknown);
        assert_eq!(MailStatus::Sent.to_string(), "Sent");
    }

    #[test]
    fn test_validate_requires_fields() {
        let err = MailRequest::new("", "<p>Hi</p>", "a@b.com").validate().unwrap_err();
        assert_eq!(err.field(), Some("subject"));

        let err = MailRequest::new("Hi", "   ", "a@b.com").validate().unwrap_err();
        assert_eq!(err.field(), Some("body"));

        let err = MailRequest::new("Hi", "body", "not-an-address").validate().unwrap_err();
        assert_eq!(err.field(), Some("recipient"));
    }

    #[test]
    fn test_validate_bounds() {
        let long = "x".repeat(MAX_SUBJECT_LEN + 1);
        let err = MailRequest::new(long, "body", "a@b.com").validate().unwrap_err();
        assert_eq!(err.field(), Some("subject"));

        let exact = "x".repeat(MAX_SUBJECT_LEN);
        assert!(MailRequest::new(exact, "body", "a@b.com").validate().is_ok());
    }

    #[test]
    fn test_validate_strips_redirect_from_open() {
        let request = MailRequest::new("Hi", "body", "a@b.com").event(EventSpec {
            event_type: EventKind::Open,
            redirect_to: Some("https://example.com".into()),
        });
        let valid = request.validate().unwrap();
        assert_eq!(valid.events, vec![EventSpec::open()]);
    }

    #[test]
    fn test_validate_link_click_needs_http_url() {
        let missing = MailRequest::new("Hi", "body", "a@b.com").event(EventSpec {
            event_type: EventKind::LinkClick,
            redirect_to: None,
        });
        assert_eq!(missing.validate().unwrap_err().field(), Some("events"));

        let bad = MailRequest::new("Hi", "body", "a@b.com")
            .event(EventSpec::link_click("javascript:alert(1)"));
        assert_eq!(bad.validate().unwrap_err().field(), Some("redirect_to"));

        let good = MailRequest::new("Hi", "body", "a@b.com")
            .event(EventSpec::link_click("https://example.com/offer"));
        assert!(good.validate().is_ok());
    }

    #[test]
    fn test_tags_and_attachments_normalised() {
        let valid = MailRequest::new("Hi", "body", "a@b.com")
            .tag(" Promo ")
            .tag("promo")
            .tag("")
            .attachment(3)
            .attachment(1)
            .attachment(3)
            .validate()
            .unwrap();
        assert_eq!(valid.tags, vec!["promo"]);
        assert_eq!(valid.attachment_ids, vec![1, 3]);
    }

    #[test]
    fn test_is_due() {
        let now = Utc::now();
        let mut mail = Mail {
            id: 1,
            public_key: PublicKey::new("k"),
            subject: "s".into(),
            body: "b".into(),
            recipient: "a@b.com".into(),
            scheduled_time: None,
            status: MailStatus::Pending,
            tags: vec![],
            carbon_copies: vec![],
            attachment_ids: vec![],
            trackers: vec![],
            created_time: now,
            modified_time: now,
        };
        assert!(mail.is_due(now));

        mail.scheduled_time = Some(now - Duration::seconds(5));
        assert!(mail.is_due(now));

        mail.scheduled_time = Some(now + Duration::seconds(5));
        assert!(!mail.is_due(now));
    }
}
