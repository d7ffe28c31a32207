//! Turning a stored mail into the payload handed to the transport.

use url::Url;

use crate::address::{validate_address, Address};
use crate::email::Email;
use crate::error::MailError;
use crate::mail::{Mail, Tracker};

/// Header carrying the mail's public key on every outgoing message.
pub const MAIL_KEY_HEADER: &str = "X-Mail-Key";

/// Builds [`Email`]s from stored mails.
#[derive(Debug, Clone, Default)]
pub struct Composer {
    from: Option<Address>,
    tracking_base: Option<Url>,
}

impl Composer {
    /// A composer with no sender and no pixel embedding.
    pub fn new() -> Self {
        Self::default()
    }

    /// Default sender for every message.
    pub fn from(mut self, from: impl Into<Address>) -> Self {
        self.from = Some(from.into());
        self
    }

    /// Public base URL of the tracking endpoint. Enables the open pixel.
    pub fn tracking_base_url(mut self, base: &str) -> Result<Self, MailError> {
        let mut url = Url::parse(base.trim()).map_err(|e| {
            MailError::Configuration(format!("TRACKING_BASE_URL '{}': {}", base, e))
        })?;
        if !url.path().ends_with('/') {
            let path = format!("{}/", url.path());
            url.set_path(&path);
        }
        self.tracking_base = Some(url);
        Ok(self)
    }

    /// Public URL of a tracker, when a base URL is configured.
    pub fn tracker_url(&self, tracker: &Tracker) -> Option<String> {
        self.tracking_base
            .as_ref()
            .and_then(|base| base.join(tracker.public_key.as_str()).ok())
            .map(String::from)
    }

    /// Compose the dispatch payload for `mail`.
    ///
    /// ```
    /// use mailtrack::compose::Composer;
    /// # use mailtrack::{Mail, MailStatus, PublicKey};
    /// # let now = chrono::Utc::now();
    /// # let mail = Mail {
    /// #     id: 1, public_key: PublicKey::new("k"), subject: "Hi".into(),
    /// #     body: "<p>Hi</p>".into(), recipient: "a@b.com".into(),
    /// #     scheduled_time: None, status: MailStatus::Pending, tags: vec![],
    /// #     carbon_copies: vec![], attachment_ids: vec![], trackers: vec![],
    /// #     created_time: now, modified_time: now,
    /// # };
    ///
    /// let email = Composer::new().from("noreply@example.com").compose(&mail).unwrap();
    /// assert_eq!(email.to[0].email, "a@b.com");
    /// assert_eq!(email.html_body.as_deref(), Some("<p>Hi</p>"));
    /// ```
    pub fn compose(&self, mail: &Mail) -> Result<Email, MailError> {
        let mut email = Email::new()
            .to(validate_address("recipient", &mail.recipient)?)
            .subject(mail.subject.clone())
            .header(MAIL_KEY_HEADER, mail.public_key.as_str());

        if let Some(from) = &self.from {
            email = email.from(from.clone());
        }
        for cc in &mail.carbon_copies {
            email = email.cc(validate_address("carbon_copies", &cc.email_address)?);
        }

        let pixel = mail.pixel().and_then(|p| self.tracker_url(p));
        let body = match pixel {
            Some(src) => format!(
                "{}<img src=\"{}\" width=\"1\" height=\"1\" alt=\"\" style=\"display:none\" />",
                mail.body, src
            ),
            None => mail.body.clone(),
        };
        Ok(email.html_body(body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identifier::PublicKey;
    use crate::mail::{CarbonCopy, MailStatus, TrackerKind};
    use chrono::Utc;

    fn mail() -> Mail {
        let now = Utc::now();
        Mail {
            id: 9,
            public_key: PublicKey::new("mailkey"),
            subject: "Hello".into(),
            body: "<p>Body</p>".into(),
            recipient: "to@example.com".into(),
            scheduled_time: None,
            status: MailStatus::Pending,
            tags: vec![],
            carbon_copies: vec![CarbonCopy {
                id: 1,
                email_address: "cc@example.com".into(),
                created_time: now,
            }],
            attachment_ids: vec![],
            trackers: vec![Tracker {
                id: 1,
                public_key: PublicKey::new("pixelkey"),
                mail_id: 9,
                kind: TrackerKind::Pixel,
                redirect_to: None,
                created_time: now,
            }],
            created_time: now,
            modified_time: now,
        }
    }

    #[test]
    fn test_compose_without_tracking() {
        let email = Composer::new().compose(&mail()).unwrap();
        assert!(email.from.is_none());
        assert_eq!(email.cc[0].email, "cc@example.com");
        assert_eq!(email.html_body.as_deref(), Some("<p>Body</p>"));
        assert_eq!(email.headers.get(MAIL_KEY_HEADER).map(String::as_str), Some("mailkey"));
    }

    #[test]
    fn test_compose_embeds_pixel() {
        let composer = Composer::new()
            .tracking_base_url("https://t.example.com/track")
            .unwrap();
        let email = composer.compose(&mail()).unwrap();
        let html = email.html_body.unwrap();
        assert!(html.starts_with("<p>Body</p><img src=\"https://t.example.com/track/pixelkey\""));
    }

    #[test]
    fn test_bad_base_url() {
        let err = Composer::new().tracking_base_url("not a url").unwrap_err();
        assert!(matches!(err, MailError::Configuration(_)));
    }
}
