//! Request-path orchestration for mails and attachments.

use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use crate::attachment::{upload_path, Attachment, NewAttachment, UploadRequest};
use crate::blob::FileStore;
use crate::compose::Composer;
use crate::dispatch::Dispatcher;
use crate::email::Email;
use crate::error::MailError;
use crate::event::{Engagement, EventStore, MailEvent, MailRef};
use crate::identifier::{Entity, IdentifierIssuer, PublicKey};
use crate::mail::{EventSpec, Mail, MailRequest, NewMail, NewTracker, TrackerKind, ValidMail};
use crate::retry::with_retries;
use crate::storage::MailStore;

/// Tries for each event append at mail creation.
const EVENT_WRITE_ATTEMPTS: u32 = 3;
/// Tries for releasing an attachment's blob.
const BLOB_RELEASE_ATTEMPTS: u32 = 3;

/// Result of deleting an attachment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttachmentDeletion {
    pub attachment: Attachment,
    /// Whether the backing blob was removed. `false` means an orphaned blob.
    pub blob_released: bool,
}

/// Creates, reads and deletes mails and attachments.
#[derive(Clone)]
pub struct MailAggregateService {
    store: Arc<dyn MailStore>,
    events: Arc<dyn EventStore>,
    files: Arc<dyn FileStore>,
    dispatcher: Dispatcher,
    issuer: IdentifierIssuer,
    composer: Composer,
    retry_pause: Duration,
}

impl MailAggregateService {
    pub fn new(
        store: Arc<dyn MailStore>,
        events: Arc<dyn EventStore>,
        files: Arc<dyn FileStore>,
        dispatcher: Dispatcher,
    ) -> Self {
        Self {
            store,
            events,
            files,
            dispatcher,
            issuer: IdentifierIssuer::default(),
            composer: Composer::new(),
            retry_pause: Duration::from_millis(50),
        }
    }

    /// Use a different key issuer.
    pub fn issuer(mut self, issuer: IdentifierIssuer) -> Self {
        self.issuer = issuer;
        self
    }

    /// Use a different composer (sender, tracking base URL).
    pub fn composer(mut self, composer: Composer) -> Self {
        self.composer = composer;
        self
    }

    /// Pause between retried collaborator writes.
    pub fn retry_pause(mut self, pause: Duration) -> Self {
        self.retry_pause = pause;
        self
    }

    // =========================================================================
    // Mails
    // =========================================================================

    /// Validate, persist and schedule a mail.
    ///
    /// The mail, its carbon copies, trackers and attachment links are written
    /// in one insert. If the job queue refuses the mail, the insert is undone
    /// and the call fails. Initial events are appended last and are
    /// best-effort: when none are requested a single `open` is recorded.
    pub async fn create_mail(&self, request: MailRequest) -> Result<Mail, MailError> {
        let valid = request.validate()?;

        let store = &self.store;
        let issuer = &self.issuer;
        let mail = self
            .issuer
            .create_with(self.store.as_ref(), Entity::Mail, |key| {
                store.insert_mail(new_mail(key, &valid, issuer))
            })
            .await?;

        if let Err(e) = self.dispatcher.schedule(&mail) {
            tracing::error!(error = %e, mail_id = mail.id, "Could not schedule mail, rolling back");
            if let Err(rollback) = self.store.delete_mail(mail.id).await {
                tracing::error!(error = %rollback, mail_id = mail.id, "Rollback of unscheduled mail failed");
            }
            return Err(e);
        }

        let specs = if valid.events.is_empty() {
            vec![EventSpec::open()]
        } else {
            valid.events
        };
        for spec in specs {
            let event = MailEvent::new(spec.event_type, MailRef(mail.id), spec.redirect_to);
            let events = &self.events;
            if let Err(e) = with_retries(EVENT_WRITE_ATTEMPTS, self.retry_pause, "event", || {
                events.append_event(event.clone())
            })
            .await
            {
                tracing::error!(error = %e, mail_id = mail.id, event_type = %event.event_type, "Dropped initial event");
            }
        }

        tracing::info!(
            mail_id = mail.id,
            public_key = %mail.public_key,
            scheduled = mail.scheduled_time.is_some(),
            "Mail created"
        );
        Ok(mail)
    }

    /// Fetch a mail by public key.
    pub async fn get_mail(&self, key: &PublicKey) -> Result<Mail, MailError> {
        self.store
            .mail_by_key(key)
            .await?
            .ok_or_else(|| MailError::not_found(Entity::Mail, key.as_str()))
    }

    /// Every mail, newest first.
    pub async fn list_mails(&self) -> Result<Vec<Mail>, MailError> {
        Ok(self.store.list_mails().await?)
    }

    /// Delete a mail with its carbon copies and trackers.
    ///
    /// Attachments and recorded events are kept. A job still waiting for
    /// this mail finds it gone when it fires and does nothing.
    pub async fn delete_mail(&self, key: &PublicKey) -> Result<Mail, MailError> {
        let mail = self.get_mail(key).await?;
        let deleted = self.store.delete_mail(mail.id).await?;
        tracing::info!(mail_id = deleted.id, public_key = %key, "Mail deleted");
        Ok(deleted)
    }

    /// Events and hits recorded for a mail.
    pub async fn engagement(&self, key: &PublicKey) -> Result<Engagement, MailError> {
        let mail = self.get_mail(key).await?;
        Engagement::load(self.events.as_ref(), MailRef(mail.id)).await
    }

    /// The payload the delivery worker would hand to the transport.
    pub fn compose(&self, mail: &Mail) -> Result<Email, MailError> {
        self.composer.compose(mail)
    }

    /// Public URL of each of the mail's trackers, when a base URL is set.
    pub fn tracker_urls(&self, mail: &Mail) -> Vec<(PublicKey, String)> {
        mail.trackers
            .iter()
            .filter_map(|t| {
                self.composer
                    .tracker_url(t)
                    .map(|url| (t.public_key.clone(), url))
            })
            .collect()
    }

    // =========================================================================
    // Attachments
    // =========================================================================

    /// Store an uploaded file and create its attachment row.
    ///
    /// The blob is written under a fresh name first; if the row cannot be
    /// created the blob is removed again.
    pub async fn upload_attachment(&self, upload: UploadRequest) -> Result<Attachment, MailError> {
        let name = upload.display_name()?;
        if upload.content.is_empty() {
            return Err(MailError::validation("file", "the submitted file is empty"));
        }
        let attachment_type = self.store.attachment_type(upload.resolve_type()?).await?;
        let file = upload_path(&upload.filename, Utc::now());
        let size = upload.content.len() as u64;

        self.files
            .put(&file, upload.content)
            .await
            .map_err(|e| MailError::Blob(e.to_string()))?;

        let store = &self.store;
        let result = self
            .issuer
            .create_with(self.store.as_ref(), Entity::Attachment, |key| {
                store.insert_attachment(NewAttachment {
                    public_key: key,
                    name: name.clone(),
                    file: file.clone(),
                    attachment_type: Some(attachment_type.clone()),
                    size,
                })
            })
            .await;

        match result {
            Ok(attachment) => {
                tracing::info!(
                    attachment_id = attachment.id,
                    public_key = %attachment.public_key,
                    attachment_type = %attachment_type,
                    size,
                    "Attachment uploaded"
                );
                Ok(attachment)
            }
            Err(e) => {
                if let Err(cleanup) = self.files.delete(&file).await {
                    tracing::warn!(error = %cleanup, file = %file, "Could not remove blob of failed upload");
                }
                Err(e)
            }
        }
    }

    /// Fetch an attachment by public key.
    pub async fn get_attachment(&self, key: &PublicKey) -> Result<Attachment, MailError> {
        self.store
            .attachment_by_key(key)
            .await?
            .ok_or_else(|| MailError::not_found(Entity::Attachment, key.as_str()))
    }

    /// Every attachment, newest first.
    pub async fn list_attachments(&self) -> Result<Vec<Attachment>, MailError> {
        Ok(self.store.list_attachments().await?)
    }

    /// Delete an attachment row, then release its blob.
    ///
    /// The row deletion is what the caller sees succeed or fail. Blob release
    /// is retried a few times afterwards; if it still fails the orphan is
    /// logged and reported through [`AttachmentDeletion::blob_released`].
    pub async fn delete_attachment(&self, key: &PublicKey) -> Result<AttachmentDeletion, MailError> {
        let attachment = self.get_attachment(key).await?;
        let attachment = self.store.delete_attachment(attachment.id).await?;

        let files = &self.files;
        let file = attachment.file.as_str();
        let blob_released = match with_retries(BLOB_RELEASE_ATTEMPTS, self.retry_pause, "blob", || {
            files.delete(file)
        })
        .await
        {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(error = %e, file = %attachment.file, "Orphaned attachment blob");
                false
            }
        };

        tracing::info!(attachment_id = attachment.id, blob_released, "Attachment deleted");
        Ok(AttachmentDeletion {
            attachment,
            blob_released,
        })
    }
}

fn new_mail(key: PublicKey, valid: &ValidMail, issuer: &IdentifierIssuer) -> NewMail {
    let mut trackers = vec![NewTracker {
        public_key: issuer.generate(),
        kind: TrackerKind::Pixel,
        redirect_to: None,
    }];
    trackers.extend(valid.events.iter().filter_map(|spec| {
        spec.redirect_to.as_ref().map(|url| NewTracker {
            public_key: issuer.generate(),
            kind: TrackerKind::Redirect,
            redirect_to: Some(url.clone()),
        })
    }));

    NewMail {
        public_key: key,
        subject: valid.subject.clone(),
        body: valid.body.clone(),
        recipient: valid.recipient.clone(),
        scheduled_time: valid.scheduled_time,
        tags: valid.tags.clone(),
        carbon_copies: valid.carbon_copies.clone(),
        attachment_ids: valid.attachment_ids.clone(),
        trackers,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pixel_plus_one_redirect_per_click() {
        let valid = MailRequest::new("Hi", "Body", "a@example.com")
            .event(EventSpec::open())
            .event(EventSpec::link_click("https://example.com/a"))
            .event(EventSpec::link_click("https://example.com/b"))
            .validate()
            .unwrap();

        let mail = new_mail(PublicKey::new("mail"), &valid, &IdentifierIssuer::default());
        assert_eq!(mail.trackers.len(), 3);
        assert_eq!(mail.trackers[0].kind, TrackerKind::Pixel);
        assert_eq!(mail.trackers[0].redirect_to, None);

        let targets: Vec<_> = mail.trackers[1..]
            .iter()
            .map(|t| (t.kind, t.redirect_to.as_deref()))
            .collect();
        assert_eq!(
            targets,
            vec![
                (TrackerKind::Redirect, Some("https://example.com/a")),
                (TrackerKind::Redirect, Some("https://example.com/b")),
            ]
        );
        assert_ne!(mail.trackers[1].public_key, mail.trackers[2].public_key);
    }
}
