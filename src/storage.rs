//! Relational store collaborator and its in-memory implementation.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::attachment::{Attachment, AttachmentType, NewAttachment};
use crate::error::StoreError;
use crate::identifier::{Entity, KeyedTable, PublicKey};
use crate::mail::{CarbonCopy, Mail, MailStatus, NewMail, Tracker};

/// Durable storage for mails, attachments and trackers.
///
/// Implementations must enforce unique public keys per table and write a
/// [`NewMail`] with its carbon copies, trackers and attachment links as one
/// unit.
#[async_trait]
pub trait MailStore: KeyedTable {
    /// Insert a mail aggregate atomically.
    ///
    /// Fails with [`StoreError::UniqueViolation`] if the mail key or any
    /// tracker key is taken, and with [`StoreError::MissingReference`] if an
    /// attachment id does not exist. Nothing is written on failure.
    async fn insert_mail(&self, mail: NewMail) -> Result<Mail, StoreError>;

    /// Fetch a mail by row id.
    async fn mail(&self, id: i64) -> Result<Option<Mail>, StoreError>;

    /// Fetch a mail by public key.
    async fn mail_by_key(&self, key: &PublicKey) -> Result<Option<Mail>, StoreError>;

    /// Every mail, newest first.
    async fn list_mails(&self) -> Result<Vec<Mail>, StoreError>;

    /// Change a mail's status and bump its modified time.
    async fn set_status(&self, id: i64, status: MailStatus) -> Result<Mail, StoreError>;

    /// Remove a mail with its carbon copies and trackers. Attachments stay.
    async fn delete_mail(&self, id: i64) -> Result<Mail, StoreError>;

    /// Resolve a tracker by public key.
    async fn tracker_by_key(&self, key: &PublicKey) -> Result<Option<Tracker>, StoreError>;

    /// Insert an attachment row.
    async fn insert_attachment(&self, attachment: NewAttachment)
        -> Result<Attachment, StoreError>;

    /// Fetch an attachment by public key.
    async fn attachment_by_key(&self, key: &PublicKey)
        -> Result<Option<Attachment>, StoreError>;

    /// Every attachment, newest first.
    async fn list_attachments(&self) -> Result<Vec<Attachment>, StoreError>;

    /// Remove an attachment row and unlink it from every mail.
    async fn delete_attachment(&self, id: i64) -> Result<Attachment, StoreError>;

    /// Look up a (main, sub) type, creating it on first use.
    async fn attachment_type(&self, ty: AttachmentType) -> Result<AttachmentType, StoreError>;
}

#[derive(Debug, Default)]
struct Tables {
    mails: BTreeMap<i64, Mail>,
    mail_keys: HashMap<String, i64>,
    tracker_keys: HashMap<String, i64>,
    attachments: BTreeMap<i64, Attachment>,
    attachment_keys: HashMap<String, i64>,
    attachment_types: BTreeSet<AttachmentType>,
    next_mail_id: i64,
    next_cc_id: i64,
    next_tracker_id: i64,
    next_attachment_id: i64,
}

fn next(counter: &mut i64) -> i64 {
    *counter += 1;
    *counter
}

/// Thread-safe in-memory relational store.
///
/// All tables sit behind one lock, so each operation is a transaction.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
    failing_writes: RwLock<usize>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `times` writes fail with [`StoreError::Unavailable`].
    pub fn fail_next_writes(&self, times: usize) {
        *self.failing_writes.write() = times;
    }

    /// Number of stored mails.
    pub fn mail_count(&self) -> usize {
        self.tables.read().mails.len()
    }

    /// Number of stored carbon copies across all mails.
    pub fn carbon_copy_count(&self) -> usize {
        self.tables
            .read()
            .mails
            .values()
            .map(|m| m.carbon_copies.len())
            .sum()
    }

    /// Number of stored trackers across all mails.
    pub fn tracker_count(&self) -> usize {
        self.tables.read().tracker_keys.len()
    }

    /// Number of stored attachments.
    pub fn attachment_count(&self) -> usize {
        self.tables.read().attachments.len()
    }

    /// Known attachment types.
    pub fn attachment_types(&self) -> Vec<AttachmentType> {
        self.tables.read().attachment_types.iter().cloned().collect()
    }

    fn check_write(&self) -> Result<(), StoreError> {
        let mut failing = self.failing_writes.write();
        if *failing > 0 {
            *failing -= 1;
            return Err(StoreError::Unavailable("simulated database outage".into()));
        }
        Ok(())
    }
}

fn unique(entity: Entity, key: &PublicKey) -> StoreError {
    StoreError::UniqueViolation {
        entity,
        key: key.to_string(),
    }
}

#[async_trait]
impl KeyedTable for MemoryStore {
    async fn key_exists(&self, entity: Entity, key: &PublicKey) -> Result<bool, StoreError> {
        let tables = self.tables.read();
        let keys = match entity {
            Entity::Mail => &tables.mail_keys,
            Entity::Attachment => &tables.attachment_keys,
            Entity::Tracker => &tables.tracker_keys,
        };
        Ok(keys.contains_key(key.as_str()))
    }
}

#[async_trait]
impl MailStore for MemoryStore {
    async fn insert_mail(&self, new: NewMail) -> Result<Mail, StoreError> {
        self.check_write()?;
        let mut tables = self.tables.write();

        // Constraint checks first; nothing below this block can fail.
        if tables.mail_keys.contains_key(new.public_key.as_str()) {
            return Err(unique(Entity::Mail, &new.public_key));
        }
        let mut batch_keys = BTreeSet::new();
        for tracker in &new.trackers {
            if tables.tracker_keys.contains_key(tracker.public_key.as_str())
                || !batch_keys.insert(tracker.public_key.as_str())
            {
                return Err(unique(Entity::Tracker, &tracker.public_key));
            }
        }
        if let Some(&id) = new
            .attachment_ids
            .iter()
            .find(|id| !tables.attachments.contains_key(*id))
        {
            return Err(StoreError::MissingReference {
                entity: Entity::Attachment,
                id,
            });
        }

        let now = Utc::now();
        let id = next(&mut tables.next_mail_id);

        let carbon_copies = new
            .carbon_copies
            .into_iter()
            .map(|email_address| CarbonCopy {
                id: next(&mut tables.next_cc_id),
                email_address,
                created_time: now,
            })
            .collect();

        let mut trackers = Vec::with_capacity(new.trackers.len());
        for tracker in new.trackers {
            tables
                .tracker_keys
                .insert(tracker.public_key.as_str().to_string(), id);
            trackers.push(Tracker {
                id: next(&mut tables.next_tracker_id),
                public_key: tracker.public_key,
                mail_id: id,
                kind: tracker.kind,
                redirect_to: tracker.redirect_to,
                created_time: now,
            });
        }

        let mut attachment_ids = new.attachment_ids;
        attachment_ids.sort_unstable();
        attachment_ids.dedup();

        let mail = Mail {
            id,
            public_key: new.public_key,
            subject: new.subject,
            body: new.body,
            recipient: new.recipient,
            scheduled_time: new.scheduled_time,
            status: MailStatus::Pending,
            tags: new.tags,
            carbon_copies,
            attachment_ids,
            trackers,
            created_time: now,
            modified_time: now,
        };

        tables
            .mail_keys
            .insert(mail.public_key.as_str().to_string(), id);
        tables.mails.insert(id, mail.clone());
        Ok(mail)
    }

    async fn mail(&self, id: i64) -> Result<Option<Mail>, StoreError> {
        Ok(self.tables.read().mails.get(&id).cloned())
    }

    async fn mail_by_key(&self, key: &PublicKey) -> Result<Option<Mail>, StoreError> {
        let tables = self.tables.read();
        Ok(tables
            .mail_keys
            .get(key.as_str())
            .and_then(|id| tables.mails.get(id))
            .cloned())
    }

    async fn list_mails(&self) -> Result<Vec<Mail>, StoreError> {
        let mut mails: Vec<Mail> = self.tables.read().mails.values().cloned().collect();
        mails.sort_by(|a, b| (b.created_time, b.id).cmp(&(a.created_time, a.id)));
        Ok(mails)
    }

    async fn set_status(&self, id: i64, status: MailStatus) -> Result<Mail, StoreError> {
        self.check_write()?;
        let mut tables = self.tables.write();
        let mail = tables.mails.get_mut(&id).ok_or(StoreError::NotFound)?;
        mail.status = status;
        mail.modified_time = Utc::now();
        Ok(mail.clone())
    }

    async fn delete_mail(&self, id: i64) -> Result<Mail, StoreError> {
        self.check_write()?;
        let mut tables = self.tables.write();
        let mail = tables.mails.remove(&id).ok_or(StoreError::NotFound)?;
        tables.mail_keys.remove(mail.public_key.as_str());
        for tracker in &mail.trackers {
            tables.tracker_keys.remove(tracker.public_key.as_str());
        }
        Ok(mail)
    }

    async fn tracker_by_key(&self, key: &PublicKey) -> Result<Option<Tracker>, StoreError> {
        let tables = self.tables.read();
        Ok(tables
            .tracker_keys
            .get(key.as_str())
            .and_then(|mail_id| tables.mails.get(mail_id))
            .and_then(|mail| mail.trackers.iter().find(|t| &t.public_key == key))
            .cloned())
    }

    async fn insert_attachment(&self, new: NewAttachment) -> Result<Attachment, StoreError> {
        self.check_write()?;
        let mut tables = self.tables.write();
        if tables.attachment_keys.contains_key(new.public_key.as_str()) {
            return Err(unique(Entity::Attachment, &new.public_key));
        }
        if let Some(ty) = &new.attachment_type {
            tables.attachment_types.insert(ty.clone());
        }

        let now = Utc::now();
        let attachment = Attachment {
            id: next(&mut tables.next_attachment_id),
            public_key: new.public_key,
            name: new.name,
            file: new.file,
            attachment_type: new.attachment_type,
            size: new.size,
            created_time: now,
            modified_time: now,
        };
        tables
            .attachment_keys
            .insert(attachment.public_key.as_str().to_string(), attachment.id);
        tables.attachments.insert(attachment.id, attachment.clone());
        Ok(attachment)
    }

    async fn attachment_by_key(&self, key: &PublicKey) -> Result<Option<Attachment>, StoreError> {
        let tables = self.tables.read();
        Ok(tables
            .attachment_keys
            .get(key.as_str())
            .and_then(|id| tables.attachments.get(id))
            .cloned())
    }

    async fn list_attachments(&self) -> Result<Vec<Attachment>, StoreError> {
        let mut attachments: Vec<Attachment> =
            self.tables.read().attachments.values().cloned().collect();
        attachments.sort_by(|a, b| (b.created_time, b.id).cmp(&(a.created_time, a.id)));
        Ok(attachments)
    }

    async fn delete_attachment(&self, id: i64) -> Result<Attachment, StoreError> {
        self.check_write()?;
        let mut tables = self.tables.write();
        let attachment = tables.attachments.remove(&id).ok_or(StoreError::NotFound)?;
        tables
            .attachment_keys
            .remove(attachment.public_key.as_str());
        for mail in tables.mails.values_mut() {
            mail.attachment_ids.retain(|linked| *linked != id);
        }
        Ok(attachment)
    }

    async fn attachment_type(&self, ty: AttachmentType) -> Result<AttachmentType, StoreError> {
        let mut tables = self.tables.write();
        if let Some(existing) = tables.attachment_types.get(&ty) {
            return Ok(existing.clone());
        }
        tables.attachment_types.insert(ty.clone());
        Ok(ty)
    }
}
