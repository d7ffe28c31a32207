//! Attachments and their content types.
//!
//! An attachment row points at a blob in the [`FileStore`](crate::blob::FileStore)
//! and may be shared by any number of mails. The blob is stored under a
//! date-partitioned path with a freshly generated name; the client's filename
//! only contributes its extension.

use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

use crate::error::MailError;
use crate::identifier::PublicKey;

/// Longest accepted attachment name.
pub const MAX_NAME_LEN: usize = 255;
/// Longest stored blob path.
pub const MAX_PATH_LEN: usize = 1024;

/// A (main type, sub type) pair such as `image/png`. Unique together.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AttachmentType {
    pub main_type: String,
    pub sub_type: String,
}

impl AttachmentType {
    /// Create a type from its parts, lowercased.
    pub fn new(main_type: impl AsRef<str>, sub_type: impl AsRef<str>) -> Self {
        Self {
            main_type: main_type.as_ref().trim().to_ascii_lowercase(),
            sub_type: sub_type.as_ref().trim().to_ascii_lowercase(),
        }
    }

    /// Parse `main/sub`, ignoring any `;` parameters.
    ///
    /// ```
    /// use mailtrack::AttachmentType;
    ///
    /// let ty = AttachmentType::parse("Text/HTML; charset=utf-8").unwrap();
    /// assert_eq!(ty.to_string(), "text/html");
    /// assert!(AttachmentType::parse("garbage").is_none());
    /// ```
    pub fn parse(content_type: &str) -> Option<Self> {
        let essence = content_type.split(';').next()?.trim();
        let (main, sub) = essence.split_once('/')?;
        if main.trim().is_empty() || sub.trim().is_empty() {
            return None;
        }
        Some(Self::new(main, sub))
    }

    /// Guess from a filename's extension, falling back to
    /// `application/octet-stream`.
    pub fn infer(filename: &str) -> Self {
        let guess = mime_guess::from_path(filename).first_or_octet_stream();
        Self::new(guess.type_().as_str(), guess.subtype().as_str())
    }
}

impl fmt::Display for AttachmentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.main_type, self.sub_type)
    }
}

/// A stored attachment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub id: i64,
    pub public_key: PublicKey,
    pub name: String,
    /// Opaque blob location inside the file store.
    pub file: String,
    pub attachment_type: Option<AttachmentType>,
    pub size: u64,
    pub created_time: DateTime<Utc>,
    pub modified_time: DateTime<Utc>,
}

/// Everything written in one attachment insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAttachment {
    pub public_key: PublicKey,
    pub name: String,
    pub file: String,
    pub attachment_type: Option<AttachmentType>,
    pub size: u64,
}

/// Attachment upload input.
#[derive(Debug, Clone, Default)]
pub struct UploadRequest {
    /// Display name. Defaults to the filename.
    pub name: Option<String>,
    /// Client-supplied filename. Only its extension is kept.
    pub filename: String,
    /// Raw file contents.
    pub content: Vec<u8>,
    /// Declared `main/sub` type. Inferred from the filename when absent.
    pub content_type: Option<String>,
}

impl UploadRequest {
    /// Create an upload from a filename and bytes.
    pub fn new(filename: impl Into<String>, content: Vec<u8>) -> Self {
        Self {
            filename: filename.into(),
            content,
            ..Self::default()
        }
    }

    /// Set the declared content type.
    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    /// Set the display name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Validated display name.
    pub fn display_name(&self) -> Result<String, MailError> {
        let name = self
            .name
            .as_deref()
            .unwrap_or(&self.filename)
            .trim()
            .to_string();
        if name.is_empty() {
            return Err(MailError::validation("name", "is required"));
        }
        if name.chars().count() > MAX_NAME_LEN {
            return Err(MailError::validation(
                "name",
                format!("must be at most {} characters", MAX_NAME_LEN),
            ));
        }
        Ok(name)
    }

    /// Declared type if present and well-formed, otherwise the inferred one.
    pub fn resolve_type(&self) -> Result<AttachmentType, MailError> {
        match self.content_type.as_deref().map(str::trim) {
            Some(declared) if !declared.is_empty() => AttachmentType::parse(declared)
                .ok_or_else(|| {
                    MailError::validation("attachment_type", format!("'{}' is not main/sub", declared))
                }),
            _ => Ok(AttachmentType::infer(&self.filename)),
        }
    }
}

/// Storage path for a new upload: `attachments/YYYY/MM/DD/<hex><.ext>`.
///
/// ```
/// use chrono::TimeZone;
///
/// let now = chrono::Utc.with_ymd_and_hms(2025, 3, 7, 12, 0, 0).unwrap();
/// let path = mailtrack::attachment::upload_path("../../etc/Report.PDF", now);
/// assert!(path.starts_with("attachments/2025/03/07/"));
/// assert!(path.ends_with(".pdf"));
/// assert!(!path.contains("Report"));
/// ```
pub fn upload_path(filename: &str, now: DateTime<Utc>) -> String {
    let ext = Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .filter(|e| !e.is_empty() && e.len() <= 16 && e.chars().all(|c| c.is_ascii_alphanumeric()))
        .map(|e| format!(".{}", e.to_ascii_lowercase()))
        .unwrap_or_default();

    format!(
        "attachments/{:04}/{:02}/{:02}/{}{}",
        now.year(),
        now.month(),
        now.day(),
        uuid::Uuid::new_v4().simple(),
        ext
    )
}
