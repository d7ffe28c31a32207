//! Dispatch-ready message handed to the transport.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::address::Address;

/// A composed message, ready for a [`Mailer`](crate::Mailer).
///
/// Built by the aggregate service from a stored mail at fire time, or by hand:
///
/// ```
/// use mailtrack::Email;
///
/// let email = Email::new()
///     .from("noreply@example.com")
///     .to("recipient@example.com")
///     .cc("boss@example.com")
///     .subject("Hello!")
///     .html_body("<p>Hi</p>");
/// assert_eq!(email.recipients().count(), 2);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Email {
    /// Sender address
    pub from: Option<Address>,
    /// Primary recipients
    pub to: Vec<Address>,
    /// Carbon copy recipients
    pub cc: Vec<Address>,
    /// Email subject line
    pub subject: String,
    /// HTML body
    pub html_body: Option<String>,
    /// Plain text body
    pub text_body: Option<String>,
    /// Custom email headers
    pub headers: BTreeMap<String, String>,
}

impl Email {
    /// Create a new empty email.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the sender address.
    pub fn from(mut self, addr: impl Into<Address>) -> Self {
        self.from = Some(addr.into());
        self
    }

    /// Add a recipient.
    pub fn to(mut self, addr: impl Into<Address>) -> Self {
        self.to.push(addr.into());
        self
    }

    /// Add a CC recipient.
    pub fn cc(mut self, addr: impl Into<Address>) -> Self {
        self.cc.push(addr.into());
        self
    }

    /// Set the subject line.
    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = subject.into();
        self
    }

    /// Set the HTML body.
    pub fn html_body(mut self, body: impl Into<String>) -> Self {
        self.html_body = Some(body.into());
        self
    }

    /// Set the plain text body.
    pub fn text_body(mut self, body: impl Into<String>) -> Self {
        self.text_body = Some(body.into());
        self
    }

    /// Add a custom header.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Every address the message goes to, primary recipients first.
    pub fn recipients(&self) -> impl Iterator<Item = &Address> {
        self.to.iter().chain(self.cc.iter())
    }
}
