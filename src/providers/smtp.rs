//! SMTP transport using lettre.
//!
//! Failures are split the way SMTP splits them: permanent (5xx) replies are
//! terminal, everything else (4xx replies, connection trouble, timeouts) is
//! transient and left to the delivery worker's retry policy.
//!
//! ```rust,ignore
//! use mailtrack::providers::SmtpMailer;
//!
//! let mailer = SmtpMailer::new("smtp.example.com", 587)
//!     .credentials("username", "password")
//!     .build();
//! ```

use async_trait::async_trait;
use lettre::{
    message::{
        header::{ContentType, HeaderName, HeaderValue},
        Mailbox, MultiPart,
    },
    transport::smtp::authentication::Credentials,
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};

use crate::address::Address;
use crate::email::Email;
use crate::error::DeliveryError;
use crate::mailer::{DeliveryResult, Mailer};

/// SMTP transport.
pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
}

impl SmtpMailer {
    /// Create a new SMTP mailer builder with TLS (STARTTLS on port 587).
    pub fn new(host: &str, port: u16) -> SmtpBuilder {
        SmtpBuilder {
            host: host.to_string(),
            port,
            credentials: None,
            tls: TlsMode::StartTls,
        }
    }

    /// Build a lettre Message from the dispatch payload.
    fn build_message(&self, email: &Email) -> Result<Message, DeliveryError> {
        let from = email
            .from
            .as_ref()
            .ok_or_else(|| DeliveryError::Terminal("missing from address".into()))?;

        if email.to.is_empty() {
            return Err(DeliveryError::Terminal("no recipients".into()));
        }

        let mut builder = Message::builder()
            .from(address_to_mailbox(from)?)
            .subject(&email.subject);

        for to in &email.to {
            builder = builder.to(address_to_mailbox(to)?);
        }
        for cc in &email.cc {
            builder = builder.cc(address_to_mailbox(cc)?);
        }
        for (name, value) in &email.headers {
            let name = HeaderName::new_from_ascii(name.clone())
                .map_err(|_| DeliveryError::Terminal(format!("invalid header name '{}'", name)))?;
            builder = builder.raw_header(HeaderValue::new(name, value.clone()));
        }

        let message = match (&email.html_body, &email.text_body) {
            (Some(html), Some(text)) => {
                builder.multipart(MultiPart::alternative_plain_html(text.clone(), html.clone()))?
            }
            (Some(html), None) => builder.header(ContentType::TEXT_HTML).body(html.clone())?,
            (None, Some(text)) => builder.header(ContentType::TEXT_PLAIN).body(text.clone())?,
            (None, None) => builder
                .header(ContentType::TEXT_PLAIN)
                .body(String::new())?,
        };

        Ok(message)
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn deliver(&self, email: &Email) -> Result<DeliveryResult, DeliveryError> {
        let message = self.build_message(email)?;

        let response = self.transport.send(message).await?;

        // Extract message ID from SMTP response, or generate one
        let message_id = response
            .message()
            .next()
            .and_then(|m| m.lines().next())
            .map(|s| s.to_string())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        Ok(DeliveryResult::new(message_id))
    }

    fn provider_name(&self) -> &'static str {
        "smtp"
    }
}

/// TLS mode for SMTP connection.
#[derive(Debug, Clone, Copy)]
pub enum TlsMode {
    /// No TLS (dangerous, only for localhost)
    None,
    /// STARTTLS - upgrade to TLS after connecting (port 587)
    StartTls,
    /// Implicit TLS - connect with TLS from start (port 465)
    Tls,
}

/// Builder for SmtpMailer.
pub struct SmtpBuilder {
    host: String,
    port: u16,
    credentials: Option<Credentials>,
    tls: TlsMode,
}

impl SmtpBuilder {
    /// Set SMTP credentials.
    pub fn credentials(mut self, username: &str, password: &str) -> Self {
        self.credentials = Some(Credentials::new(username.to_string(), password.to_string()));
        self
    }

    /// Set TLS mode.
    pub fn tls(mut self, mode: TlsMode) -> Self {
        self.tls = mode;
        self
    }

    /// Build the SmtpMailer.
    pub fn build(self) -> SmtpMailer {
        let builder = match self.tls {
            TlsMode::None => AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&self.host),
            TlsMode::StartTls => AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&self.host)
                .unwrap_or_else(|_| {
                    AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&self.host)
                }),
            TlsMode::Tls => AsyncSmtpTransport::<Tokio1Executor>::relay(&self.host)
                .unwrap_or_else(|_| {
                    AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&self.host)
                }),
        };

        let mut builder = builder.port(self.port);
        if let Some(creds) = self.credentials {
            builder = builder.credentials(creds);
        }

        SmtpMailer {
            transport: builder.build(),
        }
    }
}

/// Convert an Address to lettre's Mailbox, punycoding IDN domains.
fn address_to_mailbox(addr: &Address) -> Result<Mailbox, DeliveryError> {
    let ascii = addr.to_ascii()?;
    let email: lettre::Address = ascii.parse()?;
    Ok(Mailbox::new(addr.name.clone(), email))
}
