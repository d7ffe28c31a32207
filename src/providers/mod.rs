//! Mail transport implementations.
//!
//! Each provider implements the [`Mailer`](crate::Mailer) trait.
//!
//! | Provider | Feature Flag | Description |
//! |----------|-------------|-------------|
//! | [`SmtpMailer`] | `smtp` | SMTP via lettre |
//! | [`LocalMailer`] | `local` | In-memory capture with scripted failures |
//! | [`LoggerMailer`] | (none) | Logs messages without sending |

#[cfg(feature = "smtp")]
mod smtp;
#[cfg(feature = "smtp")]
pub use smtp::{SmtpBuilder, SmtpMailer, TlsMode};

#[cfg(feature = "local")]
mod local;
#[cfg(feature = "local")]
pub use local::{LocalMailer, SentEmail};

mod logger;
pub use logger::LoggerMailer;
