//! JSON API and tracking endpoint, served with Axum.
//!
//! ## Routes
//!
//! | Method | Path | |
//! |--------|------|-|
//! | `POST` | `/mails` | Create and schedule a mail (201) |
//! | `GET` | `/mails` | List mails, newest first |
//! | `GET` | `/mails/{key}` | One mail |
//! | `DELETE` | `/mails/{key}` | Delete a mail (204) |
//! | `GET` | `/mails/{key}/events` | Events, hits and counts |
//! | `POST` | `/attachments` | Upload a base64-encoded file (201) |
//! | `GET` | `/attachments` | List attachments |
//! | `GET` | `/attachments/{key}` | One attachment |
//! | `DELETE` | `/attachments/{key}` | Delete an attachment and its blob |
//! | `GET` | `/{tracking_key}` | Pixel image or redirect |
//!
//! # Example
//!
//! ```rust,ignore
//! use mailtrack::http::create_router;
//!
//! let app = create_router(service, ingestor);
//! let listener = tokio::net::TcpListener::bind("0.0.0.0:8080").await?;
//! axum::serve(listener, app).await?;
//! ```

mod routes;

pub use routes::{create_router, AttachmentUpload, ErrorBody, MailView};
