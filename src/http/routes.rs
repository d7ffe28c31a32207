//! Axum handlers.

use std::collections::BTreeMap;
use std::net::SocketAddr;

use axum::{
    extract::{rejection::JsonRejection, ConnectInfo, Path, Request, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Redirect, Response},
    routing::get,
    Json, Router,
};
use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};

use crate::attachment::{Attachment, UploadRequest};
use crate::error::MailError;
use crate::event::Engagement;
use crate::identifier::PublicKey;
use crate::mail::{Mail, MailRequest};
use crate::service::{AttachmentDeletion, MailAggregateService};
use crate::tracking::{
    RequestMetadata, TrackingIngestor, TrackingResponse, PIXEL_CONTENT_TYPE, PIXEL_GIF,
};

/// Shared state for routes.
#[derive(Clone)]
struct AppState {
    service: MailAggregateService,
    ingestor: TrackingIngestor,
}

/// Create the API router.
pub fn create_router(service: MailAggregateService, ingestor: TrackingIngestor) -> Router {
    let state = AppState { service, ingestor };

    Router::new()
        .route("/mails", get(list_mails).post(create_mail))
        .route("/mails/{key}", get(get_mail).delete(delete_mail))
        .route("/mails/{key}/events", get(mail_events))
        .route("/attachments", get(list_attachments).post(upload_attachment))
        .route(
            "/attachments/{key}",
            get(get_attachment).delete(delete_attachment),
        )
        .route("/{key}", get(track))
        .with_state(state)
}

// ============================================================================
// Representations
// ============================================================================

/// A mail as returned by the API.
#[derive(Debug, Clone, Serialize)]
pub struct MailView {
    #[serde(flatten)]
    pub mail: Mail,
    /// Human-readable status label.
    pub status_display: &'static str,
    /// Public URL per tracker key. Empty without a tracking base URL.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub tracking_urls: BTreeMap<String, String>,
}

impl MailView {
    fn new(service: &MailAggregateService, mail: Mail) -> Self {
        let tracking_urls = service
            .tracker_urls(&mail)
            .into_iter()
            .map(|(key, url)| (key.to_string(), url))
            .collect();
        Self {
            status_display: mail.status.label(),
            mail,
            tracking_urls,
        }
    }
}

/// Attachment upload body.
#[derive(Debug, Clone, Deserialize)]
pub struct AttachmentUpload {
    #[serde(default)]
    pub name: Option<String>,
    pub filename: String,
    #[serde(default)]
    pub content_type: Option<String>,
    /// File contents, base64-encoded.
    pub content: String,
}

impl AttachmentUpload {
    fn into_request(self) -> Result<UploadRequest, MailError> {
        let content = STANDARD
            .decode(self.content.trim())
            .map_err(|e| MailError::validation("content", format!("invalid base64: {}", e)))?;
        let mut upload = UploadRequest::new(self.filename, content);
        if let Some(name) = self.name {
            upload = upload.name(name);
        }
        if let Some(content_type) = self.content_type {
            upload = upload.content_type(content_type);
        }
        Ok(upload)
    }
}

/// Error payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
}

struct ApiError(MailError);

impl From<MailError> for ApiError {
    fn from(e: MailError) -> Self {
        Self(e)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self(MailError::validation("request", rejection.body_text()))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            tracing::error!(error = %self.0, "Request failed");
        }
        let body = ErrorBody {
            error: self.0.to_string(),
            field: self.0.field().map(str::to_string),
        };
        (status, Json(body)).into_response()
    }
}

// ============================================================================
// Mails
// ============================================================================

/// POST /mails
async fn create_mail(
    State(state): State<AppState>,
    payload: Result<Json<MailRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<MailView>), ApiError> {
    let Json(request) = payload?;
    let mail = state.service.create_mail(request).await?;
    Ok((StatusCode::CREATED, Json(MailView::new(&state.service, mail))))
}

/// GET /mails
async fn list_mails(State(state): State<AppState>) -> Result<Json<Vec<MailView>>, ApiError> {
    let mails = state.service.list_mails().await?;
    Ok(Json(
        mails
            .into_iter()
            .map(|mail| MailView::new(&state.service, mail))
            .collect(),
    ))
}

/// GET /mails/{key}
async fn get_mail(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<MailView>, ApiError> {
    let mail = state.service.get_mail(&PublicKey::new(key)).await?;
    Ok(Json(MailView::new(&state.service, mail)))
}

/// DELETE /mails/{key}
async fn delete_mail(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.service.delete_mail(&PublicKey::new(key)).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// GET /mails/{key}/events
async fn mail_events(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<Engagement>, ApiError> {
    Ok(Json(state.service.engagement(&PublicKey::new(key)).await?))
}

// ============================================================================
// Attachments
// ============================================================================

/// POST /attachments
async fn upload_attachment(
    State(state): State<AppState>,
    payload: Result<Json<AttachmentUpload>, JsonRejection>,
) -> Result<(StatusCode, Json<Attachment>), ApiError> {
    let Json(upload) = payload?;
    let attachment = state
        .service
        .upload_attachment(upload.into_request()?)
        .await?;
    Ok((StatusCode::CREATED, Json(attachment)))
}

/// GET /attachments
async fn list_attachments(
    State(state): State<AppState>,
) -> Result<Json<Vec<Attachment>>, ApiError> {
    Ok(Json(state.service.list_attachments().await?))
}

/// GET /attachments/{key}
async fn get_attachment(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<Attachment>, ApiError> {
    Ok(Json(
        state.service.get_attachment(&PublicKey::new(key)).await?,
    ))
}

/// DELETE /attachments/{key}
async fn delete_attachment(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<AttachmentDeletion>, ApiError> {
    Ok(Json(
        state.service.delete_attachment(&PublicKey::new(key)).await?,
    ))
}

// ============================================================================
// Tracking
// ============================================================================

/// GET /{key} - Record a hit and serve the pixel or forward the client.
///
/// Never fails: unknown keys and storage trouble still get the pixel.
async fn track(
    State(state): State<AppState>,
    Path(key): Path<String>,
    request: Request,
) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0);
    let meta = request_metadata(request.headers(), peer);
    let ack = state.ingestor.ingest(&key, meta).await;
    match ack.response {
        TrackingResponse::Redirect(url) => Redirect::to(&url).into_response(),
        TrackingResponse::Pixel => (
            [
                (header::CONTENT_TYPE, PIXEL_CONTENT_TYPE),
                (header::CACHE_CONTROL, "no-store, no-cache, must-revalidate, max-age=0"),
            ],
            PIXEL_GIF,
        )
            .into_response(),
    }
}

fn request_metadata(headers: &HeaderMap, peer: Option<SocketAddr>) -> RequestMetadata {
    let mut meta = RequestMetadata::new(client_ip(headers, peer));
    for (name, value) in headers {
        if let Ok(value) = value.to_str() {
            meta = meta.header(name.as_str(), value);
        }
    }
    meta
}

/// First hop of `X-Forwarded-For`, then `X-Real-IP`, then the peer address
/// of the connection, else `"unknown"`.
fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    let header_str = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };
    header_str("x-forwarded-for")
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .or_else(|| header_str("x-real-ip"))
        .map(str::to_string)
        .or_else(|| peer.map(|addr| addr.ip().to_string()))
        .unwrap_or_else(|| "unknown".to_string())
}
