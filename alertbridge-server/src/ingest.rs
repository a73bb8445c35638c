//! HTTP surface: snapshot ingestion and health.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use hmac::{Hmac, Mac};
use serde_json::json;
use sha2::Sha256;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use alertbridge_core::AccessRequest;

use crate::dispatcher::Dispatcher;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "x-signature-256";

pub struct IngestState {
    pub dispatcher: Arc<Dispatcher>,
    /// When set, every snapshot must carry a valid signature.
    pub webhook_secret: Option<String>,
}

pub fn router(state: Arc<IngestState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/events", post(receive_event))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}

async fn health_check() -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "service": "alertbridge",
        "version": crate::get_version(),
    }))
}

async fn receive_event(
    State(state): State<Arc<IngestState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Some(secret) = &state.webhook_secret {
        let signature = headers
            .get(SIGNATURE_HEADER)
            .and_then(|h| h.to_str().ok())
            .unwrap_or("");
        if !verify_signature(secret, &body, signature) {
            error!("Invalid event signature");
            return StatusCode::UNAUTHORIZED.into_response();
        }
    }

    let request: AccessRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            warn!("Rejecting malformed access request snapshot: {}", e);
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": e.to_string() })),
            )
                .into_response();
        }
    };

    info!(
        "Received snapshot for request {} ({} reviews, state {:?})",
        request.id,
        request.reviews.len(),
        request.state
    );
    let id = request.id.clone();
    state.dispatcher.submit(request).await;

    (
        StatusCode::ACCEPTED,
        Json(json!({ "status": "accepted", "request_id": id })),
    )
        .into_response()
}

/// Check a `sha256=<hex>` HMAC of `payload` in constant time.
pub fn verify_signature(secret: &str, payload: &[u8], signature: &str) -> bool {
    let Some(signature_hex) = signature.strip_prefix("sha256=") else {
        return false;
    };

    let signature_bytes = match hex::decode(signature_hex) {
        Ok(bytes) => bytes,
        Err(_) => return false,
    };

    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return false,
    };
    mac.update(payload);
    mac.verify_slice(&signature_bytes).is_ok()
}

/// `sha256=<hex>` HMAC of `payload`, the format `verify_signature` accepts.
pub fn sign_payload(secret: &str, payload: &[u8]) -> Option<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(payload);
    Some(format!("sha256={}", hex::encode(mac.finalize().into_bytes())))
}
