//! Automatic approval of requests whose requester is on call.
//!
//! The engine decides when a request qualifies. A [`ReviewSubmitter`] carries
//! the resulting review back to the service that owns access requests, which
//! then sends a new snapshot through the usual ingest path.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::info;

use alertbridge_core::{ProposedState, RequestId, Review};

use crate::error::GatewayError;
use crate::gateway::CallLogMiddleware;
use crate::ingest::{sign_payload, SIGNATURE_HEADER};

/// Author recorded on reviews submitted by alertbridge itself.
pub const AUTO_APPROVAL_AUTHOR: &str = "alertbridge";

/// The review submitted for a requester found on call.
pub fn auto_approval(user: &str) -> Review {
    Review {
        author: AUTO_APPROVAL_AUTHOR.to_string(),
        proposed_state: ProposedState::Approved,
        reason: format!(
            "Access request has been automatically approved by alertbridge because user {} is on-call.",
            user
        ),
        created: Utc::now(),
    }
}

#[async_trait]
pub trait ReviewSubmitter: Send + Sync {
    /// Add `review` to the request identified by `id`.
    async fn submit_review(&self, id: &RequestId, review: &Review) -> Result<(), GatewayError>;
}

#[derive(Debug, Serialize)]
struct SubmitReview<'a> {
    request_id: &'a RequestId,
    review: &'a Review,
}

/// Posts reviews as JSON to a fixed URL, signed like incoming snapshots when
/// a secret is configured.
pub struct HttpReviewSubmitter {
    client: ClientWithMiddleware,
    url: String,
    secret: Option<String>,
}

impl HttpReviewSubmitter {
    pub fn new(url: impl Into<String>, secret: Option<String>) -> Result<Self, GatewayError> {
        let client = Client::builder()
            .user_agent(format!("alertbridge/{}", crate::get_version()))
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| GatewayError::permanent("build HTTP client", e.to_string()))?;

        Ok(Self {
            client: ClientBuilder::new(client).with(CallLogMiddleware).build(),
            url: url.into(),
            secret,
        })
    }
}

#[async_trait]
impl ReviewSubmitter for HttpReviewSubmitter {
    async fn submit_review(&self, id: &RequestId, review: &Review) -> Result<(), GatewayError> {
        let body = serde_json::to_vec(&SubmitReview {
            request_id: id,
            review,
        })
        .map_err(|e| GatewayError::permanent("submit review", e.to_string()))?;

        let mut builder = self
            .client
            .post(&self.url)
            .header("Content-Type", "application/json");
        if let Some(signature) = self
            .secret
            .as_deref()
            .and_then(|secret| sign_payload(secret, &body))
        {
            builder = builder.header(SIGNATURE_HEADER, signature);
        }

        let response = builder
            .body(body)
            .send()
            .await
            .map_err(|e| GatewayError::transient("submit review", e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::from_status("submit review", status, &body));
        }

        info!(
            "Submitted {} review by {} for request {}",
            review.proposed_state, review.author, id
        );
        Ok(())
    }
}

/// Records submitted reviews instead of sending them.
#[derive(Default)]
pub struct FakeReviewSubmitter {
    submitted: Mutex<Vec<(RequestId, Review)>>,
    failures: Mutex<VecDeque<GatewayError>>,
}

impl FakeReviewSubmitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next submission fail with `error`. Failures queue up.
    pub async fn fail_next(&self, error: GatewayError) {
        self.failures.lock().await.push_back(error);
    }

    pub async fn submitted(&self) -> Vec<(RequestId, Review)> {
        self.submitted.lock().await.clone()
    }
}

#[async_trait]
impl ReviewSubmitter for FakeReviewSubmitter {
    async fn submit_review(&self, id: &RequestId, review: &Review) -> Result<(), GatewayError> {
        if let Some(error) = self.failures.lock().await.pop_front() {
            return Err(error);
        }
        self.submitted
            .lock()
            .await
            .push((id.clone(), review.clone()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::verify_signature;
    use axum::body::Bytes;
    use axum::extract::State;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;
    use axum::Router;
    use std::sync::Arc;

    #[derive(Default)]
    struct Received {
        status: Option<StatusCode>,
        bodies: Vec<Bytes>,
        signatures: Vec<String>,
    }

    type Shared = Arc<std::sync::Mutex<Received>>;

    async fn receive(State(state): State<Shared>, headers: HeaderMap, body: Bytes) -> StatusCode {
        let mut state = state.lock().unwrap();
        if let Some(signature) = headers.get(SIGNATURE_HEADER) {
            state
                .signatures
                .push(signature.to_str().unwrap().to_string());
        }
        state.bodies.push(body);
        state.status.unwrap_or(StatusCode::OK)
    }

    async fn serve(state: Shared) -> String {
        let app = Router::new()
            .route("/reviews", post(receive))
            .with_state(state);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        format!("http://{}/reviews", addr)
    }

    #[test]
    fn test_auto_approval_review() {
        let review = auto_approval("requester1");
        assert_eq!(review.author, "alertbridge");
        assert_eq!(review.proposed_state, ProposedState::Approved);
        assert_eq!(
            review.reason,
            "Access request has been automatically approved by alertbridge because user requester1 is on-call."
        );
    }

    #[tokio::test]
    async fn test_http_submitter_posts_signed_review() {
        let state = Shared::default();
        let url = serve(state.clone()).await;
        let submitter = HttpReviewSubmitter::new(url, Some("secret".to_string())).unwrap();

        let review = auto_approval("requester1");
        submitter
            .submit_review(&RequestId::from("r1"), &review)
            .await
            .unwrap();

        let state = state.lock().unwrap();
        let body: serde_json::Value = serde_json::from_slice(&state.bodies[0]).unwrap();
        assert_eq!(body["request_id"], "r1");
        assert_eq!(body["review"]["author"], "alertbridge");
        assert!(verify_signature("secret", &state.bodies[0], &state.signatures[0]));
    }

    #[tokio::test]
    async fn test_http_submitter_without_secret_is_unsigned() {
        let state = Shared::default();
        let url = serve(state.clone()).await;
        let submitter = HttpReviewSubmitter::new(url, None).unwrap();

        submitter
            .submit_review(&RequestId::from("r1"), &auto_approval("requester1"))
            .await
            .unwrap();

        let state = state.lock().unwrap();
        assert_eq!(state.bodies.len(), 1);
        assert!(state.signatures.is_empty());
    }

    #[tokio::test]
    async fn test_http_submitter_error_statuses() {
        let state = Arc::new(std::sync::Mutex::new(Received {
            status: Some(StatusCode::SERVICE_UNAVAILABLE),
            ..Default::default()
        }));
        let url = serve(state.clone()).await;
        let submitter = HttpReviewSubmitter::new(url, None).unwrap();
        let review = auto_approval("requester1");

        let err = submitter
            .submit_review(&RequestId::from("r1"), &review)
            .await
            .unwrap_err();
        assert!(err.is_retryable());

        state.lock().unwrap().status = Some(StatusCode::NOT_FOUND);
        let err = submitter
            .submit_review(&RequestId::from("r1"), &review)
            .await
            .unwrap_err();
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_fake_submitter_records_and_fails() {
        let submitter = FakeReviewSubmitter::new();
        submitter
            .fail_next(GatewayError::transient("submit review", "502"))
            .await;

        let review = auto_approval("requester1");
        assert!(submitter
            .submit_review(&RequestId::from("r1"), &review)
            .await
            .is_err());
        submitter
            .submit_review(&RequestId::from("r1"), &review)
            .await
            .unwrap();

        assert_eq!(
            submitter.submitted().await,
            vec![(RequestId::from("r1"), review)]
        );
    }
}
