use std::time::Instant;

use axum::http;
use reqwest::{Request, Response};
use reqwest_middleware::{Middleware, Next, Result as MiddlewareResult};
use tracing::{debug, warn};
use uuid::Uuid;

/// Header carrying the id used to correlate our logs with the alert service's.
pub const CORRELATION_ID_HEADER: &str = "x-correlation-id";

/// Logs every outgoing alert service call with its status and latency.
pub struct CallLogMiddleware;

#[async_trait::async_trait]
impl Middleware for CallLogMiddleware {
    async fn handle(
        &self,
        mut req: Request,
        extensions: &mut http::Extensions,
        next: Next<'_>,
    ) -> MiddlewareResult<Response> {
        let correlation_id = match req.headers().get(CORRELATION_ID_HEADER) {
            Some(existing) => existing.to_str().unwrap_or_default().to_string(),
            None => {
                let id = Uuid::new_v4().to_string();
                if let Ok(value) = id.parse() {
                    req.headers_mut().insert(CORRELATION_ID_HEADER, value);
                }
                id
            }
        };

        let method = req.method().clone();
        let url = req.url().path().to_string();
        let started = Instant::now();

        let response = next.run(req, extensions).await;

        match &response {
            Ok(resp) => debug!(
                "{} {} -> {} in {:?} [{}]",
                method,
                url,
                resp.status(),
                started.elapsed(),
                correlation_id
            ),
            Err(err) => warn!(
                "{} {} failed after {:?} [{}]: {}",
                method,
                url,
                started.elapsed(),
                correlation_id,
                err
            ),
        }

        response
    }
}
