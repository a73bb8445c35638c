//! User-visible alert text.
//!
//! Downstream tooling matches on these strings, so the phrases
//! "<author> reviewed the request", "Resolution: <VERDICT>",
//! "Access request has been approved/denied" and "Reason: <reason>" are fixed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::request::{AccessRequest, Review};
use crate::resolution::{Resolution, ResolutionTag};

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S UTC";

/// Alert to open for a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewAlert {
    /// Request id, used as the alert alias so the service can correlate retries.
    pub alias: String,
    pub message: String,
    pub description: String,
    pub responders: Vec<String>,
}

impl NewAlert {
    pub fn for_request(request: &AccessRequest, responders: Vec<String>) -> Self {
        Self {
            alias: request.id.0.clone(),
            message: format!("Access request from {}", request.user),
            description: request_description(request, Utc::now()),
            responders,
        }
    }
}

fn request_description(request: &AccessRequest, now: DateTime<Utc>) -> String {
    let mut text = format!(
        "{} requested permissions for roles {} at {}.",
        request.user,
        request.roles.join(", "),
        now.format(TIME_FORMAT)
    );
    if let Some(reason) = request.request_reason.as_deref().filter(|r| !r.is_empty()) {
        text.push_str(&format!("\nReason: {}", reason));
    }
    text.push_str(&format!("\nRequest ID: {}", request.id));
    text
}

/// Note describing a single review.
pub fn review_note(review: &Review) -> String {
    let mut text = format!(
        "{} reviewed the request at {}.\nResolution: {}.",
        review.author,
        review.created.format(TIME_FORMAT),
        review.proposed_state
    );
    if !review.reason.is_empty() {
        text.push_str(&format!("\nReason: {}.", review.reason));
    }
    text
}

/// Final note appended when the request is resolved.
///
/// Returns `None` for an unresolved resolution.
pub fn resolution_note(resolution: &Resolution) -> Option<String> {
    let mut text = match resolution.tag {
        ResolutionTag::Unresolved => return None,
        ResolutionTag::ResolvedApproved => "Access request has been approved".to_string(),
        ResolutionTag::ResolvedDenied => "Access request has been denied".to_string(),
        ResolutionTag::ResolvedExpired => "Access request has expired".to_string(),
    };
    if !resolution.reason.is_empty() {
        text.push_str(&format!("\nReason: {}", resolution.reason));
    }
    Some(text)
}
