//! Access request snapshots as delivered by the request watcher.
//!
//! A snapshot is always the full current view of one request. Nothing here is
//! a diff: handlers compare the snapshot against their own persisted progress.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Newtype for an access request identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub String);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for RequestId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Lifecycle state of an access request in the source of truth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestState {
    #[default]
    Pending,
    Approved,
    Denied,
    Expired,
}

impl RequestState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// State proposed by a single reviewer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProposedState {
    Approved,
    Denied,
}

impl fmt::Display for ProposedState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Approved => write!(f, "APPROVED"),
            Self::Denied => write!(f, "DENIED"),
        }
    }
}

/// A submitted review. Reviews are immutable and accumulate in submission order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Review {
    pub author: String,
    pub proposed_state: ProposedState,
    #[serde(default)]
    pub reason: String,
    pub created: DateTime<Utc>,
}

/// How many matching reviews it takes to resolve a request.
///
/// Only present when the request is governed by a multi-reviewer policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Thresholds {
    pub approve: u32,
    pub deny: u32,
}

/// Full snapshot of one access request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessRequest {
    pub id: RequestId,
    pub user: String,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub request_reason: Option<String>,
    /// Reason recorded when the request was resolved directly rather than by review.
    #[serde(default)]
    pub resolve_reason: Option<String>,
    #[serde(default)]
    pub annotations: HashMap<String, Vec<String>>,
    #[serde(default)]
    pub reviews: Vec<Review>,
    #[serde(default)]
    pub state: RequestState,
    #[serde(default)]
    pub thresholds: Option<Thresholds>,
}

impl AccessRequest {
    /// Create a pending request with no reviews.
    pub fn new(id: impl Into<RequestId>, user: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            user: user.into(),
            roles: Vec::new(),
            request_reason: None,
            resolve_reason: None,
            annotations: HashMap::new(),
            reviews: Vec::new(),
            state: RequestState::Pending,
            thresholds: None,
        }
    }

    pub fn with_annotation(mut self, key: impl Into<String>, values: &[&str]) -> Self {
        self.annotations.insert(
            key.into(),
            values.iter().map(|v| v.to_string()).collect(),
        );
        self
    }

    pub fn with_roles(mut self, roles: &[&str]) -> Self {
        self.roles = roles.iter().map(|r| r.to_string()).collect();
        self
    }

    pub fn with_thresholds(mut self, approve: u32, deny: u32) -> Self {
        self.thresholds = Some(Thresholds { approve, deny });
        self
    }

    /// Append a review submitted now.
    pub fn review(
        mut self,
        author: impl Into<String>,
        proposed_state: ProposedState,
        reason: impl Into<String>,
    ) -> Self {
        self.reviews.push(Review {
            author: author.into(),
            proposed_state,
            reason: reason.into(),
            created: Utc::now(),
        });
        self
    }

    /// Move the request to a terminal state, as the source of truth would on
    /// a direct approval, denial or expiry.
    pub fn resolved(mut self, state: RequestState, reason: impl Into<String>) -> Self {
        self.state = state;
        let reason = reason.into();
        self.resolve_reason = if reason.is_empty() { None } else { Some(reason) };
        self
    }
}
