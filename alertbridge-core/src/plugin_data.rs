//! Durable per-request synchronization state.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::resolution::Resolution;

/// Newtype for an alert identifier issued by the alerting service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AlertId(pub String);

impl fmt::Display for AlertId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for AlertId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for AlertId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// What has already been mirrored to the alert for one request.
///
/// Fields only move forward: the alert id is set once, the review count
/// grows one note at a time, the on-call check happens at most once and the
/// resolution goes unresolved -> resolved.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PluginData {
    #[serde(default)]
    pub alert_id: Option<AlertId>,
    #[serde(default)]
    pub reviews_count: usize,
    #[serde(default)]
    pub resolution: Resolution,
    /// Set once the requester's on-call status has been checked, whether or
    /// not that led to an automatic approval.
    #[serde(default)]
    pub auto_approval_checked: bool,
}
