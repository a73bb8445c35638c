//! Resolution tracking for access requests.
//!
//! A request's resolution is derived from its snapshot alone. The tracker owns
//! all threshold arithmetic; callers only react to the tag it reports.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::request::{ProposedState, RequestState, Review, Thresholds};

/// Resolution tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionTag {
    #[default]
    Unresolved,
    ResolvedApproved,
    ResolvedDenied,
    ResolvedExpired,
}

impl fmt::Display for ResolutionTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unresolved => write!(f, "unresolved"),
            Self::ResolvedApproved => write!(f, "approved"),
            Self::ResolvedDenied => write!(f, "denied"),
            Self::ResolvedExpired => write!(f, "expired"),
        }
    }
}

/// A request's verdict together with the reason that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Resolution {
    pub tag: ResolutionTag,
    #[serde(default)]
    pub reason: String,
}

impl Resolution {
    pub fn unresolved() -> Self {
        Self::default()
    }

    pub fn approved(reason: impl Into<String>) -> Self {
        Self {
            tag: ResolutionTag::ResolvedApproved,
            reason: reason.into(),
        }
    }

    pub fn denied(reason: impl Into<String>) -> Self {
        Self {
            tag: ResolutionTag::ResolvedDenied,
            reason: reason.into(),
        }
    }

    pub fn expired(reason: impl Into<String>) -> Self {
        Self {
            tag: ResolutionTag::ResolvedExpired,
            reason: reason.into(),
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.tag != ResolutionTag::Unresolved
    }

    /// Combine a stored resolution with a freshly computed one.
    ///
    /// Resolutions only ever move from unresolved to resolved. Any other
    /// change is reported as a conflict and the stored value wins.
    pub fn advance(&self, next: Resolution) -> Advance {
        match (self.is_resolved(), next.is_resolved()) {
            (false, true) => Advance::Resolved(next),
            (false, false) => Advance::Unchanged,
            (true, _) if next.tag == self.tag || !next.is_resolved() => Advance::Unchanged,
            (true, _) => Advance::Conflict {
                stored: self.tag,
                computed: next.tag,
            },
        }
    }
}

/// Outcome of [`Resolution::advance`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Advance {
    /// Nothing new to act on.
    Unchanged,
    /// The request has just become resolved.
    Resolved(Resolution),
    /// A resolved request computed a different verdict.
    Conflict {
        stored: ResolutionTag,
        computed: ResolutionTag,
    },
}

/// Compute the current resolution of a request.
///
/// A terminal lifecycle state always resolves. While the request is pending,
/// only thresholds can resolve it: the first review to reach a threshold wins
/// and supplies the reason. When the lifecycle verdict agrees with the review
/// verdict, the deciding review's reason is kept; otherwise the lifecycle
/// state is mirrored (e.g. an administrator override).
pub fn resolve(
    state: RequestState,
    reviews: &[Review],
    thresholds: Option<Thresholds>,
    resolve_reason: Option<&str>,
) -> Resolution {
    let by_reviews = thresholds.and_then(|t| threshold_verdict(reviews, t));

    match state {
        RequestState::Pending => by_reviews.unwrap_or_else(Resolution::unresolved),
        RequestState::Expired => Resolution::expired(mirrored_reason(reviews, resolve_reason)),
        RequestState::Approved => by_reviews
            .filter(|r| r.tag == ResolutionTag::ResolvedApproved)
            .unwrap_or_else(|| Resolution::approved(mirrored_reason(reviews, resolve_reason))),
        RequestState::Denied => by_reviews
            .filter(|r| r.tag == ResolutionTag::ResolvedDenied)
            .unwrap_or_else(|| Resolution::denied(mirrored_reason(reviews, resolve_reason))),
    }
}

fn threshold_verdict(reviews: &[Review], thresholds: Thresholds) -> Option<Resolution> {
    let mut approvals = 0u32;
    let mut denials = 0u32;
    for review in reviews {
        match review.proposed_state {
            ProposedState::Approved => {
                approvals += 1;
                if approvals >= thresholds.approve.max(1) {
                    return Some(Resolution::approved(review.reason.clone()));
                }
            }
            ProposedState::Denied => {
                denials += 1;
                if denials >= thresholds.deny.max(1) {
                    return Some(Resolution::denied(review.reason.clone()));
                }
            }
        }
    }
    None
}

fn mirrored_reason(reviews: &[Review], resolve_reason: Option<&str>) -> String {
    resolve_reason
        .filter(|r| !r.is_empty())
        .or_else(|| reviews.last().map(|r| r.reason.as_str()))
        .unwrap_or_default()
        .to_string()
}
