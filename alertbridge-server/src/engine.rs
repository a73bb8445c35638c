//! Request <-> alert synchronization engine.
//!
//! The engine compares a full request snapshot with the stored plugin data
//! and performs only the alert calls that have not happened yet. Plugin data
//! is written strictly after each remote call succeeds, so a redelivered
//! snapshot resumes where the previous attempt stopped:
//!
//! 1. create the alert if none exists, then store its id
//! 2. one note per review beyond `reviews_count`, storing the count after each
//! 3. once per pending request, if a review submitter is configured: approve
//!    on the requester's behalf when they are on call for one of the
//!    request's responder schedules, then store that the check happened
//! 4. on the transition to resolved: final note, close the alert, store the
//!    resolution
//!
//! The engine does no locking of its own. Callers must never hand it two
//! snapshots of the same request concurrently (see `Dispatcher`).

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use alertbridge_core::{
    resolution_note, resolve, review_note, AccessRequest, Advance, AlertId, NewAlert, PluginData,
    RecipientResolver, Resolution, ResolutionTag, Thresholds,
};

use crate::approval::{auto_approval, ReviewSubmitter, AUTO_APPROVAL_AUTHOR};
use crate::error::EngineError;
use crate::gateway::{AlertGateway, AlertStatus};
use crate::repository::PluginDataRepository;

/// What a single `handle` call did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandleOutcome {
    /// No recipients could be resolved; nothing was stored.
    NotRelevant,
    /// The alert was resolved by an earlier call; nothing to do.
    AlreadyResolved,
    Synced {
        alert_created: bool,
        notes_sent: usize,
        resolved: Option<ResolutionTag>,
    },
}

pub struct SyncEngine {
    repository: Arc<dyn PluginDataRepository>,
    gateway: Arc<dyn AlertGateway>,
    recipients: RecipientResolver,
    default_responders: Vec<String>,
    default_thresholds: Option<Thresholds>,
    review_submitter: Option<Arc<dyn ReviewSubmitter>>,
}

impl SyncEngine {
    pub fn new(repository: Arc<dyn PluginDataRepository>, gateway: Arc<dyn AlertGateway>) -> Self {
        Self {
            repository,
            gateway,
            recipients: RecipientResolver::default(),
            default_responders: Vec::new(),
            default_thresholds: None,
            review_submitter: None,
        }
    }

    pub fn with_recipients(mut self, recipients: RecipientResolver) -> Self {
        self.recipients = recipients;
        self
    }

    /// Responders used when a request's annotations name none.
    pub fn with_default_responders(mut self, responders: Vec<String>) -> Self {
        self.default_responders = responders;
        self
    }

    /// Thresholds applied to snapshots that do not carry their own.
    pub fn with_default_thresholds(mut self, thresholds: Option<Thresholds>) -> Self {
        self.default_thresholds = thresholds;
        self
    }

    /// Enable automatic approval of requesters who are on call.
    pub fn with_review_submitter(mut self, submitter: Arc<dyn ReviewSubmitter>) -> Self {
        self.review_submitter = Some(submitter);
        self
    }

    pub fn repository(&self) -> &Arc<dyn PluginDataRepository> {
        &self.repository
    }

    /// Handle a snapshot with a deadline `timeout` from now.
    pub async fn handle_within(
        &self,
        request: &AccessRequest,
        timeout: Duration,
    ) -> Result<HandleOutcome, EngineError> {
        self.handle(request, Instant::now() + timeout).await
    }

    /// Bring the request's alert up to date with `request`.
    ///
    /// On error, plugin data reflects exactly the remote calls that
    /// succeeded before the failure.
    pub async fn handle(
        &self,
        request: &AccessRequest,
        deadline: Instant,
    ) -> Result<HandleOutcome, EngineError> {
        let id = &request.id;
        let mut data = within(deadline, "load plugin data", self.repository.get(id))
            .await?
            .unwrap_or_default();

        let computed = self.resolution_of(request);

        if data.resolution.is_resolved() {
            if let Advance::Conflict { stored, computed } = data.resolution.advance(computed) {
                warn!(
                    "Request {} is already {} but now computes as {}; ignoring",
                    id, stored, computed
                );
            }
            debug!("Request {} already resolved, nothing to do", id);
            return Ok(HandleOutcome::AlreadyResolved);
        }

        let (alert_id, alert_created) = match data.alert_id.clone() {
            Some(alert_id) => (alert_id, false),
            None => match self.open_alert(request, &mut data, deadline).await? {
                Some(alert_id) => (alert_id, true),
                None => return Ok(HandleOutcome::NotRelevant),
            },
        };

        let notes_sent = self
            .sync_reviews(request, &alert_id, &mut data, deadline)
            .await?;

        if let Some(submitter) = &self.review_submitter {
            if !request.state.is_terminal()
                && !computed.is_resolved()
                && !data.auto_approval_checked
            {
                self.auto_approve(submitter.as_ref(), request, &mut data, deadline)
                    .await?;
            }
        }

        // The stored resolution is unresolved here, so advancing cannot conflict.
        let resolved = if let Advance::Resolved(resolution) = data.resolution.advance(computed) {
            let tag = resolution.tag;
            self.resolve_alert(request, &alert_id, resolution, &mut data, deadline)
                .await?;
            Some(tag)
        } else {
            None
        };

        Ok(HandleOutcome::Synced {
            alert_created,
            notes_sent,
            resolved,
        })
    }

    fn resolution_of(&self, request: &AccessRequest) -> Resolution {
        resolve(
            request.state,
            &request.reviews,
            request.thresholds.or(self.default_thresholds),
            request.resolve_reason.as_deref(),
        )
    }

    /// Create the alert and store its id. Returns `None` when the request has
    /// nobody to notify.
    async fn open_alert(
        &self,
        request: &AccessRequest,
        data: &mut PluginData,
        deadline: Instant,
    ) -> Result<Option<AlertId>, EngineError> {
        let mut responders = self.recipients.resolve(&request.annotations);
        if responders.is_empty() {
            responders = self.default_responders.clone();
        }
        if responders.is_empty() {
            info!("Request {} has no responders, skipping", request.id);
            return Ok(None);
        }

        let alert = NewAlert::for_request(request, responders);
        let alert_id = within(deadline, "create alert", self.gateway.create_alert(&alert)).await?;
        info!("Created alert {} for request {}", alert_id, request.id);

        data.alert_id = Some(alert_id.clone());
        within(
            deadline,
            "store alert id",
            self.repository.put(&request.id, data.clone()),
        )
        .await?;

        Ok(Some(alert_id))
    }

    /// Send one note per review not yet mirrored, in submission order.
    async fn sync_reviews(
        &self,
        request: &AccessRequest,
        alert_id: &AlertId,
        data: &mut PluginData,
        deadline: Instant,
    ) -> Result<usize, EngineError> {
        if request.reviews.len() < data.reviews_count {
            debug!(
                "Stale snapshot for request {}: {} reviews, {} already noted",
                request.id,
                request.reviews.len(),
                data.reviews_count
            );
            return Ok(0);
        }

        let mut sent = 0;
        for review in &request.reviews[data.reviews_count..] {
            within(
                deadline,
                "add review note",
                self.gateway.add_note(alert_id, &review_note(review)),
            )
            .await?;
            data.reviews_count += 1;
            within(
                deadline,
                "store reviews count",
                self.repository.put(&request.id, data.clone()),
            )
            .await?;
            sent += 1;
        }

        if sent > 0 {
            info!(
                "Added {} review notes to alert {} for request {}",
                sent, alert_id, request.id
            );
        }
        Ok(sent)
    }

    /// Submit an approval when the requester is on call for one of the
    /// request's responder schedules.
    ///
    /// Unknown schedules are skipped. The check is recorded in plugin data
    /// only after every lookup and the submission succeeded.
    async fn auto_approve(
        &self,
        submitter: &dyn ReviewSubmitter,
        request: &AccessRequest,
        data: &mut PluginData,
        deadline: Instant,
    ) -> Result<(), EngineError> {
        let schedules = self.recipients.on_call_schedules(&request.annotations);
        if schedules.is_empty() {
            return Ok(());
        }

        if request
            .reviews
            .iter()
            .any(|review| review.author == AUTO_APPROVAL_AUTHOR)
        {
            debug!("Request {} was already approved automatically", request.id);
        } else {
            let mut on_call_for = None;
            for schedule in &schedules {
                let users =
                    match within(deadline, "get on-call", self.gateway.on_call(schedule)).await {
                        Ok(users) => users,
                        Err(EngineError::Gateway(e)) if !e.is_retryable() => {
                            warn!(
                                "Skipping schedule {} for request {}: {}",
                                schedule, request.id, e
                            );
                            continue;
                        }
                        Err(e) => return Err(e),
                    };
                if users.iter().any(|user| user == &request.user) {
                    on_call_for = Some(schedule);
                    break;
                }
            }

            if let Some(schedule) = on_call_for {
                within(
                    deadline,
                    "submit review",
                    submitter.submit_review(&request.id, &auto_approval(&request.user)),
                )
                .await?;
                info!(
                    "Approved request {} automatically: {} is on call for {}",
                    request.id, request.user, schedule
                );
            }
        }

        data.auto_approval_checked = true;
        within(
            deadline,
            "store auto-approval check",
            self.repository.put(&request.id, data.clone()),
        )
        .await
    }

    /// Post the final note and close the alert. The resolution is stored only
    /// once the alert service has accepted the status change.
    async fn resolve_alert(
        &self,
        request: &AccessRequest,
        alert_id: &AlertId,
        resolution: Resolution,
        data: &mut PluginData,
        deadline: Instant,
    ) -> Result<(), EngineError> {
        if let Some(note) = resolution_note(&resolution) {
            within(
                deadline,
                "add resolution note",
                self.gateway.add_note(alert_id, &note),
            )
            .await?;
        }
        within(
            deadline,
            "resolve alert",
            self.gateway.set_status(alert_id, AlertStatus::Resolved),
        )
        .await?;

        info!(
            "Resolved alert {} for request {} as {}",
            alert_id, request.id, resolution.tag
        );
        data.resolution = resolution;
        within(
            deadline,
            "store resolution",
            self.repository.put(&request.id, data.clone()),
        )
        .await?;
        Ok(())
    }
}

/// Run `fut` unless `deadline` passes first.
async fn within<T, E>(
    deadline: Instant,
    operation: &'static str,
    fut: impl Future<Output = Result<T, E>>,
) -> Result<T, EngineError>
where
    E: Into<EngineError>,
{
    match tokio::time::timeout_at(deadline, fut).await {
        Ok(result) => result.map_err(Into::into),
        Err(_) => Err(EngineError::Timeout { operation }),
    }
}
