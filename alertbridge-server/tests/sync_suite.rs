//! End-to-end behaviour of the dispatcher and engine against the fake alert
//! service, with snapshots delivered the way the request watcher would.

use std::sync::Arc;
use std::time::Duration;

use alertbridge_core::{
    AccessRequest, AlertId, PluginData, ProposedState, RequestId, RequestState, Resolution,
    DEFAULT_NOTIFY_ANNOTATION, DEFAULT_RESPONDERS_ANNOTATION,
};
use alertbridge_server::dispatcher::default_concurrency;
use alertbridge_server::gateway::GatewayCall;
use alertbridge_server::approval::AUTO_APPROVAL_AUTHOR;
use alertbridge_server::{
    Dispatcher, DispatcherConfig, FakeAlertGateway, FakeReviewSubmitter, GatewayError,
    HandleOutcome, InMemoryRepository, PluginDataRepository, SqliteRepository, SyncEngine,
};

const TIMEOUT: Duration = Duration::from_secs(2);

struct Harness {
    dispatcher: Arc<Dispatcher>,
    gateway: Arc<FakeAlertGateway>,
    repository: Arc<dyn PluginDataRepository>,
}

impl Harness {
    fn new() -> Self {
        Self::with(
            Arc::new(FakeAlertGateway::new()),
            Arc::new(InMemoryRepository::new()),
            Vec::new(),
        )
    }

    fn with(
        gateway: Arc<FakeAlertGateway>,
        repository: Arc<dyn PluginDataRepository>,
        default_responders: Vec<String>,
    ) -> Self {
        let engine = SyncEngine::new(repository.clone(), gateway.clone())
            .with_default_responders(default_responders);
        Self::serving(engine, gateway, repository)
    }

    /// A harness whose engine approves on-call requesters through the returned fake.
    fn approving() -> (Self, Arc<FakeReviewSubmitter>) {
        let gateway = Arc::new(FakeAlertGateway::new());
        let repository: Arc<dyn PluginDataRepository> = Arc::new(InMemoryRepository::new());
        let submitter = Arc::new(FakeReviewSubmitter::new());
        let engine = SyncEngine::new(repository.clone(), gateway.clone())
            .with_review_submitter(submitter.clone());
        (Self::serving(engine, gateway, repository), submitter)
    }

    fn serving(
        engine: SyncEngine,
        gateway: Arc<FakeAlertGateway>,
        repository: Arc<dyn PluginDataRepository>,
    ) -> Self {
        let dispatcher = Dispatcher::new(
            Arc::new(engine),
            DispatcherConfig {
                max_concurrency: default_concurrency(),
                handle_timeout: Duration::from_secs(5),
                max_attempts: 3,
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(10),
            },
        );
        Self {
            dispatcher: Arc::new(dispatcher),
            gateway,
            repository,
        }
    }

    async fn handle(&self, request: &AccessRequest) -> HandleOutcome {
        self.dispatcher
            .submit_and_wait(request.clone())
            .await
            .expect("snapshot should be handled")
    }

    async fn plugin_data(&self, id: &str) -> PluginData {
        self.repository
            .get(&RequestId::from(id))
            .await
            .unwrap()
            .expect("plugin data should exist")
    }

    async fn notes(&self, alert_id: &AlertId) -> Vec<String> {
        self.gateway.alert(alert_id).await.unwrap().notes
    }
}

fn new_request(id: &str) -> AccessRequest {
    AccessRequest::new(id, "requester1")
        .with_roles(&["editor"])
        .with_annotation(DEFAULT_NOTIFY_ANNOTATION, &["Teleport Notifications"])
}

#[tokio::test]
async fn test_new_request_creates_alert() {
    let h = Harness::new();
    let request = new_request("r1");

    h.handle(&request).await;

    let created = h.gateway.check_new_alert(TIMEOUT).await.unwrap();
    assert_eq!(created.alert.responders, vec!["Teleport Notifications"]);
    assert_eq!(created.alert.alias, "r1");
    assert!(created.alert.message.contains("requester1"));
    assert_eq!(h.gateway.call_count(GatewayCall::CreateAlert), 1);

    assert_eq!(
        h.plugin_data("r1").await,
        PluginData {
            alert_id: Some(created.id),
            reviews_count: 0,
            resolution: Resolution::unresolved(),
            auto_approval_checked: false,
        }
    );
}

#[tokio::test]
async fn test_recipients_merge_both_annotations() {
    let h = Harness::new();
    let request = new_request("r1").with_annotation(
        DEFAULT_RESPONDERS_ANNOTATION,
        &["Responder 1", "Teleport Notifications", "Responder 2"],
    );

    h.handle(&request).await;

    let created = h.gateway.check_new_alert(TIMEOUT).await.unwrap();
    assert_eq!(
        created.alert.responders,
        vec!["Teleport Notifications", "Responder 1", "Responder 2"]
    );
}

#[tokio::test]
async fn test_default_responders_used_without_annotations() {
    let h = Harness::with(
        Arc::new(FakeAlertGateway::new()),
        Arc::new(InMemoryRepository::new()),
        vec!["Fallback Schedule".to_string()],
    );

    h.handle(&AccessRequest::new("r1", "requester1")).await;

    let created = h.gateway.check_new_alert(TIMEOUT).await.unwrap();
    assert_eq!(created.alert.responders, vec!["Fallback Schedule"]);
}

#[tokio::test]
async fn test_request_without_recipients_is_skipped() {
    let h = Harness::new();

    let outcome = h.handle(&AccessRequest::new("r1", "requester1")).await;

    assert_eq!(outcome, HandleOutcome::NotRelevant);
    assert_eq!(h.gateway.total_calls(), 0);
    assert!(h.repository.get(&RequestId::from("r1")).await.unwrap().is_none());
}

#[tokio::test]
async fn test_same_snapshot_twice_makes_no_new_calls() {
    let h = Harness::new();
    let request = new_request("r1").review("reviewer1", ProposedState::Approved, "fine");

    h.handle(&request).await;
    let calls = h.gateway.total_calls();
    h.handle(&request).await;

    assert_eq!(h.gateway.total_calls(), calls);
}

#[tokio::test]
async fn test_reviews_one_at_a_time_add_notes_in_order() {
    let h = Harness::new();
    let mut request = new_request("r1").with_thresholds(10, 10);
    h.handle(&request).await;
    let alert_id = h.gateway.check_new_alert(TIMEOUT).await.unwrap().id;

    let reviews = [
        ("reviewer1", ProposedState::Approved, "looks fine"),
        ("reviewer2", ProposedState::Denied, "too broad"),
        ("reviewer3", ProposedState::Approved, ""),
    ];
    for (author, state, reason) in reviews {
        request = request.review(author, state, reason);
        h.handle(&request).await;
    }

    let notes = h.notes(&alert_id).await;
    assert_eq!(notes.len(), 3);
    assert!(notes[0].contains("reviewer1 reviewed the request"));
    assert!(notes[0].contains("Resolution: APPROVED"));
    assert!(notes[0].contains("Reason: looks fine"));
    assert!(notes[1].contains("reviewer2 reviewed the request"));
    assert!(notes[1].contains("Resolution: DENIED"));
    assert!(notes[1].contains("Reason: too broad"));
    assert!(notes[2].contains("reviewer3 reviewed the request"));
    assert!(!notes[2].contains("Reason:"));

    assert_eq!(h.plugin_data("r1").await.reviews_count, 3);
}

#[tokio::test]
async fn test_single_reviewer_approval() {
    let h = Harness::new();
    let request = new_request("r1");
    h.handle(&request).await;
    let alert_id = h.gateway.check_new_alert(TIMEOUT).await.unwrap().id;

    let request = request
        .review("reviewer1", ProposedState::Approved, "okay")
        .resolved(RequestState::Approved, "okay");
    h.handle(&request).await;

    let review = h.gateway.check_new_note(TIMEOUT).await.unwrap();
    assert!(review.note.contains("reviewer1 reviewed the request"));
    let last = h.gateway.check_new_note(TIMEOUT).await.unwrap();
    assert!(last.note.contains("Access request has been approved"));
    assert!(last.note.contains("Reason: okay"));

    let update = h.gateway.check_alert_update(TIMEOUT).await.unwrap();
    assert_eq!(update.alert_id, alert_id);
    assert_eq!(update.status, "resolved");

    assert_eq!(
        h.plugin_data("r1").await.resolution,
        Resolution::approved("okay")
    );
}

#[tokio::test]
async fn test_threshold_approval_by_two_reviewers() {
    let h = Harness::new();
    let request = new_request("r1").with_thresholds(2, 2);
    h.handle(&request).await;

    let request = request.review("reviewer1", ProposedState::Approved, "okay");
    h.handle(&request).await;
    assert!(h.gateway.drain_updates().await.is_empty());
    assert_eq!(
        h.plugin_data("r1").await.resolution,
        Resolution::unresolved()
    );

    let request = request.review("reviewer2", ProposedState::Approved, "finally okay");
    h.handle(&request).await;

    assert_eq!(
        h.plugin_data("r1").await.resolution,
        Resolution::approved("finally okay")
    );
    assert_eq!(h.gateway.call_count(GatewayCall::SetStatus), 1);
}

#[tokio::test]
async fn test_threshold_denial_by_two_reviewers() {
    let h = Harness::new();
    let request = new_request("r1")
        .with_thresholds(2, 2)
        .review("reviewer1", ProposedState::Denied, "not okay")
        .review("reviewer2", ProposedState::Denied, "finally not okay");

    h.handle(&request).await;
    let alert_id = h.gateway.check_new_alert(TIMEOUT).await.unwrap().id;

    let notes = h.notes(&alert_id).await;
    assert_eq!(notes.len(), 3);
    assert!(notes[0].contains("Reason: not okay"));
    assert!(notes[1].contains("Reason: finally not okay"));
    assert!(notes[2].contains("Access request has been denied"));
    assert!(notes[2].contains("Reason: finally not okay"));

    assert_eq!(
        h.plugin_data("r1").await.resolution,
        Resolution::denied("finally not okay")
    );
    assert_eq!(h.gateway.call_count(GatewayCall::SetStatus), 1);
}

#[tokio::test]
async fn test_direct_approval_below_threshold_resolves() {
    let h = Harness::new();
    let request = new_request("r1")
        .with_thresholds(2, 2)
        .review("reviewer1", ProposedState::Approved, "okay");
    h.handle(&request).await;
    assert_eq!(
        h.plugin_data("r1").await.resolution,
        Resolution::unresolved()
    );

    let request = request.resolved(RequestState::Approved, "admin override");
    h.handle(&request).await;

    assert_eq!(h.gateway.call_count(GatewayCall::SetStatus), 1);
    assert_eq!(
        h.plugin_data("r1").await.resolution,
        Resolution::approved("admin override")
    );
}

#[tokio::test]
async fn test_on_call_requester_is_approved_automatically() {
    let (h, submitter) = Harness::approving();
    h.gateway.set_on_call("Ops Schedule", &["requester1"]).await;
    let request = new_request("r1").with_annotation(DEFAULT_RESPONDERS_ANNOTATION, &["Ops Schedule"]);

    h.handle(&request).await;

    let submitted = submitter.submitted().await;
    assert_eq!(submitted.len(), 1);
    let (id, review) = submitted[0].clone();
    assert_eq!(id, RequestId::from("r1"));
    assert_eq!(review.author, AUTO_APPROVAL_AUTHOR);
    assert_eq!(review.proposed_state, ProposedState::Approved);

    // The request service applies the review and sends the next snapshot.
    let request = AccessRequest {
        reviews: vec![review],
        ..request
    }
    .resolved(RequestState::Approved, "");
    h.handle(&request).await;

    let alert_id = h.gateway.check_new_alert(TIMEOUT).await.unwrap().id;
    let notes = h.notes(&alert_id).await;
    assert_eq!(notes.len(), 2);
    assert!(notes[0].starts_with("alertbridge reviewed the request"));
    assert!(notes[1].contains("Access request has been approved"));
    assert!(notes[1].contains("user requester1 is on-call"));
    assert_eq!(submitter.submitted().await.len(), 1);
}

#[tokio::test]
async fn test_expired_request_resolves_alert() {
    let h = Harness::new();
    let request = new_request("r1");
    h.handle(&request).await;
    let alert_id = h.gateway.check_new_alert(TIMEOUT).await.unwrap().id;

    h.handle(&request.resolved(RequestState::Expired, "")).await;

    let notes = h.notes(&alert_id).await;
    assert_eq!(notes, vec!["Access request has expired".to_string()]);
    assert_eq!(
        h.gateway.check_alert_update(TIMEOUT).await.unwrap().status,
        "resolved"
    );
}

#[tokio::test]
async fn test_resolution_never_regresses() {
    let h = Harness::new();
    let approved = new_request("r1").resolved(RequestState::Approved, "okay");
    h.handle(&approved).await;
    let calls = h.gateway.total_calls();

    // A late snapshot still showing the request as pending, then a
    // contradictory one.
    h.handle(&new_request("r1")).await;
    h.handle(&new_request("r1").resolved(RequestState::Denied, "changed my mind"))
        .await;

    assert_eq!(h.gateway.total_calls(), calls);
    assert_eq!(h.gateway.call_count(GatewayCall::SetStatus), 1);
    assert_eq!(
        h.plugin_data("r1").await.resolution,
        Resolution::approved("okay")
    );
}

#[tokio::test]
async fn test_transient_failure_is_completed_by_retry() {
    let h = Harness::new();
    let request = new_request("r1")
        .review("reviewer1", ProposedState::Approved, "ok")
        .resolved(RequestState::Approved, "ok");
    h.gateway
        .fail_next(
            GatewayCall::SetStatus,
            GatewayError::transient("close alert", "502 Bad Gateway"),
        )
        .await;

    h.handle(&request).await;

    assert_eq!(h.gateway.alert_count().await, 1);
    assert_eq!(h.gateway.call_count(GatewayCall::SetStatus), 2);
    let data = h.plugin_data("r1").await;
    assert_eq!(data.reviews_count, 1);
    assert!(data.resolution.is_resolved());
}

#[tokio::test]
async fn test_permanent_creation_failure_retried_by_next_snapshot() {
    let gateway = Arc::new(FakeAlertGateway::with_responders(&["Teleport Notifications"]));
    let h = Harness::with(gateway, Arc::new(InMemoryRepository::new()), Vec::new());

    let bad = new_request("r1").with_annotation(DEFAULT_RESPONDERS_ANNOTATION, &["Nobody"]);
    let err = h.dispatcher.submit_and_wait(bad).await.unwrap_err();
    assert!(!err.is_retryable());
    assert_eq!(h.gateway.call_count(GatewayCall::CreateAlert), 1);
    assert!(h.repository.get(&RequestId::from("r1")).await.unwrap().is_none());

    h.handle(&new_request("r1")).await;
    assert_eq!(h.gateway.alert_count().await, 1);
}

#[tokio::test]
async fn test_progress_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("alertbridge.db");
    let gateway = Arc::new(FakeAlertGateway::new());
    let request = new_request("r1")
        .with_thresholds(3, 3)
        .review("reviewer1", ProposedState::Approved, "ok");

    {
        let repository = Arc::new(SqliteRepository::new(&db_path).unwrap());
        let h = Harness::with(gateway.clone(), repository, Vec::new());
        h.handle(&request).await;
    }

    let repository = Arc::new(SqliteRepository::new(&db_path).unwrap());
    let h = Harness::with(gateway.clone(), repository, Vec::new());
    let request = request.review("reviewer2", ProposedState::Approved, "ok too");
    h.handle(&request).await;

    assert_eq!(gateway.alert_count().await, 1);
    assert_eq!(gateway.call_count(GatewayCall::AddNote), 2);
    assert_eq!(h.plugin_data("r1").await.reviews_count, 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_many_concurrent_requests() {
    let h = Harness::new();
    let count = default_concurrency();

    let mut tasks = Vec::new();
    for i in 0..count {
        let dispatcher = h.dispatcher.clone();
        tasks.push(tokio::spawn(async move {
            let request = new_request(&format!("r{i}"))
                .review("reviewer1", ProposedState::Approved, "ok")
                .resolved(RequestState::Approved, "ok");
            dispatcher.submit_and_wait(request).await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(h.gateway.alert_count().await, count);
    assert_eq!(h.gateway.call_count(GatewayCall::CreateAlert), count);
    assert_eq!(h.gateway.call_count(GatewayCall::SetStatus), count);
    assert_eq!(h.repository.get_all().await.unwrap().len(), count);

    let mut updates = h.gateway.drain_updates().await;
    updates.sort_by(|a, b| a.alert_id.0.cmp(&b.alert_id.0));
    updates.dedup();
    assert_eq!(updates.len(), count);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_redelivered_snapshots_of_one_request_create_one_alert() {
    let h = Harness::new();
    let request = new_request("r1").review("reviewer1", ProposedState::Approved, "ok");

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let dispatcher = h.dispatcher.clone();
        let request = request.clone();
        tasks.push(tokio::spawn(async move {
            dispatcher.submit_and_wait(request).await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(h.gateway.alert_count().await, 1);
    assert_eq!(h.gateway.call_count(GatewayCall::AddNote), 1);
}
