//! In-memory alert service double.
//!
//! Every successful call is recorded in a per-kind queue so tests can block
//! on "the next alert / note / status update" with a bounded timeout, even
//! when many requests are handled concurrently. Failures can be injected one
//! call at a time.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use alertbridge_core::{AlertId, NewAlert};

use super::{AlertGateway, AlertStatus};
use crate::error::GatewayError;

/// Kind of gateway call, used to target injected failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GatewayCall {
    CreateAlert,
    AddNote,
    SetStatus,
    OnCall,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedAlert {
    pub id: AlertId,
    pub alert: NewAlert,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NoteAdded {
    pub alert_id: AlertId,
    pub note: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlertUpdate {
    pub alert_id: AlertId,
    pub status: String,
}

/// Current view of an alert held by the fake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeAlert {
    pub alert: NewAlert,
    pub status: String,
    pub notes: Vec<String>,
}

struct EventQueue<T> {
    tx: mpsc::UnboundedSender<T>,
    rx: Mutex<mpsc::UnboundedReceiver<T>>,
}

impl<T> EventQueue<T> {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(rx),
        }
    }

    fn push(&self, event: T) {
        // The receiver lives as long as `self`, so sending cannot fail.
        let _ = self.tx.send(event);
    }

    async fn next(&self, timeout: Duration) -> Option<T> {
        let mut rx = self.rx.lock().await;
        tokio::time::timeout(timeout, rx.recv()).await.ok().flatten()
    }

    async fn drain(&self) -> Vec<T> {
        let mut rx = self.rx.lock().await;
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }
}

pub struct FakeAlertGateway {
    next_id: AtomicU64,
    alerts: Mutex<HashMap<AlertId, FakeAlert>>,
    known_responders: Option<HashSet<String>>,
    on_call: Mutex<HashMap<String, Vec<String>>>,
    failures: Mutex<VecDeque<(GatewayCall, GatewayError)>>,
    call_counts: [AtomicUsize; 4],
    new_alerts: EventQueue<CreatedAlert>,
    new_notes: EventQueue<NoteAdded>,
    updates: EventQueue<AlertUpdate>,
}

impl Default for FakeAlertGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeAlertGateway {
    /// A fake that accepts any responder.
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            alerts: Mutex::new(HashMap::new()),
            known_responders: None,
            on_call: Mutex::new(HashMap::new()),
            failures: Mutex::new(VecDeque::new()),
            call_counts: Default::default(),
            new_alerts: EventQueue::new(),
            new_notes: EventQueue::new(),
            updates: EventQueue::new(),
        }
    }

    /// A fake that rejects alerts addressed to responders it does not know.
    pub fn with_responders(responders: &[&str]) -> Self {
        Self {
            known_responders: Some(responders.iter().map(|r| r.to_string()).collect()),
            ..Self::new()
        }
    }

    /// Put `users` on call for `schedule`. Unknown schedules have nobody on call.
    pub async fn set_on_call(&self, schedule: &str, users: &[&str]) {
        self.on_call.lock().await.insert(
            schedule.to_string(),
            users.iter().map(|u| u.to_string()).collect(),
        );
    }

    /// Make the next call of `kind` fail with `error`. Failures queue up.
    pub async fn fail_next(&self, kind: GatewayCall, error: GatewayError) {
        self.failures.lock().await.push_back((kind, error));
    }

    /// Number of calls of `kind` attempted so far, failed ones included.
    pub fn call_count(&self, kind: GatewayCall) -> usize {
        self.call_counts[kind as usize].load(Ordering::SeqCst)
    }

    pub fn total_calls(&self) -> usize {
        self.call_counts
            .iter()
            .map(|c| c.load(Ordering::SeqCst))
            .sum()
    }

    pub async fn alert(&self, id: &AlertId) -> Option<FakeAlert> {
        self.alerts.lock().await.get(id).cloned()
    }

    pub async fn alert_count(&self) -> usize {
        self.alerts.lock().await.len()
    }

    /// Wait for the next created alert.
    pub async fn check_new_alert(&self, timeout: Duration) -> Option<CreatedAlert> {
        self.new_alerts.next(timeout).await
    }

    /// Wait for the next note added to any alert.
    pub async fn check_new_note(&self, timeout: Duration) -> Option<NoteAdded> {
        self.new_notes.next(timeout).await
    }

    /// Wait for the next alert status update.
    pub async fn check_alert_update(&self, timeout: Duration) -> Option<AlertUpdate> {
        self.updates.next(timeout).await
    }

    /// Take every status update recorded but not yet consumed.
    pub async fn drain_updates(&self) -> Vec<AlertUpdate> {
        self.updates.drain().await
    }

    async fn begin(&self, kind: GatewayCall) -> Result<(), GatewayError> {
        self.call_counts[kind as usize].fetch_add(1, Ordering::SeqCst);
        let mut failures = self.failures.lock().await;
        match failures.iter().position(|(k, _)| *k == kind) {
            Some(index) => match failures.remove(index) {
                Some((_, error)) => Err(error),
                None => Ok(()),
            },
            None => Ok(()),
        }
    }
}

#[async_trait]
impl AlertGateway for FakeAlertGateway {
    async fn create_alert(&self, alert: &NewAlert) -> Result<AlertId, GatewayError> {
        self.begin(GatewayCall::CreateAlert).await?;

        if let Some(known) = &self.known_responders {
            if let Some(unknown) = alert.responders.iter().find(|r| !known.contains(*r)) {
                return Err(GatewayError::permanent(
                    "create alert",
                    format!("unknown responder {}", unknown),
                ));
            }
        }

        let id = AlertId(format!(
            "alert-{}",
            self.next_id.fetch_add(1, Ordering::SeqCst)
        ));
        self.alerts.lock().await.insert(
            id.clone(),
            FakeAlert {
                alert: alert.clone(),
                status: "open".to_string(),
                notes: Vec::new(),
            },
        );
        self.new_alerts.push(CreatedAlert {
            id: id.clone(),
            alert: alert.clone(),
        });
        Ok(id)
    }

    async fn add_note(&self, alert_id: &AlertId, text: &str) -> Result<(), GatewayError> {
        self.begin(GatewayCall::AddNote).await?;

        let mut alerts = self.alerts.lock().await;
        let alert = alerts.get_mut(alert_id).ok_or_else(|| {
            GatewayError::permanent("add note", format!("alert {} not found", alert_id))
        })?;
        alert.notes.push(text.to_string());
        // Push while holding the lock so queue order matches note order.
        self.new_notes.push(NoteAdded {
            alert_id: alert_id.clone(),
            note: text.to_string(),
        });
        Ok(())
    }

    async fn set_status(
        &self,
        alert_id: &AlertId,
        status: AlertStatus,
    ) -> Result<(), GatewayError> {
        self.begin(GatewayCall::SetStatus).await?;

        let mut alerts = self.alerts.lock().await;
        let alert = alerts.get_mut(alert_id).ok_or_else(|| {
            GatewayError::permanent("set status", format!("alert {} not found", alert_id))
        })?;
        alert.status = status.to_string();
        self.updates.push(AlertUpdate {
            alert_id: alert_id.clone(),
            status: status.to_string(),
        });
        Ok(())
    }

    async fn on_call(&self, schedule: &str) -> Result<Vec<String>, GatewayError> {
        self.begin(GatewayCall::OnCall).await?;
        Ok(self
            .on_call
            .lock()
            .await
            .get(schedule)
            .cloned()
            .unwrap_or_default())
    }
}
