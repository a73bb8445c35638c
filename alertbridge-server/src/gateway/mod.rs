//! Alert gateway: the engine's view of the on-call alerting service.
//!
//! The engine needs three alert calls plus one on-call lookup used for
//! automatic approval. Each one either completes or fails
//! with a [`GatewayError`]; retries and rate limiting belong to the caller
//! or to the concrete client.

pub mod fake;
mod middleware;
mod opsgenie;

pub use fake::{AlertUpdate, CreatedAlert, FakeAlertGateway, GatewayCall, NoteAdded};
pub use middleware::CallLogMiddleware;
pub use opsgenie::{OpsgenieClient, OpsgenieConfig};

use async_trait::async_trait;
use std::fmt;

use alertbridge_core::{AlertId, NewAlert};

use crate::error::GatewayError;

/// Status the engine can set on an alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertStatus {
    Resolved,
}

impl fmt::Display for AlertStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Resolved => write!(f, "resolved"),
        }
    }
}

#[async_trait]
pub trait AlertGateway: Send + Sync {
    /// Open a new alert and return its identifier.
    async fn create_alert(&self, alert: &NewAlert) -> Result<AlertId, GatewayError>;

    /// Append a note to an existing alert.
    async fn add_note(&self, alert_id: &AlertId, text: &str) -> Result<(), GatewayError>;

    /// Change the status of an existing alert.
    async fn set_status(&self, alert_id: &AlertId, status: AlertStatus)
        -> Result<(), GatewayError>;

    /// Users currently on call for the named schedule.
    async fn on_call(&self, schedule: &str) -> Result<Vec<String>, GatewayError>;
}
