//! Opsgenie implementation of the alert gateway.
//!
//! Alert creation in Opsgenie is asynchronous: `POST /v2/alerts` only
//! returns a request id, and the alert id becomes available from
//! `GET /v2/alerts/requests/{requestId}` once the request was processed.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware, RequestBuilder};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use alertbridge_core::{AlertId, NewAlert};

use super::middleware::CallLogMiddleware;
use super::{AlertGateway, AlertStatus};
use crate::error::GatewayError;

const ALERT_TAG: &str = "access-request";

/// Connection settings for the Opsgenie API.
#[derive(Debug, Clone)]
pub struct OpsgenieConfig {
    pub api_url: String,
    pub api_key: String,
    pub priority: String,
    /// Opsgenie responder type used for every recipient ("schedule", "team", ...).
    pub responder_type: String,
    /// How many times to look up the result of an alert creation request.
    pub creation_poll_attempts: u32,
    pub creation_poll_interval: Duration,
}

impl OpsgenieConfig {
    pub fn new(api_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            api_url: api_url.into(),
            api_key: api_key.into(),
            priority: "P3".to_string(),
            responder_type: "schedule".to_string(),
            creation_poll_attempts: 10,
            creation_poll_interval: Duration::from_millis(500),
        }
    }
}

#[derive(Clone)]
pub struct OpsgenieClient {
    client: ClientWithMiddleware,
    config: OpsgenieConfig,
}

#[derive(Debug, Serialize)]
struct Responder<'a> {
    name: &'a str,
    #[serde(rename = "type")]
    kind: &'a str,
}

#[derive(Debug, Serialize)]
struct CreateAlertRequest<'a> {
    message: &'a str,
    alias: &'a str,
    description: &'a str,
    responders: Vec<Responder<'a>>,
    tags: Vec<&'a str>,
    priority: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AsyncRequestResponse {
    request_id: String,
}

#[derive(Debug, Deserialize)]
struct RequestStatusResponse {
    data: RequestStatus,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RequestStatus {
    success: bool,
    #[serde(default)]
    alert_id: Option<String>,
    #[serde(default)]
    status: Option<String>,
}

#[derive(Debug, Serialize)]
struct NoteRequest<'a> {
    note: &'a str,
}

#[derive(Debug, Serialize)]
struct CloseRequest<'a> {
    source: &'a str,
}

#[derive(Debug, Deserialize)]
struct OnCallResponse {
    data: OnCallData,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OnCallData {
    #[serde(default)]
    on_call_recipients: Vec<String>,
}

impl OpsgenieClient {
    pub fn new(config: OpsgenieConfig) -> Result<Self, GatewayError> {
        let client = Client::builder()
            .user_agent(format!("alertbridge/{}", crate::get_version()))
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| GatewayError::permanent("build HTTP client", e.to_string()))?;

        let client = ClientBuilder::new(client).with(CallLogMiddleware).build();

        Ok(Self { client, config })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.api_url.trim_end_matches('/'), path)
    }

    /// `v2/schedules/{schedule}/on-calls`, with the schedule name escaped as
    /// a single path segment.
    fn on_call_url(&self, schedule: &str) -> Result<Url, GatewayError> {
        let mut url = Url::parse(&self.url("v2/schedules"))
            .map_err(|e| GatewayError::permanent("get on-call", e.to_string()))?;
        url.path_segments_mut()
            .map_err(|_| GatewayError::permanent("get on-call", "API URL cannot have a path"))?
            .push(schedule)
            .push("on-calls");
        url.query_pairs_mut()
            .append_pair("scheduleIdentifierType", "name")
            .append_pair("flat", "true");
        Ok(url)
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        builder
            .header("Authorization", format!("GenieKey {}", self.config.api_key))
            .header("Accept", "application/json")
    }

    async fn send(
        &self,
        operation: &str,
        builder: RequestBuilder,
    ) -> Result<reqwest::Response, GatewayError> {
        let response = self
            .authorized(builder)
            .send()
            .await
            .map_err(|e| GatewayError::transient(operation, e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        Err(GatewayError::from_status(operation, status, &body))
    }

    async fn lookup_alert_id(&self, request_id: &str) -> Result<AlertId, GatewayError> {
        let url = self.url(&format!("v2/alerts/requests/{}", request_id));

        for attempt in 1..=self.config.creation_poll_attempts {
            let response = self
                .authorized(self.client.get(&url))
                .send()
                .await
                .map_err(|e| GatewayError::transient("get alert request", e.to_string()))?;

            // Opsgenie answers 404 until the creation request has been processed.
            if response.status() == StatusCode::NOT_FOUND {
                debug!(
                    "Alert request {} not processed yet (attempt {})",
                    request_id, attempt
                );
                tokio::time::sleep(self.config.creation_poll_interval).await;
                continue;
            }

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(GatewayError::from_status("get alert request", status, &body));
            }

            let parsed: RequestStatusResponse = response
                .json()
                .await
                .map_err(|e| GatewayError::transient("get alert request", e.to_string()))?;

            return match (parsed.data.success, parsed.data.alert_id) {
                (true, Some(alert_id)) if !alert_id.is_empty() => Ok(AlertId(alert_id)),
                (true, _) => {
                    tokio::time::sleep(self.config.creation_poll_interval).await;
                    continue;
                }
                (false, _) => Err(GatewayError::permanent(
                    "create alert",
                    parsed
                        .data
                        .status
                        .unwrap_or_else(|| "alert creation failed".to_string()),
                )),
            };
        }

        Err(GatewayError::transient(
            "get alert request",
            format!("request {} still pending", request_id),
        ))
    }
}

#[async_trait]
impl AlertGateway for OpsgenieClient {
    async fn create_alert(&self, alert: &NewAlert) -> Result<AlertId, GatewayError> {
        let body = CreateAlertRequest {
            message: &alert.message,
            alias: &alert.alias,
            description: &alert.description,
            responders: alert
                .responders
                .iter()
                .map(|name| Responder {
                    name,
                    kind: &self.config.responder_type,
                })
                .collect(),
            tags: vec![ALERT_TAG],
            priority: &self.config.priority,
        };

        info!(
            "Creating Opsgenie alert for {} with {} responders",
            alert.alias,
            alert.responders.len()
        );

        let response = self
            .send("create alert", self.client.post(self.url("v2/alerts")).json(&body))
            .await?;
        let accepted: AsyncRequestResponse = response
            .json()
            .await
            .map_err(|e| GatewayError::transient("create alert", e.to_string()))?;

        let alert_id = self.lookup_alert_id(&accepted.request_id).await?;
        info!("Created Opsgenie alert {} for {}", alert_id, alert.alias);
        Ok(alert_id)
    }

    async fn add_note(&self, alert_id: &AlertId, text: &str) -> Result<(), GatewayError> {
        let url = self.url(&format!("v2/alerts/{}/notes?identifierType=id", alert_id));
        self.send("add note", self.client.post(url).json(&NoteRequest { note: text }))
            .await?;
        Ok(())
    }

    async fn set_status(
        &self,
        alert_id: &AlertId,
        status: AlertStatus,
    ) -> Result<(), GatewayError> {
        match status {
            AlertStatus::Resolved => {
                let url = self.url(&format!("v2/alerts/{}/close?identifierType=id", alert_id));
                self.send(
                    "close alert",
                    self.client.post(url).json(&CloseRequest {
                        source: "alertbridge",
                    }),
                )
                .await?;
            }
        }
        Ok(())
    }

    async fn on_call(&self, schedule: &str) -> Result<Vec<String>, GatewayError> {
        let url = self.on_call_url(schedule)?;
        let response = self.send("get on-call", self.client.get(url)).await?;
        let parsed: OnCallResponse = response
            .json()
            .await
            .map_err(|e| GatewayError::transient("get on-call", e.to_string()))?;
        debug!(
            "{} users on call for schedule {}",
            parsed.data.on_call_recipients.len(),
            schedule
        );
        Ok(parsed.data.on_call_recipients)
    }
}
