//! Tranche client implementation.

use std::fmt::Display;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::{RequestBuilder, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::debug;
use tranche_core::{
    AuthorizationStatus, EscrowEvent, EscrowInstrument, EventType, ExecutionEvent, Milestone,
    PaymentAuthorizationRequest, PaymentExecution, Result, TimeLock, TrancheError,
};
use tranche_graph::{Forecast, GraphAnalysis};
use tranche_release::{
    BulkApprovalReport, BulkExecutionReport, CircuitState, CompletionOutcome, PayoutOutcome,
};
use tranche_state::EntityHistory;
use uuid::Uuid;

/// Client for interacting with a Tranche node.
#[derive(Clone)]
pub struct TrancheClient {
    /// Base URL of the node.
    base_url: String,

    /// HTTP client.
    http_client: reqwest::Client,

    /// Deadline applied to every request.
    timeout: Duration,
}

/// Default per-request deadline.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Node health.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub version: String,
    pub ledger_circuit: CircuitState,
}

/// A milestone to register. Give it an `id` when other milestones depend on it.
#[derive(Debug, Clone, Serialize)]
pub struct NewMilestone {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,
    pub name: String,
    pub depends_on: Vec<Uuid>,
    pub due_date: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_duration_secs: Option<i64>,
}

impl NewMilestone {
    pub fn new(name: impl Into<String>, due_date: DateTime<Utc>) -> Self {
        Self {
            id: Some(Uuid::new_v4()),
            name: name.into(),
            depends_on: Vec::new(),
            due_date,
            estimated_duration_secs: None,
        }
    }

    pub fn depends_on(mut self, predecessor: Uuid) -> Self {
        self.depends_on.push(predecessor);
        self
    }

    pub fn estimate_secs(mut self, secs: i64) -> Self {
        self.estimated_duration_secs = Some(secs);
        self
    }
}

/// Stored milestones of a contract.
#[derive(Debug, Clone, Deserialize)]
pub struct ContractSummary {
    pub contract_id: Uuid,
    pub milestones: Vec<Milestone>,
}

/// An approved request held behind a time-lock.
#[derive(Debug, Clone, Deserialize)]
pub struct LockedRequest {
    pub request: PaymentAuthorizationRequest,
    pub time_lock: TimeLock,
}

/// Result of an early time-lock release.
#[derive(Debug, Clone, Deserialize)]
pub struct EarlyRelease {
    pub time_lock: TimeLock,
    pub payout: PayoutOutcome,
}

/// Audit export of an execution trace.
#[derive(Debug, Clone, Deserialize)]
pub struct TraceExport {
    pub execution_id: Uuid,
    pub events: Vec<ExecutionEvent>,
    pub root: String,
    pub verified: bool,
}

/// Error body returned by the node.
#[derive(Debug, Deserialize)]
struct RemoteError {
    error: String,
}

#[derive(Debug, Deserialize)]
struct OverdueResponse {
    flagged: Vec<Uuid>,
}

#[derive(Debug, Serialize)]
struct ContractRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    contract_id: Option<Uuid>,
    milestones: &'a [NewMilestone],
    actor: &'a str,
}

#[derive(Debug, Serialize)]
struct EventQuery {
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    event_type: Option<EventType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    subject: Option<Uuid>,
    limit: usize,
}

#[derive(Debug, Serialize)]
struct StatusQuery {
    #[serde(skip_serializing_if = "Option::is_none")]
    status: Option<AuthorizationStatus>,
}

impl TrancheClient {
    /// Connect to a Tranche node.
    pub async fn connect(url: &str) -> Result<Self> {
        Self::connect_with_timeout(url, DEFAULT_TIMEOUT).await
    }

    /// Connect with a custom per-request deadline.
    pub async fn connect_with_timeout(url: &str, timeout: Duration) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TrancheError::ConnectionError(e.to_string()))?;
        let client = Self {
            base_url: url.trim_end_matches('/').to_string(),
            http_client,
            timeout,
        };

        // Verify connection with health check
        client.health().await?;
        Ok(client)
    }

    pub async fn health(&self) -> Result<HealthStatus> {
        let request = self.http_client.get(format!("{}/health", self.base_url));
        self.send(request, "Node", &self.base_url).await
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/v1{}", self.base_url, path)
    }

    /// Send a request and decode its body.
    ///
    /// `resource` and `id` name what a 404 refers to.
    async fn send<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        resource: &str,
        id: impl Display,
    ) -> Result<T> {
        let response = request.send().await.map_err(|e| self.transport_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            debug!(%status, resource, "Node returned an error");
            return Err(error_from_response(status, &body, resource, &id.to_string()));
        }

        response.json().await.map_err(|e| {
            if e.is_timeout() {
                self.transport_error(e)
            } else {
                TrancheError::SerializationError(e.to_string())
            }
        })
    }

    fn transport_error(&self, e: reqwest::Error) -> TrancheError {
        if e.is_timeout() {
            TrancheError::Timeout {
                duration_ms: self.timeout.as_millis() as u64,
                message: e.to_string(),
            }
        } else {
            TrancheError::ConnectionError(e.to_string())
        }
    }

    // Contracts

    /// Register a contract. Nothing is stored if the graph is invalid.
    pub async fn register_contract(
        &self,
        contract_id: Option<Uuid>,
        milestones: &[NewMilestone],
        actor: &str,
    ) -> Result<ContractSummary> {
        let body = ContractRequest {
            contract_id,
            milestones,
            actor,
        };
        let request = self.http_client.post(self.url("/contracts")).json(&body);
        self.send(request, "Contract", contract_id.map(|id| id.to_string()).unwrap_or_default())
            .await
    }

    /// Check a milestone set without storing it.
    pub async fn validate_contract(&self, milestones: &[NewMilestone]) -> Result<GraphAnalysis> {
        let body = ContractRequest {
            contract_id: None,
            milestones,
            actor: "sdk",
        };
        let request = self.http_client.post(self.url("/contracts/validate")).json(&body);
        self.send(request, "Contract", "").await
    }

    pub async fn contract(&self, contract_id: Uuid) -> Result<ContractSummary> {
        let request = self.http_client.get(self.url(&format!("/contracts/{}", contract_id)));
        self.send(request, "Contract", contract_id).await
    }

    pub async fn schedule(&self, contract_id: Uuid) -> Result<GraphAnalysis> {
        let request = self
            .http_client
            .get(self.url(&format!("/contracts/{}/schedule", contract_id)));
        self.send(request, "Contract", contract_id).await
    }

    pub async fn reoptimize(&self, contract_id: Uuid, as_of: Option<DateTime<Utc>>) -> Result<Forecast> {
        let mut request = self
            .http_client
            .get(self.url(&format!("/contracts/{}/reoptimize", contract_id)));
        if let Some(as_of) = as_of {
            request = request.query(&[("as_of", as_of.to_rfc3339())]);
        }
        self.send(request, "Contract", contract_id).await
    }

    // Milestones

    pub async fn milestone(&self, id: Uuid) -> Result<Milestone> {
        let request = self.http_client.get(self.url(&format!("/milestones/{}", id)));
        self.send(request, "Milestone", id).await
    }

    pub async fn record_progress(&self, id: Uuid, percent: u8, actor: &str) -> Result<Milestone> {
        let request = self
            .http_client
            .post(self.url(&format!("/milestones/{}/progress", id)))
            .json(&serde_json::json!({ "percent": percent, "actor": actor }));
        self.send(request, "Milestone", id).await
    }

    /// Complete a milestone. The outcome carries the payout if it has an escrow.
    pub async fn complete_milestone(&self, id: Uuid, actor: &str) -> Result<CompletionOutcome> {
        let request = self
            .http_client
            .post(self.url(&format!("/milestones/{}/complete", id)))
            .json(&serde_json::json!({ "actor": actor }));
        self.send(request, "Milestone", id).await
    }

    pub async fn cancel_milestone(&self, id: Uuid, actor: &str) -> Result<Milestone> {
        let request = self
            .http_client
            .post(self.url(&format!("/milestones/{}/cancel", id)))
            .json(&serde_json::json!({ "actor": actor }));
        self.send(request, "Milestone", id).await
    }

    pub async fn milestone_history(&self, id: Uuid) -> Result<EntityHistory> {
        let request = self.http_client.get(self.url(&format!("/milestones/{}/history", id)));
        self.send(request, "Milestone", id).await
    }

    /// Flag overdue milestones as of `as_of`, or now.
    pub async fn mark_overdue(&self, as_of: Option<DateTime<Utc>>) -> Result<Vec<Uuid>> {
        let request = self
            .http_client
            .post(self.url("/milestones/overdue"))
            .json(&serde_json::json!({ "as_of": as_of }));
        let response: OverdueResponse = self.send(request, "Milestone", "").await?;
        Ok(response.flagged)
    }

    // Escrows

    /// Fund a milestone. `amount` is in minor units.
    pub async fn create_escrow(&self, milestone_id: Uuid, amount: u64, currency: &str) -> Result<EscrowInstrument> {
        let request = self.http_client.post(self.url("/escrows")).json(&serde_json::json!({
            "milestone_id": milestone_id,
            "amount": amount,
            "currency": currency,
        }));
        self.send(request, "Milestone", milestone_id).await
    }

    pub async fn escrow(&self, id: Uuid) -> Result<EscrowInstrument> {
        let request = self.http_client.get(self.url(&format!("/escrows/{}", id)));
        self.send(request, "Escrow", id).await
    }

    // Authorizations

    pub async fn request_authorization(&self, milestone_id: Uuid, actor: &str) -> Result<PayoutOutcome> {
        let request = self
            .http_client
            .post(self.url("/authorizations"))
            .json(&serde_json::json!({ "milestone_id": milestone_id, "actor": actor }));
        self.send(request, "Milestone", milestone_id).await
    }

    pub async fn authorizations(&self, status: Option<AuthorizationStatus>) -> Result<Vec<PaymentAuthorizationRequest>> {
        let request = self
            .http_client
            .get(self.url("/authorizations"))
            .query(&StatusQuery { status });
        self.send(request, "Authorization", "").await
    }

    pub async fn authorization(&self, id: Uuid) -> Result<PaymentAuthorizationRequest> {
        let request = self.http_client.get(self.url(&format!("/authorizations/{}", id)));
        self.send(request, "Authorization", id).await
    }

    pub async fn authorization_history(&self, id: Uuid) -> Result<EntityHistory> {
        let request = self
            .http_client
            .get(self.url(&format!("/authorizations/{}/history", id)));
        self.send(request, "Authorization", id).await
    }

    pub async fn approve(&self, id: Uuid, actor: &str, reason: Option<&str>) -> Result<PayoutOutcome> {
        let request = self
            .http_client
            .post(self.url(&format!("/authorizations/{}/approve", id)))
            .json(&serde_json::json!({ "actor": actor, "reason": reason }));
        self.send(request, "Authorization", id).await
    }

    pub async fn reject(&self, id: Uuid, actor: &str, reason: &str) -> Result<PaymentAuthorizationRequest> {
        let request = self
            .http_client
            .post(self.url(&format!("/authorizations/{}/reject", id)))
            .json(&serde_json::json!({ "actor": actor, "reason": reason }));
        self.send(request, "Authorization", id).await
    }

    /// Approve many requests. Failures are reported per item.
    pub async fn bulk_approve(&self, request_ids: &[Uuid], actor: &str) -> Result<BulkApprovalReport> {
        let request = self
            .http_client
            .post(self.url("/authorizations/bulk-approve"))
            .json(&serde_json::json!({ "request_ids": request_ids, "actor": actor }));
        self.send(request, "Authorization", "").await
    }

    pub async fn create_time_lock(&self, id: Uuid, cooldown_secs: i64, actor: &str) -> Result<LockedRequest> {
        let request = self
            .http_client
            .post(self.url(&format!("/authorizations/{}/time-lock", id)))
            .json(&serde_json::json!({ "cooldown_secs": cooldown_secs, "actor": actor }));
        self.send(request, "Authorization", id).await
    }

    /// The execution started for a request, if any.
    pub async fn authorization_execution(&self, id: Uuid) -> Result<PaymentExecution> {
        let request = self
            .http_client
            .get(self.url(&format!("/authorizations/{}/execution", id)));
        self.send(request, "Execution for request", id).await
    }

    // Time-locks

    pub async fn time_lock(&self, id: Uuid) -> Result<TimeLock> {
        let request = self.http_client.get(self.url(&format!("/time-locks/{}", id)));
        self.send(request, "TimeLock", id).await
    }

    pub async fn release_early(&self, id: Uuid, actor: &str, reason: &str) -> Result<EarlyRelease> {
        let request = self
            .http_client
            .post(self.url(&format!("/time-locks/{}/release", id)))
            .json(&serde_json::json!({ "actor": actor, "reason": reason }));
        self.send(request, "TimeLock", id).await
    }

    pub async fn cancel_time_lock(&self, id: Uuid, actor: &str) -> Result<TimeLock> {
        let request = self
            .http_client
            .post(self.url(&format!("/time-locks/{}/cancel", id)))
            .json(&serde_json::json!({ "actor": actor }));
        self.send(request, "TimeLock", id).await
    }

    // Executions

    /// Execute an authorized request. Repeated calls return the same execution.
    pub async fn execute(&self, request_id: Uuid) -> Result<PaymentExecution> {
        let request = self
            .http_client
            .post(self.url("/executions"))
            .json(&serde_json::json!({ "request_id": request_id }));
        self.send(request, "Authorization", request_id).await
    }

    pub async fn bulk_execute(&self, request_ids: &[Uuid]) -> Result<BulkExecutionReport> {
        let request = self
            .http_client
            .post(self.url("/executions/bulk"))
            .json(&serde_json::json!({ "request_ids": request_ids }));
        self.send(request, "Authorization", "").await
    }

    pub async fn execution(&self, id: Uuid) -> Result<PaymentExecution> {
        let request = self.http_client.get(self.url(&format!("/executions/{}", id)));
        self.send(request, "Execution", id).await
    }

    pub async fn execution_history(&self, id: Uuid) -> Result<EntityHistory> {
        let request = self.http_client.get(self.url(&format!("/executions/{}/history", id)));
        self.send(request, "Execution", id).await
    }

    pub async fn execution_trace(&self, id: Uuid) -> Result<TraceExport> {
        let request = self.http_client.get(self.url(&format!("/executions/{}/trace", id)));
        self.send(request, "Execution", id).await
    }

    pub async fn retry_execution(&self, id: Uuid) -> Result<PaymentExecution> {
        let request = self.http_client.post(self.url(&format!("/executions/{}/retry", id)));
        self.send(request, "Execution", id).await
    }

    pub async fn redrive(&self, id: Uuid, actor: &str) -> Result<PaymentExecution> {
        let request = self
            .http_client
            .post(self.url(&format!("/executions/{}/redrive", id)))
            .json(&serde_json::json!({ "actor": actor }));
        self.send(request, "Execution", id).await
    }

    pub async fn cancel_execution(&self, id: Uuid, actor: &str, reason: &str) -> Result<PaymentExecution> {
        let request = self
            .http_client
            .post(self.url(&format!("/executions/{}/cancel", id)))
            .json(&serde_json::json!({ "actor": actor, "reason": reason }));
        self.send(request, "Execution", id).await
    }

    pub async fn dead_letters(&self, limit: usize) -> Result<Vec<PaymentExecution>> {
        let request = self
            .http_client
            .get(self.url("/executions/dead-letters"))
            .query(&[("limit", limit)]);
        self.send(request, "Execution", "").await
    }

    // Events

    /// Recent events, oldest first.
    pub async fn recent_events(
        &self,
        event_type: Option<EventType>,
        subject: Option<Uuid>,
        limit: usize,
    ) -> Result<Vec<EscrowEvent>> {
        let request = self.http_client.get(self.url("/events")).query(&EventQuery {
            event_type,
            subject,
            limit,
        });
        self.send(request, "Event", "").await
    }
}

/// Map a non-success response onto the client error type.
fn error_from_response(status: StatusCode, body: &str, resource: &str, id: &str) -> TrancheError {
    let message = serde_json::from_str::<RemoteError>(body)
        .map(|e| e.error)
        .unwrap_or_else(|_| body.to_string());

    match status {
        StatusCode::NOT_FOUND => TrancheError::not_found(resource, id),
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => TrancheError::validation(message),
        StatusCode::SERVICE_UNAVAILABLE => TrancheError::ConnectionError(message),
        _ => TrancheError::Internal(format!("{} {}", status, message)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_names_resource() {
        let err = error_from_response(StatusCode::NOT_FOUND, "", "Milestone", "abc");
        match err {
            TrancheError::NotFound { resource_type, id } => {
                assert_eq!(resource_type, "Milestone");
                assert_eq!(id, "abc");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_validation_keeps_remote_message() {
        let body = r#"{"error":"Validation failed: reason too short","category":"validation"}"#;
        let err = error_from_response(StatusCode::BAD_REQUEST, body, "Authorization", "x");
        assert!(matches!(err, TrancheError::Validation { ref message } if message.contains("reason too short")));

        let err = error_from_response(StatusCode::UNPROCESSABLE_ENTITY, "not json", "Contract", "");
        assert!(matches!(err, TrancheError::Validation { ref message } if message == "not json"));
    }

    #[test]
    fn test_other_statuses() {
        let err = error_from_response(StatusCode::SERVICE_UNAVAILABLE, "{}", "Execution", "x");
        assert!(matches!(err, TrancheError::ConnectionError(_)));

        let body = r#"{"error":"Payment request blocked","category":"policy"}"#;
        let err = error_from_response(StatusCode::CONFLICT, body, "Authorization", "x");
        assert!(matches!(err, TrancheError::Internal(ref m) if m.contains("409") && m.contains("blocked")));
    }

    #[test]
    fn test_new_milestone_serializes_for_node() {
        let a = NewMilestone::new("design", Utc::now());
        let b = NewMilestone::new("build", Utc::now()).depends_on(a.id.unwrap_or_default()).estimate_secs(3600);
        let value = serde_json::to_value(&b).unwrap();
        assert_eq!(value["depends_on"][0], serde_json::json!(a.id));
        assert_eq!(value["estimated_duration_secs"], 3600);
    }

    #[tokio::test]
    async fn test_silent_node_times_out() {
        // Accepts connections but never answers.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hold = tokio::spawn(async move {
            let mut open = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                open.push(socket);
            }
        });

        let result =
            TrancheClient::connect_with_timeout(&format!("http://{}", addr), Duration::from_millis(100)).await;
        hold.abort();
        match result {
            Err(TrancheError::Timeout { duration_ms, .. }) => assert_eq!(duration_ms, 100),
            other => panic!("expected timeout, got {:?}", other.err()),
        }
    }

    #[tokio::test]
    async fn test_connect_fails_without_node() {
        let result = TrancheClient::connect("http://127.0.0.1:1").await;
        assert!(matches!(result, Err(TrancheError::ConnectionError(_))));
    }
}
