use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;
use tokio::sync::watch;

use crate::broker::Broker;
use crate::coordination::coordinator::Role;
use crate::coordination::node::WorkerId;

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub worker_id: String,
    pub role: &'static str,
    pub checks: HealthChecks,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Serialize)]
pub struct HealthChecks {
    pub broker: CheckResult,
}

#[derive(Debug, Serialize)]
pub struct CheckResult {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl CheckResult {
    fn healthy() -> Self {
        Self {
            ok: true,
            detail: None,
        }
    }

    fn unhealthy(detail: impl Into<String>) -> Self {
        Self {
            ok: false,
            detail: Some(detail.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Shared state expected by the handler
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct HealthState {
    pub broker: Arc<dyn Broker>,
    pub role: watch::Receiver<Role>,
    pub worker_id: WorkerId,
}

async fn check_broker(broker: &dyn Broker) -> CheckResult {
    match broker.ping().await {
        Ok(()) => CheckResult::healthy(),
        Err(e) => CheckResult::unhealthy(format!("PING failed: {e:#}")),
    }
}

/// The broker is required for every duty.  A worker between roles is
/// reachable but not doing useful work.
fn aggregate_status(checks: &HealthChecks, role: Role) -> HealthStatus {
    if !checks.broker.ok {
        HealthStatus::Unhealthy
    } else if matches!(role, Role::Generator | Role::Listener) {
        HealthStatus::Ok
    } else {
        HealthStatus::Degraded
    }
}

pub async fn health_report(state: &HealthState) -> (StatusCode, HealthResponse) {
    let role = *state.role.borrow();
    let checks = HealthChecks {
        broker: check_broker(state.broker.as_ref()).await,
    };
    let status = aggregate_status(&checks, role);
    let body = HealthResponse {
        status,
        worker_id: state.worker_id.to_string(),
        role: role.as_str(),
        checks,
    };

    let http_status = match status {
        HealthStatus::Ok | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (http_status, body)
}

/// `GET /healthz` handler.  Returns 200 on Ok/Degraded, 503 on Unhealthy.
pub async fn health_handler(State(state): State<HealthState>) -> impl IntoResponse {
    let (status, body) = health_report(&state).await;
    (status, Json(body))
}
