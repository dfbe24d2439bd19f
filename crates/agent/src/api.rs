//! HTTP API for health checks, Prometheus metrics and operator queries

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use guardian_lib::{
    actions::ActionController,
    health::{ComponentStatus, HealthRegistry},
    ledger::Ledger,
    observability::AgentMetrics,
    PolicyState, WorkloadIdentity,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info};

const DEFAULT_ACTIONS_LIMIT: usize = 50;
const MAX_ACTIONS_LIMIT: usize = 1_000;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub health_registry: HealthRegistry,
    pub metrics: AgentMetrics,
    pub controller: ActionController,
    pub ledger: Ledger,
}

impl AppState {
    pub fn new(
        health_registry: HealthRegistry,
        metrics: AgentMetrics,
        controller: ActionController,
        ledger: Ledger,
    ) -> Self {
        Self {
            health_registry,
            metrics,
            controller,
            ledger,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ActionsQuery {
    pub namespace: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
pub struct NamespaceQuery {
    pub namespace: Option<String>,
}

/// Policy state of one node-local identity
#[derive(Debug, Serialize, Deserialize)]
pub struct PolicyEntry {
    pub workload: WorkloadIdentity,
    pub state: PolicyState,
}

/// Body of a successful failure-counter reset
#[derive(Debug, Serialize, Deserialize)]
pub struct ResetResponse {
    pub namespace: String,
    pub name: String,
    pub cleared_failures: u32,
}

fn not_found(namespace: &str, name: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "error": format!("workload {}/{} is not known to this agent", namespace, name) })),
    )
        .into_response()
}

/// Health check response - returns 200 unless a component is unhealthy
async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.health_registry.health().await;

    let status_code = match health.status {
        ComponentStatus::Healthy => StatusCode::OK,
        ComponentStatus::Degraded => StatusCode::OK, // Still operational
        ComponentStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status_code, Json(health))
}

/// Readiness check response - returns 200 once the first tick completed
async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let readiness = state.health_registry.readiness().await;

    let status_code = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(readiness))
}

/// Prometheus metrics endpoint
async fn metrics(State(state): State<Arc<AppState>>) -> Response {
    match state.metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "Failed to encode metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn ledger_summary(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.ledger.summary())
}

async fn list_actions(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ActionsQuery>,
) -> impl IntoResponse {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_ACTIONS_LIMIT)
        .min(MAX_ACTIONS_LIMIT);
    let records = state
        .controller
        .action_log()
        .recent(query.namespace.as_deref(), limit)
        .await;
    Json(records)
}

async fn list_estimates(
    State(state): State<Arc<AppState>>,
    Query(query): Query<NamespaceQuery>,
) -> impl IntoResponse {
    Json(state.ledger.latest_estimates(query.namespace.as_deref()))
}

async fn workload_policy(
    State(state): State<Arc<AppState>>,
    Path((namespace, name)): Path<(String, String)>,
) -> Response {
    let states = state.controller.policy_states_for(&namespace, &name).await;
    if states.is_empty() {
        return not_found(&namespace, &name);
    }

    let entries: Vec<PolicyEntry> = states
        .into_iter()
        .map(|(workload, state)| PolicyEntry { workload, state })
        .collect();
    Json(entries).into_response()
}

async fn reset_workload(
    State(state): State<Arc<AppState>>,
    Path((namespace, name)): Path<(String, String)>,
) -> Response {
    match state.controller.reset_failures(&namespace, &name).await {
        Some(cleared_failures) => Json(ResetResponse {
            namespace,
            name,
            cleared_failures,
        })
        .into_response(),
        None => not_found(&namespace, &name),
    }
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route("/api/v1/ledger", get(ledger_summary))
        .route("/api/v1/actions", get(list_actions))
        .route("/api/v1/estimates", get(list_estimates))
        .route(
            "/api/v1/workloads/:namespace/:name/policy",
            get(workload_policy),
        )
        .route(
            "/api/v1/workloads/:namespace/:name/reset",
            post(reset_workload),
        )
        .with_state(state)
}

/// Start the API server, stopping when shutdown is signaled
pub async fn serve(
    port: u16,
    state: Arc<AppState>,
    mut shutdown: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    let app = create_router(state);

    let addr = format!("0.0.0.0:{}", port);
    info!(addr = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await?;

    Ok(())
}
