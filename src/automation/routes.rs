//! REST endpoints for the automation control surface.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post, put},
};
use serde::Deserialize;
use serde_json::{Value, json};
use tower_http::cors::CorsLayer;
use tracing::error;
use uuid::Uuid;

use super::control::{AutomationControl, AutomationInput, ExecuteConfig};
use super::coordinator::StopOutcome;
use crate::error::{AutomationError, Error};

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub control: Arc<AutomationControl>,
}

/// Build the Axum router with the automation and scheduler routes.
pub fn automation_routes(control: Arc<AutomationControl>) -> Router {
    let state = AppState { control };

    Router::new()
        .route("/health", get(health))
        .route("/api/automations", get(list_automations).post(create_automation))
        .route(
            "/api/automations/{id}",
            put(update_automation).delete(delete_automation),
        )
        .route("/api/automations/{id}/execute", post(execute_automation))
        .route("/api/automations/{id}/stop", post(stop_automation))
        .route("/api/automations/{id}/running", get(automation_running))
        .route("/api/automations/{id}/history", get(automation_history))
        .route("/api/scheduler/status", get(scheduler_status))
        .route("/api/scheduler/max-concurrent", put(set_max_concurrent))
        .route("/api/scheduler/reload", post(reload_schedules))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ── Helpers ─────────────────────────────────────────────────────────────

type ApiResponse = (StatusCode, Json<Value>);

fn parse_id(id: &str) -> Result<Uuid, ApiResponse> {
    Uuid::parse_str(id).map_err(|_| {
        (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "Invalid automation ID"})),
        )
    })
}

fn error_response(e: Error) -> ApiResponse {
    let status = match &e {
        Error::Automation(AutomationError::NotFound { .. })
        | Error::Automation(AutomationError::RunNotFound { .. }) => StatusCode::NOT_FOUND,
        Error::Automation(AutomationError::Validation { .. }) => StatusCode::BAD_REQUEST,
        _ => {
            error!(error = %e, "Automation request failed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, Json(json!({"error": e.to_string()})))
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "ai-automations"
    }))
}

// ── Automations ─────────────────────────────────────────────────────────

async fn list_automations(State(state): State<AppState>) -> impl IntoResponse {
    match state.control.list_automations().await {
        Ok(automations) => (StatusCode::OK, Json(json!(automations))),
        Err(e) => error_response(e),
    }
}

async fn create_automation(
    State(state): State<AppState>,
    Json(input): Json<AutomationInput>,
) -> impl IntoResponse {
    match state.control.create_automation(input).await {
        Ok(definition) => (StatusCode::CREATED, Json(json!(definition))),
        Err(e) => error_response(e),
    }
}

async fn update_automation(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(input): Json<AutomationInput>,
) -> impl IntoResponse {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.control.update_automation(id, input).await {
        Ok(definition) => (StatusCode::OK, Json(json!(definition))),
        Err(e) => error_response(e),
    }
}

async fn delete_automation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.control.delete_automation(id).await {
        Ok(()) => (StatusCode::OK, Json(json!({"status": "deleted", "id": id}))),
        Err(e) => error_response(e),
    }
}

async fn execute_automation(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(config): Json<ExecuteConfig>,
) -> impl IntoResponse {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.control.execute(id, config).await {
        Ok(response) => (StatusCode::OK, Json(json!(response))),
        Err(e) => error_response(e),
    }
}

async fn stop_automation(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.control.stop(id).await {
        Ok(outcome) => {
            let body = match outcome {
                StopOutcome::Cancelled => json!({"status": "cancelled"}),
                StopOutcome::Dequeued => json!({"status": "dequeued"}),
                StopOutcome::Finished(run_status) => {
                    json!({"status": "finished", "run_status": run_status})
                }
                StopOutcome::NotRunning => json!({"status": "not_running"}),
            };
            (StatusCode::OK, Json(body))
        }
        Err(e) => error_response(e),
    }
}

async fn automation_running(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match parse_id(&id) {
        Ok(id) => (
            StatusCode::OK,
            Json(json!({"running": state.control.is_running(id)})),
        ),
        Err(resp) => resp,
    }
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    limit: Option<usize>,
}

async fn automation_history(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> impl IntoResponse {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.control.get_history(id, query.limit).await {
        Ok(runs) => (StatusCode::OK, Json(json!(runs))),
        Err(e) => error_response(e),
    }
}

// ── Scheduler ───────────────────────────────────────────────────────────

async fn scheduler_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!(state.control.get_scheduler_status()))
}

#[derive(Debug, Deserialize)]
struct MaxConcurrentRequest {
    max_concurrent: usize,
}

async fn set_max_concurrent(
    State(state): State<AppState>,
    Json(body): Json<MaxConcurrentRequest>,
) -> impl IntoResponse {
    match state.control.set_max_concurrent(body.max_concurrent) {
        Ok(()) => (
            StatusCode::OK,
            Json(json!(state.control.get_scheduler_status())),
        ),
        Err(e) => error_response(e),
    }
}

async fn reload_schedules(State(state): State<AppState>) -> impl IntoResponse {
    match state.control.reload_schedules().await {
        Ok(report) => (StatusCode::OK, Json(json!(report))),
        Err(e) => error_response(e),
    }
}
