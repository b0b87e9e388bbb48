use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::OrchestrationError;
use crate::ledger::AuditEvent;
use crate::model::ContextMap;
use crate::orchestrator::{Orchestrator, SubmitRequest};

pub const AUTH_TOKEN_ENV: &str = "CHANGEGATE_SERVER_AUTH_TOKEN";

#[derive(Clone)]
pub struct ServerState {
    pub orchestrator: Arc<Orchestrator>,
    pub profile: String,
    pub auth_token: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ServerHealthResponse {
    pub status: &'static str,
    pub profile: String,
    pub schema_version: i64,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DecisionRequest {
    pub principal: String,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReviseRequest {
    pub actor: String,
    #[serde(default)]
    pub context: ContextMap,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ControlRequest {
    pub actor: String,
}

#[derive(Debug, Serialize)]
pub struct AuditResponse {
    pub task_id: String,
    pub events: Vec<AuditEvent>,
}

pub type ApiError = (StatusCode, Json<Value>);

pub fn api_error(status: StatusCode, code: &str, message: impl Into<String>) -> ApiError {
    (status, Json(json!({ "error": message.into(), "code": code })))
}

pub fn status_for(err: &OrchestrationError) -> StatusCode {
    match err {
        OrchestrationError::NotFound { .. } => StatusCode::NOT_FOUND,
        OrchestrationError::InvalidTransition { .. }
        | OrchestrationError::ConcurrentModification { .. }
        | OrchestrationError::ActivePlanExists { .. }
        | OrchestrationError::ActiveExecutionExists { .. }
        | OrchestrationError::ApprovalTimeout { .. } => StatusCode::CONFLICT,
        OrchestrationError::AmbiguousIntent { .. }
        | OrchestrationError::NoMatchingAgent { .. }
        | OrchestrationError::UnauthorizedCapability { .. }
        | OrchestrationError::ValidationViolation { .. }
        | OrchestrationError::PolicyDenied { .. }
        | OrchestrationError::QualityBelowThreshold { .. }
        | OrchestrationError::InvalidInput(_) => StatusCode::UNPROCESSABLE_ENTITY,
        OrchestrationError::IneligibleApprover { .. } => StatusCode::FORBIDDEN,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Renders a domain error as `{error, code}` under its mapped status.
pub struct ServerError(pub OrchestrationError);

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() {
            tracing::error!(code = self.0.code(), error = %self.0, "request failed");
        } else {
            tracing::debug!(code = self.0.code(), error = %self.0, "request rejected");
        }
        let message = crate::error::redact_sqlite_urls(&self.0.to_string());
        api_error(status, self.0.code(), message).into_response()
    }
}

pub fn check_server_auth(state: &ServerState, headers: &HeaderMap) -> Result<(), ApiError> {
    let Some(expected_token) = state.auth_token.as_deref() else {
        return Ok(());
    };

    let provided_token = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or_default()
        .trim();

    if provided_token.is_empty() || provided_token != expected_token {
        return Err(api_error(
            StatusCode::UNAUTHORIZED,
            "unauthorized",
            "missing or invalid Authorization bearer token",
        ));
    }
    Ok(())
}

fn authorize(state: &ServerState, headers: &HeaderMap) -> std::result::Result<(), Response> {
    check_server_auth(state, headers).map_err(IntoResponse::into_response)
}

fn ok_json<T: Serialize>(status: StatusCode, body: T) -> Response {
    (status, Json(body)).into_response()
}

pub async fn handle_health(State(state): State<Arc<ServerState>>) -> Response {
    match state.orchestrator.store().schema_version().await {
        Ok(schema_version) => ok_json(
            StatusCode::OK,
            ServerHealthResponse {
                status: "ok",
                profile: state.profile.clone(),
                schema_version,
            },
        ),
        Err(err) => ServerError(err).into_response(),
    }
}

pub async fn handle_submit(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Json(request): Json<SubmitRequest>,
) -> Response {
    if let Err(denied) = authorize(&state, &headers) {
        return denied;
    }
    match state.orchestrator.submit(request).await {
        Ok(submission) if !submission.violations.is_empty() => {
            let message = submission
                .task
                .status_reason
                .clone()
                .unwrap_or_else(|| "plan failed validation".to_string());
            ok_json(
                StatusCode::UNPROCESSABLE_ENTITY,
                json!({
                    "error": message,
                    "code": "validation_violation",
                    "submission": submission,
                }),
            )
        }
        Ok(submission) if submission.replayed => ok_json(StatusCode::OK, submission),
        Ok(submission) => ok_json(StatusCode::CREATED, submission),
        Err(err) => ServerError(err).into_response(),
    }
}

pub async fn handle_task(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Path(task_id): Path<String>,
) -> Response {
    if let Err(denied) = authorize(&state, &headers) {
        return denied;
    }
    match state.orchestrator.task_view(&task_id).await {
        Ok(view) => ok_json(StatusCode::OK, view),
        Err(err) => ServerError(err).into_response(),
    }
}

pub async fn handle_audit(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Path(task_id): Path<String>,
) -> Response {
    if let Err(denied) = authorize(&state, &headers) {
        return denied;
    }
    match state.orchestrator.trace(&task_id).await {
        Ok(events) => ok_json(StatusCode::OK, AuditResponse { task_id, events }),
        Err(err) => ServerError(err).into_response(),
    }
}

#[derive(Debug, Clone, Copy)]
enum Decision {
    Approve,
    Reject,
    Modify,
}

async fn decide(state: Arc<ServerState>, headers: HeaderMap, task_id: String, request: DecisionRequest, decision: Decision) -> Response {
    if let Err(denied) = authorize(&state, &headers) {
        return denied;
    }
    let orchestrator = &state.orchestrator;
    let result = match decision {
        Decision::Approve => orchestrator.approve(&task_id, &request.principal, request.notes).await,
        Decision::Reject => orchestrator.reject(&task_id, &request.principal, request.notes).await,
        Decision::Modify => {
            orchestrator
                .request_modification(&task_id, &request.principal, request.notes)
                .await
        }
    };
    match result {
        Ok(outcome) => ok_json(StatusCode::OK, outcome),
        Err(err) => ServerError(err).into_response(),
    }
}

pub async fn handle_approve(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Path(task_id): Path<String>,
    Json(request): Json<DecisionRequest>,
) -> Response {
    decide(state, headers, task_id, request, Decision::Approve).await
}

pub async fn handle_reject(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Path(task_id): Path<String>,
    Json(request): Json<DecisionRequest>,
) -> Response {
    decide(state, headers, task_id, request, Decision::Reject).await
}

pub async fn handle_modify(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Path(task_id): Path<String>,
    Json(request): Json<DecisionRequest>,
) -> Response {
    decide(state, headers, task_id, request, Decision::Modify).await
}

pub async fn handle_revise(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Path(task_id): Path<String>,
    Json(request): Json<ReviseRequest>,
) -> Response {
    if let Err(denied) = authorize(&state, &headers) {
        return denied;
    }
    match state
        .orchestrator
        .revise(&task_id, &request.actor, request.context)
        .await
    {
        Ok(submission) => ok_json(StatusCode::OK, submission),
        Err(err) => ServerError(err).into_response(),
    }
}

pub async fn handle_execution(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Path(execution_id): Path<String>,
) -> Response {
    if let Err(denied) = authorize(&state, &headers) {
        return denied;
    }
    match state.orchestrator.execution_view(&execution_id).await {
        Ok(view) => ok_json(StatusCode::OK, view),
        Err(err) => ServerError(err).into_response(),
    }
}

#[derive(Debug, Clone, Copy)]
enum Control {
    Pause,
    Resume,
    Cancel,
}

async fn control(state: Arc<ServerState>, headers: HeaderMap, execution_id: String, request: ControlRequest, action: Control) -> Response {
    if let Err(denied) = authorize(&state, &headers) {
        return denied;
    }
    let orchestrator = &state.orchestrator;
    let result = match action {
        Control::Pause => orchestrator.pause(&execution_id, &request.actor).await,
        Control::Resume => orchestrator.resume(&execution_id, &request.actor).await,
        Control::Cancel => orchestrator.cancel(&execution_id, &request.actor).await,
    };
    match result {
        Ok(view) => ok_json(StatusCode::OK, view),
        Err(err) => ServerError(err).into_response(),
    }
}

pub async fn handle_pause(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Path(execution_id): Path<String>,
    Json(request): Json<ControlRequest>,
) -> Response {
    control(state, headers, execution_id, request, Control::Pause).await
}

pub async fn handle_resume(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Path(execution_id): Path<String>,
    Json(request): Json<ControlRequest>,
) -> Response {
    control(state, headers, execution_id, request, Control::Resume).await
}

pub async fn handle_cancel(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Path(execution_id): Path<String>,
    Json(request): Json<ControlRequest>,
) -> Response {
    control(state, headers, execution_id, request, Control::Cancel).await
}

pub async fn handle_advance(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Path(execution_id): Path<String>,
) -> Response {
    if let Err(denied) = authorize(&state, &headers) {
        return denied;
    }
    match state.orchestrator.advance(&execution_id).await {
        Ok(view) => ok_json(StatusCode::OK, view),
        Err(err) => ServerError(err).into_response(),
    }
}

pub async fn handle_approve_phase(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Path(execution_id): Path<String>,
    Json(request): Json<DecisionRequest>,
) -> Response {
    if let Err(denied) = authorize(&state, &headers) {
        return denied;
    }
    match state
        .orchestrator
        .approve_phase(&execution_id, &request.principal, request.notes)
        .await
    {
        Ok(view) => ok_json(StatusCode::OK, view),
        Err(err) => ServerError(err).into_response(),
    }
}

pub fn build_server_router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/healthz", get(handle_health))
        .route("/v1/tasks", post(handle_submit))
        .route("/v1/tasks/{id}", get(handle_task))
        .route("/v1/tasks/{id}/audit", get(handle_audit))
        .route("/v1/tasks/{id}/approve", post(handle_approve))
        .route("/v1/tasks/{id}/reject", post(handle_reject))
        .route("/v1/tasks/{id}/modify", post(handle_modify))
        .route("/v1/tasks/{id}/revise", post(handle_revise))
        .route("/v1/executions/{id}", get(handle_execution))
        .route("/v1/executions/{id}/pause", post(handle_pause))
        .route("/v1/executions/{id}/resume", post(handle_resume))
        .route("/v1/executions/{id}/cancel", post(handle_cancel))
        .route("/v1/executions/{id}/advance", post(handle_advance))
        .route("/v1/executions/{id}/approve-phase", post(handle_approve_phase))
        .with_state(state)
}

/// Runs `sweep` every `interval` until `stop` flips to true.
pub fn spawn_sweeper(orchestrator: Arc<Orchestrator>, interval: Duration, mut stop: watch::Receiver<bool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                    continue;
                }
            }
            match orchestrator.sweep().await {
                Ok(report) => {
                    if !report.expired.is_empty() || !report.advanced.is_empty() || !report.errors.is_empty() {
                        tracing::info!(
                            expired = report.expired.len(),
                            advanced = report.advanced.len(),
                            skipped_busy = report.skipped_busy,
                            errors = report.errors.len(),
                            "sweep finished"
                        );
                    }
                    for error in &report.errors {
                        tracing::warn!(error = %error, "sweep item failed");
                    }
                }
                Err(err) => tracing::warn!(error = %err, "sweep failed"),
            }
        }
        tracing::debug!("sweeper stopped");
    })
}

pub fn auth_token_from_env() -> Option<String> {
    std::env::var(AUTH_TOKEN_ENV)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub async fn run_server(orchestrator: Orchestrator, profile: String, host: String, port: u16, sweep_interval_secs: u64) -> Result<()> {
    let addr = format!("{host}:{port}")
        .parse::<SocketAddr>()
        .with_context(|| format!("invalid server bind address '{}:{}'", host, port))?;
    let orchestrator = Arc::new(orchestrator);
    let state = Arc::new(ServerState {
        orchestrator: Arc::clone(&orchestrator),
        profile,
        auth_token: auth_token_from_env(),
    });
    if state.auth_token.is_none() {
        tracing::warn!("{AUTH_TOKEN_ENV} is not set; the API accepts unauthenticated requests");
    }

    let (stop_tx, stop_rx) = watch::channel(false);
    let sweeper = spawn_sweeper(
        Arc::clone(&orchestrator),
        Duration::from_secs(sweep_interval_secs.max(1)),
        stop_rx,
    );

    println!(
        "Server listening on http://{} (health: /healthz, tasks: /v1/tasks, executions: /v1/executions/{{id}})",
        addr
    );

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("failed to bind server listener")?;
    let served = axum::serve(listener, build_server_router(state))
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            let _ = stop_tx.send(true);
        })
        .await
        .context("server runtime failed");
    if let Err(err) = sweeper.await {
        tracing::warn!(error = %err, "sweeper task ended abnormally");
    }
    served
}

pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { println!("\nReceived Ctrl+C, shutting down gracefully..."); }
        _ = terminate => { println!("\nReceived SIGTERM, shutting down gracefully..."); }
    }
}
