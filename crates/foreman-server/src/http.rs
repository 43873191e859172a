use std::convert::Infallible;
use std::net::SocketAddr;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::Stream;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tower_http::cors::CorsLayer;

use foreman_core::{AdmissionOutcome, RunError, RunRequest};
use foreman_types::{EngineEvent, RunScope};

use crate::AppState;

pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "foreman server listening");
    axum::serve(listener, app).await?;
    Ok(())
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/run", post(start_run))
        .route("/runs", get(list_runs))
        .route("/run/{id}", get(get_run))
        .route("/run/{id}/cancel", post(cancel_run))
        .route("/run/{id}/invocations", get(run_invocations))
        .route("/event", get(events))
        .route("/approvals", get(list_approvals))
        .route("/approval/{id}/reply", post(reply_approval))
        .route("/subagents", get(subagent_status))
        .route("/admission/reserve", post(admission_reserve))
        .route("/admission/reconcile", post(admission_reconcile))
        .route("/config/limits", get(get_limits).patch(patch_limits))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

#[derive(Debug, Deserialize)]
struct StartRunRequest {
    #[serde(rename = "actorID")]
    actor_id: String,
    #[serde(default)]
    scope: Option<RunScope>,
    request: String,
    #[serde(default, rename = "providerID")]
    provider_id: Option<String>,
    #[serde(default, rename = "modelID")]
    model_id: Option<String>,
}

async fn start_run(
    State(state): State<AppState>,
    Json(req): Json<StartRunRequest>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let request = RunRequest {
        actor_id: req.actor_id,
        scope: req.scope.unwrap_or(RunScope::Project),
        request: req.request,
        provider_id: req.provider_id,
        model_id: req.model_id,
    };
    match state.orchestrator.start(request).await {
        Ok(handle) => {
            let orchestrator = state.orchestrator.clone();
            let drive_handle = handle.clone();
            tokio::spawn(async move {
                if let Err(err) = orchestrator.drive(&drive_handle).await {
                    tracing::error!(run_id = %drive_handle.run_id, error = %err, "run drive failed");
                }
            });
            Ok(Json(json!({
                "runID": handle.run_id,
                "reservationID": handle.reservation_id,
                "attachEventStream": format!("/event?runID={}", handle.run_id),
            })))
        }
        Err(err) => Err(run_error_response(err)),
    }
}

fn run_error_response(err: RunError) -> (StatusCode, Json<Value>) {
    let status = match &err {
        RunError::ActorBusy { .. } => StatusCode::CONFLICT,
        RunError::AdmissionDenied { .. } => StatusCode::PAYMENT_REQUIRED,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(json!({
            "error": err.to_string(),
            "code": err.error_code(),
        })),
    )
}

async fn list_runs(State(state): State<AppState>) -> Json<Value> {
    let runs = state.storage.list_runs().await;
    Json(json!({"runs": runs}))
}

async fn get_run(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    match state.storage.get_run(&id).await {
        Some(run) => Ok(Json(json!({"run": run}))),
        None => Err(StatusCode::NOT_FOUND),
    }
}

async fn cancel_run(State(state): State<AppState>, Path(id): Path<String>) -> Json<Value> {
    let cancelled = state.orchestrator.cancel(&id).await;
    Json(json!({"runID": id, "cancelled": cancelled}))
}

async fn run_invocations(State(state): State<AppState>, Path(id): Path<String>) -> Json<Value> {
    let invocations = state.storage.invocations_for_run(&id).await;
    Json(json!({"runID": id, "invocations": invocations}))
}

#[derive(Debug, Default, Deserialize)]
struct EventFilterQuery {
    #[serde(rename = "runID")]
    run_id: Option<String>,
}

async fn events(
    State(state): State<AppState>,
    Query(filter): Query<EventFilterQuery>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.event_bus.subscribe();
    let stream = BroadcastStream::new(rx).filter_map(move |item| match item {
        Ok(event) => {
            if !event_matches_filter(&event, &filter) {
                return None;
            }
            let data = serde_json::to_string(&event.properties).unwrap_or_else(|_| "{}".to_string());
            Some(Ok(Event::default().event(event.event_type).data(data)))
        }
        // A lagged receiver drops the missed events and keeps streaming.
        Err(BroadcastStreamRecvError::Lagged(_)) => None,
    });
    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(10)))
}

fn event_matches_filter(event: &EngineEvent, filter: &EventFilterQuery) -> bool {
    let Some(run_id) = filter.run_id.as_deref() else {
        return true;
    };
    event
        .properties
        .get("runID")
        .or_else(|| event.properties.get("runId"))
        .and_then(|v| v.as_str())
        .map(|value| value == run_id)
        .unwrap_or(false)
}

async fn list_approvals(State(state): State<AppState>) -> Json<Value> {
    let approvals = state.orchestrator.approvals().list().await;
    Json(json!({"approvals": approvals}))
}

#[derive(Debug, Deserialize)]
struct ApprovalReply {
    approve: bool,
}

async fn reply_approval(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(reply): Json<ApprovalReply>,
) -> Result<Json<Value>, StatusCode> {
    if state.orchestrator.approvals().reply(&id, reply.approve).await {
        Ok(Json(json!({"requestID": id, "ok": true})))
    } else {
        Err(StatusCode::NOT_FOUND)
    }
}

#[derive(Debug, Deserialize)]
struct SubagentQuery {
    actor: String,
}

async fn subagent_status(
    State(state): State<AppState>,
    Query(query): Query<SubagentQuery>,
) -> Json<Value> {
    let status = state.orchestrator.subagents().status(&query.actor).await;
    Json(json!({
        "actorID": query.actor,
        "running": status.running,
        "queued": status.queued,
        "completed": status.completed,
    }))
}

#[derive(Debug, Deserialize)]
struct ReserveRequest {
    #[serde(rename = "runID")]
    run_id: String,
    #[serde(rename = "actorID")]
    actor_id: String,
    #[serde(rename = "estimatedInputTokens")]
    estimated_input_tokens: u64,
    #[serde(rename = "estimatedOutputTokens")]
    estimated_output_tokens: u64,
    #[serde(default)]
    scope: Option<RunScope>,
}

async fn admission_reserve(
    State(state): State<AppState>,
    Json(req): Json<ReserveRequest>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let outcome = state
        .orchestrator
        .ledger()
        .reserve(
            &req.run_id,
            &req.actor_id,
            req.estimated_input_tokens,
            req.estimated_output_tokens,
            req.scope.unwrap_or(RunScope::Project),
        )
        .await;
    match outcome {
        AdmissionOutcome::Approved {
            reservation_id,
            credits_reserved,
        } => Ok(Json(json!({
            "approved": true,
            "reservationID": reservation_id,
            "creditsReserved": credits_reserved,
        }))),
        AdmissionOutcome::Denied { reason } => Err((
            StatusCode::PAYMENT_REQUIRED,
            Json(json!({"approved": false, "denied": true, "reason": reason})),
        )),
    }
}

#[derive(Debug, Deserialize)]
struct ReconcileRequest {
    #[serde(rename = "reservationID")]
    reservation_id: String,
    #[serde(rename = "actualCreditsUsed")]
    actual_credits_used: u64,
}

async fn admission_reconcile(
    State(state): State<AppState>,
    Json(req): Json<ReconcileRequest>,
) -> Json<Value> {
    let reconciled = state
        .orchestrator
        .ledger()
        .reconcile(&req.reservation_id, req.actual_credits_used)
        .await;
    Json(json!({"reservationID": req.reservation_id, "reconciled": reconciled}))
}

async fn get_limits(State(state): State<AppState>) -> Json<Value> {
    let limits = state.config.limits().await;
    Json(json!({"limits": limits}))
}

async fn patch_limits(State(state): State<AppState>, Json(patch): Json<Value>) -> Json<Value> {
    let effective = state
        .config
        .patch_runtime(json!({"limits": patch}))
        .await;
    Json(json!({"effective": effective}))
}
