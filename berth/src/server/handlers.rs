//! Request handlers.
//!
//! Handlers are thin: decode, call the engine, encode. Anything that probes
//! ports or processes runs on the blocking pool so the reactor stays free.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::allocation::Allocation;
use crate::engine::AllocateRequest;
use crate::error::Error;

use super::reply::ApiError;
use super::AppState;

async fn blocking<T: Send + 'static>(
    work: impl FnOnce() -> Result<T, Error> + Send + 'static,
) -> Result<T, ApiError> {
    match tokio::task::spawn_blocking(work).await {
        Ok(result) => result.map_err(ApiError),
        Err(join_error) => Err(ApiError(Error::Io(std::io::Error::other(format!(
            "engine task failed: {join_error}"
        ))))),
    }
}

/// Body of `POST /allocate`.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AllocateBody {
    /// Service type to allocate under.
    pub service_type: String,
    /// Free-form service label.
    #[serde(default)]
    pub service_name: Option<String>,
    /// Specific port to try first.
    #[serde(default)]
    pub preferred_port: Option<u16>,
    /// Caller identity.
    #[serde(default)]
    pub instance_id: Option<String>,
    /// Project path for bookkeeping.
    #[serde(default)]
    pub project_path: Option<String>,
    /// Caller process id.
    #[serde(default)]
    pub pid: Option<u32>,
    /// Plan without reserving.
    #[serde(default)]
    pub dry_run: bool,
}

/// Reply of `POST /allocate`.
#[derive(Debug, Serialize)]
pub struct AllocateReply {
    /// Always `true` on this path.
    pub success: bool,
    /// The allocated (or predicted) port.
    pub port: u16,
    /// The issued lock id; absent on dry runs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lock_id: Option<String>,
    /// Human-readable summary.
    pub message: String,
    /// Set when the service type's range was synthesized by this request.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_allocated: Option<bool>,
    /// The synthesized range, when `auto_allocated` is set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allocated_range: Option<[u16; 2]>,
    /// Set when a singleton short-circuit returned an existing allocation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub existing: Option<bool>,
    /// Holder of the existing allocation.
    #[serde(rename = "existingInstanceId", skip_serializing_if = "Option::is_none")]
    pub existing_instance_id: Option<String>,
    /// Pid of the existing holder.
    #[serde(rename = "existingPid", skip_serializing_if = "Option::is_none")]
    pub existing_pid: Option<u32>,
    /// Set on dry runs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dry_run: Option<bool>,
}

/// `POST /allocate`
pub async fn allocate(
    State(state): State<AppState>,
    Json(body): Json<AllocateBody>,
) -> Result<Json<AllocateReply>, ApiError> {
    let engine = Arc::clone(&state.engine);
    let request = AllocateRequest {
        service_type: body.service_type,
        service_name: body.service_name,
        preferred_port: body.preferred_port,
        instance_id: body.instance_id,
        project_path: body.project_path,
        pid: body.pid,
        dry_run: body.dry_run,
    };
    let outcome = blocking(move || engine.allocate(&request)).await?;

    let message = if outcome.existing {
        format!("existing singleton allocation on port {}", outcome.port)
    } else if outcome.dry_run {
        format!("port {} would be allocated", outcome.port)
    } else {
        format!("port {} allocated", outcome.port)
    };

    Ok(Json(AllocateReply {
        success: true,
        port: outcome.port.value(),
        lock_id: outcome.lock_id.map(|id| id.to_string()),
        message,
        auto_allocated: outcome.auto_allocated.then_some(true),
        allocated_range: outcome
            .allocated_range
            .map(|r| [r.min().value(), r.max().value()]),
        existing: outcome.existing.then_some(true),
        existing_instance_id: outcome.existing_instance_id,
        existing_pid: outcome.existing_pid,
        dry_run: outcome.dry_run.then_some(true),
    }))
}

/// `DELETE /allocate/{lock_id}`
pub async fn release(
    State(state): State<AppState>,
    Path(lock_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let engine = Arc::clone(&state.engine);
    let port = blocking(move || engine.release(&lock_id)).await?;
    Ok(Json(json!({
        "success": true,
        "port": port.value(),
        "message": format!("port {port} released"),
    })))
}

/// Reply of `GET /check/{port}`.
#[derive(Debug, Serialize)]
pub struct CheckReply {
    /// The checked port.
    pub port: u16,
    /// Free in the table and free per the OS probe.
    pub available: bool,
    /// The daemon allocation holding the port, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allocated_to: Option<Allocation>,
    /// External occupant details, if the OS reports any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_usage: Option<crate::probe::SystemUsage>,
}

/// `GET /check/{port}`
pub async fn check(
    State(state): State<AppState>,
    Path(port): Path<u16>,
) -> Result<Json<CheckReply>, ApiError> {
    let engine = Arc::clone(&state.engine);
    let status = blocking(move || engine.check(port)).await?;
    Ok(Json(CheckReply {
        port: status.port.value(),
        available: status.available,
        allocated_to: status.allocated_to,
        system_usage: status.system_usage,
    }))
}

/// Query of `GET /scan`.
#[derive(Debug, Deserialize)]
pub struct ScanParams {
    /// Low end of the scan, inclusive.
    pub start: u16,
    /// High end of the scan, inclusive.
    pub end: u16,
}

/// `GET /scan?start&end`
pub async fn scan(
    State(state): State<AppState>,
    Query(params): Query<ScanParams>,
) -> Result<Json<Value>, ApiError> {
    let engine = Arc::clone(&state.engine);
    let statuses = blocking(move || engine.scan(params.start, params.end)).await?;
    let ports_in_use: Vec<Value> = statuses
        .iter()
        .map(|status| {
            json!({
                "port": status.port.value(),
                "allocated_to": status.allocated_to,
                "system_usage": status.system_usage,
            })
        })
        .collect();
    Ok(Json(json!({
        "scan_range": [params.start, params.end],
        "ports_in_use": ports_in_use,
    })))
}

/// Body of `POST /cleanup`.
#[derive(Debug, Default, Deserialize)]
pub struct CleanupBody {
    /// Remove unverifiable allocations too.
    #[serde(default)]
    pub force: bool,
}

/// `POST /cleanup`
pub async fn cleanup(
    State(state): State<AppState>,
    body: Option<Json<CleanupBody>>,
) -> Result<Json<Value>, ApiError> {
    let force = body.map_or(false, |Json(b)| b.force);
    let engine = Arc::clone(&state.engine);
    let report = blocking(move || engine.cleanup(force)).await?;
    Ok(Json(json!({
        "success": true,
        "cleaned": report.cleaned,
        "ports": report.ports,
    })))
}

/// `GET /allocations`
pub async fn allocations(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "allocations": state.engine.list_allocations() }))
}

/// `GET /config`
pub async fn config(State(state): State<AppState>) -> Json<Value> {
    let catalog = state.engine.catalog();
    let service_types: BTreeMap<String, Value> = catalog
        .iter()
        .map(|t| {
            (
                t.name.clone(),
                serde_json::to_value(t.to_spec()).unwrap_or(Value::Null),
            )
        })
        .collect();
    let warnings = catalog.warnings().to_vec();
    Json(json!({
        "service_types": service_types,
        "compliance": {
            "valid": warnings.is_empty(),
            "warnings": warnings,
        },
    }))
}

/// `GET /status` (no auth)
pub async fn status(State(state): State<AppState>) -> Json<Value> {
    let stats = state.engine.stats();
    Json(json!({
        "status": "ok",
        "uptime": state.started_at.elapsed().as_secs(),
        "allocations": stats.active_allocations + stats.suspect_allocations,
        "instances": stats.registered_instances,
    }))
}

/// `GET /health`
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let catalog = state.engine.catalog();
    let stats = state.engine.stats();
    Json(json!({
        "components": {
            "engine": "ok",
            "catalog": if catalog.warnings().is_empty() { "ok" } else { "degraded" },
            "audit": if stats.metrics.audit_events_dropped == 0 { "ok" } else { "degraded" },
            "metrics": stats.metrics,
        },
    }))
}

/// Body of `POST /instance/register`.
#[derive(Debug, Deserialize)]
pub struct RegisterBody {
    /// The instance id to register.
    pub instance_id: String,
    /// Instance working directory.
    #[serde(default)]
    pub working_directory: Option<String>,
}

/// `POST /instance/register`
pub async fn register_instance(
    State(state): State<AppState>,
    Json(body): Json<RegisterBody>,
) -> Result<Json<Value>, ApiError> {
    if body.instance_id.trim().is_empty() {
        return Err(ApiError(Error::Validation {
            field: "instance_id".into(),
            message: "must be non-empty".into(),
        }));
    }
    let record = state
        .engine
        .register_instance(&body.instance_id, body.working_directory);
    Ok(Json(json!({ "registered_at": record.registered_at })))
}

/// `PUT /instance/{id}/heartbeat`
pub async fn heartbeat(
    State(state): State<AppState>,
    Path(instance_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let beat: DateTime<Utc> = state.engine.heartbeat(&instance_id)?;
    Ok(Json(json!({ "last_heartbeat": beat })))
}

/// `GET /instance/list`
pub async fn instances(State(state): State<AppState>) -> Json<Value> {
    let views: Vec<Value> = state
        .engine
        .list_instances()
        .into_iter()
        .map(|view| {
            json!({
                "instance_id": view.record.instance_id,
                "working_directory": view.record.working_directory,
                "registered_at": view.record.registered_at,
                "last_heartbeat": view.record.last_heartbeat,
                "active_locks": view
                    .active_locks
                    .iter()
                    .map(std::string::ToString::to_string)
                    .collect::<Vec<_>>(),
            })
        })
        .collect();
    Json(json!({ "instances": views }))
}

/// Query of `GET /suggest/{service_type}`.
#[derive(Debug, Deserialize)]
pub struct SuggestParams {
    /// How many suggestions to return (default 3, capped at 20).
    #[serde(default)]
    pub n: Option<usize>,
}

/// `GET /suggest/{service_type}?n`
pub async fn suggest(
    State(state): State<AppState>,
    Path(service_type): Path<String>,
    Query(params): Query<SuggestParams>,
) -> Result<Json<Value>, ApiError> {
    let n = params.n.unwrap_or(3).clamp(1, 20);
    let engine = Arc::clone(&state.engine);
    let ports = blocking(move || engine.suggest(&service_type, n)).await?;
    let ports: Vec<u16> = ports.iter().map(|p| p.value()).collect();
    Ok(Json(json!({ "ports": ports })))
}

/// Body of `POST /observe`.
#[derive(Debug, Deserialize)]
pub struct ObserveBody {
    /// The port the caller ended up bound to.
    pub port: u16,
    /// The caller's pid.
    pub pid: u32,
    /// The service-type guess the caller used.
    #[serde(default)]
    pub service_hint: Option<String>,
}

/// `POST /observe`
pub async fn observe(State(state): State<AppState>, Json(body): Json<ObserveBody>) -> Json<Value> {
    state
        .engine
        .observe(body.port, body.pid, body.service_hint.as_deref());
    Json(json!({}))
}
