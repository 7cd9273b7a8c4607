//! HTTP command handlers. Each awaiting route turns a JSON body into one
//! correlated plugin request.

use std::time::Duration;

use axum::body::Bytes;
use axum::extract::State;
use axum::Json;
use serde_json::{json, Map, Value};

use relay_core::messages::{OutboundKind, RelayMessage};
use relay_core::RelayError;

use crate::cache::Snapshot;
use crate::error::ApiError;
use crate::server::AppState;

type Params = Map<String, Value>;
type ApiResult = Result<Json<Value>, ApiError>;

/// Parse a request body as a JSON object. An empty body is `{}`.
pub fn parse_params(body: &[u8]) -> Result<Params, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Params::new());
    }
    match serde_json::from_slice::<Value>(body) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(ApiError::InvalidParams("request body must be a JSON object".into())),
        Err(e) => Err(ApiError::InvalidParams(format!("invalid JSON body: {e}"))),
    }
}

/// Extract a required non-empty string parameter.
pub fn require_str<'a>(params: &'a Params, key: &str) -> Result<&'a str, ApiError> {
    params
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ApiError::InvalidParams(format!("Missing required parameter: {key}")))
}

/// Extract a required parameter of any JSON type except `null`.
pub fn require_value<'a>(params: &'a Params, key: &str) -> Result<&'a Value, ApiError> {
    params
        .get(key)
        .filter(|v| !v.is_null())
        .ok_or_else(|| ApiError::InvalidParams(format!("Missing required parameter: {key}")))
}

/// Remove and validate the optional `timeoutMs` override.
pub fn take_timeout(params: &mut Params) -> Result<Option<Duration>, ApiError> {
    match params.remove("timeoutMs") {
        None | Some(Value::Null) => Ok(None),
        Some(v) => match v.as_u64() {
            Some(ms) if ms > 0 => Ok(Some(Duration::from_millis(ms))),
            _ => Err(ApiError::InvalidParams(
                "timeoutMs must be a positive integer".into(),
            )),
        },
    }
}

fn success(result: Value) -> Json<Value> {
    Json(json!({ "success": true, "result": result }))
}

/// Send `kind` with the body fields and wait for the plugin's reply.
async fn relay_command(
    state: &AppState,
    kind: OutboundKind,
    mut params: Params,
) -> ApiResult {
    let timeout = take_timeout(&mut params)?;
    let message = RelayMessage::new(kind).with_fields(params);
    let result = state.relay.send_and_await(message, timeout).await?;
    Ok(success(result))
}

pub async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "uptimeSecs": state.started_at.elapsed().as_secs(),
        "connections": state.clients.count(),
        "openConnections": state.clients.open_count(),
        "pendingRequests": state.pending.len(),
        "droppedFrames": state.clients.dropped_total(),
    }))
}

pub async fn create(State(state): State<AppState>, body: Bytes) -> ApiResult {
    let params = parse_params(&body)?;
    let _ = require_value(&params, "spec")?;
    let sent_to = state
        .relay
        .publish(RelayMessage::new(OutboundKind::Create).with_fields(params))?;
    Ok(Json(json!({ "success": true, "sentTo": sent_to })))
}

fn snapshot_result(snapshot: Option<Snapshot>, missing: &str) -> ApiResult {
    let snapshot = snapshot.ok_or_else(|| ApiError::NoData(missing.into()))?;
    let value = serde_json::to_value(snapshot).map_err(RelayError::from)?;
    Ok(success(value))
}

pub async fn latest_selection(State(state): State<AppState>) -> ApiResult {
    snapshot_result(
        state.caches.selection.latest(),
        "no selection has been reported",
    )
}

pub async fn latest_variables(State(state): State<AppState>) -> ApiResult {
    snapshot_result(
        state.caches.variables.latest(),
        "no variables have been reported",
    )
}

pub async fn cache_dump(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "success": true,
        "selection": state.caches.selection.all(),
        "variables": state.caches.variables.all(),
    }))
}

pub async fn request_selection(State(state): State<AppState>, body: Bytes) -> ApiResult {
    let params = parse_params(&body)?;
    relay_command(&state, OutboundKind::GetSelection, params).await
}

pub async fn update_node(State(state): State<AppState>, body: Bytes) -> ApiResult {
    let params = parse_params(&body)?;
    let _ = require_str(&params, "targetId")?;
    let _ = require_value(&params, "properties")?;
    relay_command(&state, OutboundKind::UpdateNode, params).await
}

pub async fn replace_child(State(state): State<AppState>, body: Bytes) -> ApiResult {
    let params = parse_params(&body)?;
    let _ = require_str(&params, "parentId")?;
    let _ = require_str(&params, "childId")?;
    let _ = require_value(&params, "spec")?;
    relay_command(&state, OutboundKind::ReplaceChild, params).await
}

pub async fn insert_child(State(state): State<AppState>, body: Bytes) -> ApiResult {
    let params = parse_params(&body)?;
    let _ = require_str(&params, "parentId")?;
    let _ = require_value(&params, "spec")?;
    if let Some(index) = params.get("index").filter(|v| !v.is_null()) {
        if index.as_u64().is_none() {
            return Err(ApiError::InvalidParams(
                "index must be a non-negative integer".into(),
            ));
        }
    }
    relay_command(&state, OutboundKind::InsertChild, params).await
}

pub async fn delete_node(State(state): State<AppState>, body: Bytes) -> ApiResult {
    let params = parse_params(&body)?;
    let _ = require_str(&params, "targetId")?;
    relay_command(&state, OutboundKind::DeleteNode, params).await
}
