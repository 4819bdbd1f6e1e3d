use std::str::FromStr;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};

use super::{ApiError, ApiResult, AppState};
use crate::error::HubError;
use crate::instance::NodeStatusView;
use crate::logging::{LogEntry, LogLevel};
use crate::mcp::ToolDescriptor;
use crate::types::{Instance, InstancePatch, InstanceStatus, NewInstance, NodeSpec};

pub(super) async fn list(State(state): State<Arc<AppState>>) -> ApiResult<Json<Vec<Instance>>> {
    Ok(Json(state.manager.store().list().await?))
}

pub(super) async fn create(
    State(state): State<Arc<AppState>>,
    Json(new): Json<NewInstance>,
) -> ApiResult<(StatusCode, Json<Instance>)> {
    let instance = state.manager.create_instance(new).await?;
    Ok((StatusCode::CREATED, Json(instance)))
}

pub(super) async fn get_one(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Instance>> {
    let instance = state
        .manager
        .store()
        .get(&id)
        .await?
        .ok_or_else(|| HubError::not_found("instance", &id))?;
    Ok(Json(instance))
}

/// Node, chain, filter and namespace changes reach a running instance without a restart.
pub(super) async fn update(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(patch): Json<InstancePatch>,
) -> ApiResult<Json<Instance>> {
    Ok(Json(state.manager.update_instance(&id, patch).await?))
}

pub(super) async fn delete(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    if state.manager.delete_instance(&id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(HubError::not_found("instance", id).into())
    }
}

#[derive(Debug, Serialize)]
pub(super) struct StatusResponse {
    status: InstanceStatus,
}

impl From<Instance> for StatusResponse {
    fn from(instance: Instance) -> Self {
        Self {
            status: instance.status,
        }
    }
}

pub(super) async fn start(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<StatusResponse>> {
    Ok(Json(state.manager.start_instance(&id).await?.into()))
}

pub(super) async fn stop(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<StatusResponse>> {
    Ok(Json(state.manager.stop_instance(&id).await?.into()))
}

pub(super) async fn restart(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<StatusResponse>> {
    Ok(Json(state.manager.restart_instance(&id).await?.into()))
}

pub(super) async fn nodes(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<NodeStatusView>>> {
    Ok(Json(state.manager.node_statuses(&id).await?))
}

#[derive(Debug, Deserialize)]
pub(super) struct NodesBody {
    nodes: Vec<NodeSpec>,
}

pub(super) async fn replace_nodes(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<NodesBody>,
) -> ApiResult<Json<Vec<NodeStatusView>>> {
    state.manager.update_nodes(&id, body.nodes).await?;
    Ok(Json(state.manager.node_statuses(&id).await?))
}

pub(super) async fn tools(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<ToolDescriptor>>> {
    Ok(Json(state.manager.list_tools(&id).await?))
}

#[derive(Debug, Deserialize)]
pub(super) struct LogQuery {
    level: Option<String>,
}

pub(super) async fn logs(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<LogQuery>,
) -> ApiResult<Json<Vec<LogEntry>>> {
    let min_level = match query.level.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(level) => Some(
            LogLevel::from_str(level)
                .map_err(|_| ApiError::bad_request(format!("unknown log level: {level}")))?,
        ),
    };
    Ok(Json(state.logs.query(&id, min_level)))
}

#[derive(Debug, Serialize)]
pub(super) struct ClearedResponse {
    cleared: usize,
}

pub(super) async fn clear_logs(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Json<ClearedResponse> {
    Json(ClearedResponse {
        cleared: state.logs.clear(&id),
    })
}
