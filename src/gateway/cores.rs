//! Core resource handlers.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    Json,
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
};
use serde::Deserialize;
use uuid::Uuid;

use super::router::AppState;
use crate::lifecycle::{Core, CoreAction};
use crate::{Error, Result};

/// Query of `GET /core/{id}`.
#[derive(Debug, Deserialize)]
pub struct CoreQuery {
    /// `deploy` or `stop`; a plain read when absent
    pub action: Option<String>,
}

/// POST /core/: create a Core from a JSON object of parameters.
pub async fn create_core(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<(StatusCode, Json<Core>)> {
    let parameters: serde_json::Value = serde_json::from_slice(&body)
        .map_err(|e| Error::BadRequest(format!("invalid JSON body: {e}")))?;
    let core = state.cores.create(parameters).await?;
    Ok((StatusCode::CREATED, Json(core)))
}

/// GET /core/{id}[?action=deploy|stop]: read, or transition then read.
pub async fn get_core(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<CoreQuery>,
) -> Result<Json<Core>> {
    let id = parse_id(&id)?;
    let core = match query.action.as_deref() {
        None | Some("") => state.cores.get(id).await?,
        Some(action) => {
            let action: CoreAction = action.parse()?;
            state.cores.transition(id, action).await?
        }
    };
    Ok(Json(core))
}

/// DELETE /core/{id}: remove a stopped Core.
pub async fn delete_core(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Core>> {
    let id = parse_id(&id)?;
    Ok(Json(state.cores.delete(id).await?))
}

/// GET /cores/: every Core keyed by id.
pub async fn list_cores(State(state): State<Arc<AppState>>) -> Result<Json<BTreeMap<Uuid, Core>>> {
    Ok(Json(state.cores.list().await?))
}

fn parse_id(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).map_err(|_| Error::BadRequest(format!("invalid core id {raw:?}")))
}
