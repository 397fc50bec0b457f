//! CRUD handlers for `/contexts`.
//!
//! Writes are role-aware: central versions and fans out, replicas forward
//! to their upstream and mirror the authoritative result, and pushes
//! carrying the origin header are applied verbatim.

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::Json;
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use ctxmesh_sync::UpstreamClient;
use ctxmesh_types::{
    ContextId, ContextMetadata, DeleteResponse, NodeRole, SaveRequest, SaveResponse, ORIGIN_HEADER,
};

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    #[serde(default, rename = "includeMetadata")]
    include_metadata: bool,
}

/// `GET /contexts` - all ids, or `(id, metadata)` pairs when asked.
pub async fn list_contexts(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Value>, ApiError> {
    let listing = if query.include_metadata {
        serde_json::to_value(state.store.list_with_metadata().await?)
    } else {
        serde_json::to_value(state.store.list().await?)
    };
    listing
        .map(Json)
        .map_err(|err| ApiError::Internal(err.to_string()))
}

/// `GET /contexts/{id}` - the payload, pulled lazily on cache nodes.
pub async fn get_context(
    State(state): State<AppState>,
    Path(raw_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let id = ContextId::new(raw_id)?;
    match state.store.get(&id).await {
        Ok(payload) => Ok(Json(payload)),
        Err(err) if err.is_not_found() && state.config.role == NodeRole::Cache => {
            match lazy_pull(&state, &id).await {
                Some(payload) => Ok(Json(payload)),
                None => Err(err.into()),
            }
        }
        Err(err) => Err(err.into()),
    }
}

/// `GET /contexts/{id}/metadata`.
pub async fn get_metadata(
    State(state): State<AppState>,
    Path(raw_id): Path<String>,
) -> Result<Json<ContextMetadata>, ApiError> {
    let id = ContextId::new(raw_id)?;
    Ok(Json(state.store.get_metadata(&id).await?))
}

/// `PUT /contexts/{id}`.
pub async fn put_context(
    State(state): State<AppState>,
    Path(raw_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<Json<SaveResponse>, ApiError> {
    let id = ContextId::new(raw_id)?;
    let (payload, extra) = parse_save_body(&body)?;

    if let Some(origin) = headers.get(ORIGIN_HEADER) {
        // Propagation push: the metadata is authoritative, apply verbatim.
        let origin = origin.to_str().unwrap_or("unknown").to_string();
        let metadata: ContextMetadata = serde_json::from_value(Value::Object(extra))
            .map_err(|_| ApiError::Invalid("propagated write requires full metadata".into()))?;
        let applied = state
            .store
            .apply_update(&id, payload, metadata.clone())
            .await?;
        debug!(context_id = %id, origin = %origin, applied, "propagated update received");
        return Ok(Json(SaveResponse {
            success: true,
            context_id: id,
            metadata,
        }));
    }

    if state.config.role.is_central() {
        let metadata = state.store.save(&id, payload, extra).await?;
        state.metrics.saves_total.inc();
        if let Some(propagator) = &state.propagator {
            propagator.propagate_update(id.clone(), payload.clone(), metadata.clone());
        }
        return Ok(Json(SaveResponse {
            success: true,
            context_id: id,
            metadata,
        }));
    }

    // Replica: route the write to the authority and mirror its verdict.
    let client = upstream_client(&state).await?;
    let request = SaveRequest {
        context: payload.clone(),
        metadata: (!extra.is_empty()).then_some(extra),
    };
    let response = client.forward_save(&id, &request).await.map_err(|err| {
        warn!(context_id = %id, error = ?err, "write forwarding failed");
        ApiError::UpstreamUnavailable(format!("write forwarding failed: {err}"))
    })?;

    if let Err(err) = state
        .store
        .apply_update(&id, payload, response.metadata.clone())
        .await
    {
        warn!(context_id = %id, error = %err, "local mirror of forwarded write failed");
    }
    Ok(Json(response))
}

/// `DELETE /contexts/{id}`.
pub async fn delete_context(
    State(state): State<AppState>,
    Path(raw_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<DeleteResponse>, ApiError> {
    let id = ContextId::new(raw_id)?;

    if let Some(origin) = headers.get(ORIGIN_HEADER) {
        let origin = origin.to_str().unwrap_or("unknown").to_string();
        state.store.apply_delete(&id).await?;
        debug!(context_id = %id, origin = %origin, "propagated delete received");
        return Ok(Json(DeleteResponse { success: true }));
    }

    if state.config.role.is_central() {
        state.store.delete(&id).await?;
        state.metrics.deletes_total.inc();
        if let Some(propagator) = &state.propagator {
            propagator.propagate_delete(id);
        }
        return Ok(Json(DeleteResponse { success: true }));
    }

    let client = upstream_client(&state).await?;
    let response = client.forward_delete(&id).await.map_err(|err| {
        warn!(context_id = %id, error = ?err, "delete forwarding failed");
        ApiError::UpstreamUnavailable(format!("delete forwarding failed: {err}"))
    })?;
    if let Err(err) = state.store.apply_delete(&id).await {
        warn!(context_id = %id, error = %err, "local mirror of forwarded delete failed");
    }
    Ok(Json(response))
}

fn parse_save_body(body: &Value) -> Result<(&Value, Map<String, Value>), ApiError> {
    let payload = body
        .get("context")
        .ok_or_else(|| ApiError::Invalid("missing context payload".into()))?;
    let extra = match body.get("metadata") {
        None | Some(Value::Null) => Map::new(),
        Some(Value::Object(map)) => map.clone(),
        Some(_) => return Err(ApiError::Invalid("metadata must be an object".into())),
    };
    Ok((payload, extra))
}

async fn upstream_client(state: &AppState) -> Result<UpstreamClient, ApiError> {
    let base = state.resolve_upstream().await.ok_or_else(|| {
        ApiError::UpstreamUnavailable("no upstream available for forwarding".into())
    })?;
    UpstreamClient::new(&base).map_err(|err| ApiError::UpstreamUnavailable(err.to_string()))
}

/// One-shot pull of an unknown context from the upstream on a cache node.
///
/// Best-effort: any failure degrades to the local NotFound answer.
async fn lazy_pull(state: &AppState, id: &ContextId) -> Option<Value> {
    let client = upstream_client(state).await.ok()?;

    let payload = match client.fetch_context(id).await {
        Ok(Some(payload)) => payload,
        Ok(None) => return None,
        Err(err) => {
            warn!(context_id = %id, error = ?err, "lazy pull failed");
            return None;
        }
    };
    let metadata = match client.fetch_metadata(id).await {
        Ok(Some(metadata)) => metadata,
        Ok(None) => return None,
        Err(err) => {
            warn!(context_id = %id, error = ?err, "lazy pull metadata fetch failed");
            return None;
        }
    };

    if let Err(err) = state.store.apply_update(id, &payload, metadata).await {
        warn!(context_id = %id, error = %err, "lazy pull apply failed");
    }
    debug!(context_id = %id, "context pulled on demand");
    Some(payload)
}
