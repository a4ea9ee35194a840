use super::{ApiError, AppState};
use crate::presence::{EntitySnapshot, MAX_TIMEOUT_SECONDS};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use serde::Deserialize;

/// Body of POST /api/entities
#[derive(Deserialize)]
pub struct AddEntityRequest {
    /// Hardware address in any accepted spelling
    pub identity: String,
    pub label: String,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

/// Create entity API router
///
/// `:id` accepts an identity (any spelling) or a label.
pub fn create_entity_router(state: AppState) -> Router {
    Router::new()
        .route("/api/entities", get(list_entities).post(add_entity))
        .route("/api/entities/:id", get(get_entity).delete(remove_entity))
        .route("/api/entities/:id/present", post(mark_present))
        .route("/api/entities/:id/not-present", post(mark_not_present))
        .route("/api/entities/:id/geofence/enter", post(geofence_enter))
        .route("/api/entities/:id/geofence/exit", post(geofence_exit))
        .route("/api/entities/:id/refresh", post(refresh_entity))
        .with_state(state)
}

/// GET /api/entities
async fn list_entities(State(state): State<AppState>) -> Json<Vec<EntitySnapshot>> {
    Json(state.household.entities())
}

/// POST /api/entities - attach an entity (idempotent per identity)
async fn add_entity(
    State(state): State<AppState>,
    Json(req): Json<AddEntityRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.label.trim().is_empty() {
        return Err(ApiError::BadRequest("label must not be empty".to_string()));
    }
    if let Some(timeout) = req.timeout_seconds.filter(|t| *t > MAX_TIMEOUT_SECONDS) {
        return Err(ApiError::BadRequest(format!(
            "timeout_seconds {} exceeds the maximum of {}",
            timeout, MAX_TIMEOUT_SECONDS
        )));
    }

    let machine = state
        .household
        .add_entity(&req.identity, req.label.trim(), req.timeout_seconds)?;

    Ok((StatusCode::CREATED, Json(machine.snapshot())))
}

async fn get_entity(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<EntitySnapshot>, ApiError> {
    state
        .household
        .find(&id)
        .map(|machine| Json(machine.snapshot()))
        .ok_or_else(|| ApiError::NotFound(format!("no entity matches '{}'", id)))
}

/// DELETE /api/entities/:id
async fn remove_entity(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    match state.household.remove_entity(&id) {
        Some(_) => Ok(StatusCode::NO_CONTENT),
        None => Err(ApiError::NotFound(format!("no entity matches '{}'", id))),
    }
}

async fn mark_present(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<EntitySnapshot>, ApiError> {
    Ok(Json(state.household.arrived(&id)?))
}

async fn mark_not_present(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<EntitySnapshot>, ApiError> {
    Ok(Json(state.household.departed(&id)?))
}

async fn geofence_enter(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<EntitySnapshot>, ApiError> {
    Ok(Json(state.household.geofence_enter(&id)?))
}

async fn geofence_exit(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<EntitySnapshot>, ApiError> {
    Ok(Json(state.household.geofence_exit(&id)?))
}

async fn refresh_entity(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<EntitySnapshot>, ApiError> {
    Ok(Json(state.household.refresh_entity(&id)?))
}
