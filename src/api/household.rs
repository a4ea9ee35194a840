use super::{ApiError, AppState};
use crate::household::{HouseholdSnapshot, Mode, Policy};
use axum::{
    extract::State,
    response::Json,
    routing::{get, post, put},
    Router,
};
use serde::Deserialize;

#[derive(Deserialize)]
pub struct PolicyRequest {
    pub policy: Policy,
}

#[derive(Deserialize)]
pub struct GuestRequest {
    pub enabled: bool,
}

/// Mode reported by the controller
#[derive(Deserialize)]
pub struct ModeRequest {
    pub mode: String,
}

/// Create household API router
pub fn create_household_router(state: AppState) -> Router {
    Router::new()
        .route("/api/household", get(get_household))
        .route("/api/household/policy", put(set_policy))
        .route("/api/household/guest", put(set_guest))
        .route("/api/household/mode", put(set_mode))
        .route("/api/household/refresh", post(refresh))
        .with_state(state)
}

async fn get_household(State(state): State<AppState>) -> Json<HouseholdSnapshot> {
    Json(state.household.snapshot())
}

/// PUT /api/household/policy - {"policy": "anyone" | "everyone"}
async fn set_policy(
    State(state): State<AppState>,
    Json(req): Json<PolicyRequest>,
) -> Json<HouseholdSnapshot> {
    Json(state.household.set_policy(req.policy))
}

/// PUT /api/household/guest - {"enabled": bool}
async fn set_guest(
    State(state): State<AppState>,
    Json(req): Json<GuestRequest>,
) -> Json<HouseholdSnapshot> {
    Json(state.household.set_guest_override(req.enabled))
}

/// PUT /api/household/mode - incoming mode from the controller
async fn set_mode(
    State(state): State<AppState>,
    Json(req): Json<ModeRequest>,
) -> Result<Json<HouseholdSnapshot>, ApiError> {
    let mode: Mode = req.mode.parse().map_err(ApiError::BadRequest)?;
    Ok(Json(state.household.set_mirrored_mode(mode)))
}

/// POST /api/household/refresh - re-publish every attribute
async fn refresh(State(state): State<AppState>) -> Json<HouseholdSnapshot> {
    Json(state.household.refresh())
}
