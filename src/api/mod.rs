// Operator HTTP API

pub mod entities;
pub mod household;

pub use entities::create_entity_router;
pub use household::create_household_router;

use crate::household::{Household, HouseholdError};
use crate::identity::IdentityError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    Router,
};
use serde::Serialize;
use std::sync::Arc;

/// Shared state for all operator routes
#[derive(Clone)]
pub struct AppState {
    pub household: Arc<Household>,
}

/// Full operator API
pub fn create_router(household: Arc<Household>) -> Router {
    let state = AppState { household };
    Router::new()
        .merge(create_entity_router(state.clone()))
        .merge(create_household_router(state))
}

/// Error response
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

/// Errors returned by operator endpoints
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
        };

        let body = Json(ErrorResponse {
            error: error_message,
        });

        (status, body).into_response()
    }
}

impl From<HouseholdError> for ApiError {
    fn from(e: HouseholdError) -> Self {
        match e {
            HouseholdError::InvalidIdentity(_) => ApiError::BadRequest(e.to_string()),
            HouseholdError::UnknownEntity(_) => ApiError::NotFound(e.to_string()),
        }
    }
}

impl From<IdentityError> for ApiError {
    fn from(e: IdentityError) -> Self {
        ApiError::BadRequest(e.to_string())
    }
}
