//! Call metrics endpoints

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Serialize;

use super::ApiState;
use crate::session::SessionSnapshot;

/// Build calls router
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/", get(list_calls))
        .route("/{call_id}", get(get_call))
        .with_state(state)
}

/// Active calls listing
#[derive(Debug, Serialize)]
pub struct CallList {
    pub calls: Vec<SessionSnapshot>,
}

async fn list_calls(State(state): State<Arc<ApiState>>) -> Json<CallList> {
    Json(CallList {
        calls: state.registry.active(),
    })
}

/// A call that is active or finished recently
async fn get_call(
    State(state): State<Arc<ApiState>>,
    Path(call_id): Path<String>,
) -> Result<Json<SessionSnapshot>, ApiError> {
    state
        .registry
        .get(&call_id)
        .map(Json)
        .ok_or(ApiError::NotFound(call_id))
}

/// Errors returned by the JSON endpoints
#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        #[derive(Serialize)]
        struct ErrorResponse {
            error: ErrorBody,
        }

        #[derive(Serialize)]
        struct ErrorBody {
            code: &'static str,
            message: String,
        }

        let (status, code, message) = match self {
            Self::NotFound(call_id) => (
                StatusCode::NOT_FOUND,
                "not_found",
                format!("no call with id {call_id}"),
            ),
        };

        (status, Json(ErrorResponse { error: ErrorBody { code, message } })).into_response()
    }
}
