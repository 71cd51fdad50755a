//! Incoming call webhook

use std::sync::Arc;

use axum::{
    Router,
    extract::State,
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::post,
};

use super::ApiState;
use crate::telephony::twiml;

/// Build incoming call router
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new().route("/incoming", post(incoming)).with_state(state)
}

/// Answer a call by connecting it to the media stream endpoint
///
/// Uses the configured public host, falling back to the request's Host header.
async fn incoming(State(state): State<Arc<ApiState>>, headers: HeaderMap) -> Response {
    let host = state.config.server.public_host.clone().or_else(|| {
        headers
            .get(header::HOST)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
    });

    let Some(host) = host else {
        tracing::warn!("incoming call without a known public host");
        return (StatusCode::BAD_REQUEST, "public host unknown").into_response();
    };

    let url = twiml::stream_url(&host);
    tracing::info!(stream_url = %url, "answering incoming call");

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/xml")],
        twiml::connect_stream(&url),
    )
        .into_response()
}
