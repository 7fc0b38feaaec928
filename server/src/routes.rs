use std::net::SocketAddr;

use axum::{
    async_trait,
    extract::{ConnectInfo, FromRequestParts},
    http::{header::RETRY_AFTER, request::Parts, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json,
};
use serde_json::json;
use tower_cookies::CookieManagerLayer;

use crate::{config::CALLBACK_PATH, csrf, state::AppState};

pub mod application;
pub mod vipps;

/// Build the application router with all routes
pub fn routes(app_state: AppState) -> axum::Router {
    // State-changing endpoints, all behind the CSRF check
    let protected = axum::Router::new()
        .route("/api/auth/logout", post(vipps::logout))
        .route("/api/jobbsoker/soknad", post(application::submit))
        .route_layer(middleware::from_fn_with_state(
            app_state.clone(),
            csrf::require_csrf,
        ));

    axum::Router::new()
        .route("/healthz", get(healthz))
        .route("/api/csrf", get(csrf::csrf_token))
        .route("/api/auth/vipps/login", get(vipps::login))
        .route(CALLBACK_PATH, get(vipps::callback))
        .merge(protected)
        .layer(CookieManagerLayer::new())
        // Add trace layer for debugging
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(app_state)
}

async fn healthz() -> &'static str {
    "ok"
}

/// Client address for rate limiting
pub struct ClientIp(pub String);

#[async_trait]
impl FromRequestParts<AppState> for ClientIp {
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        Ok(ClientIp(client_ip(parts, state.config.trust_proxy_headers)))
    }
}

/// Socket peer address, or the address our own proxy recorded when
/// `trust_proxy_headers` is set. The proxy appends the peer it saw, so only the
/// rightmost `X-Forwarded-For` entry is trusted; the rest is client supplied.
fn client_ip(parts: &Parts, trust_proxy_headers: bool) -> String {
    let forwarded = trust_proxy_headers
        .then(|| {
            parts
                .headers
                .get("x-forwarded-for")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.rsplit(',').next())
                .or_else(|| {
                    parts
                        .headers
                        .get("x-real-ip")
                        .and_then(|v| v.to_str().ok())
                })
        })
        .flatten()
        .map(str::trim)
        .filter(|v| !v.is_empty());

    match forwarded {
        Some(ip) => ip.to_string(),
        None => parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip().to_string())
            .unwrap_or_else(|| "unknown".to_string()),
    }
}

pub(crate) fn too_many_requests(reset_seconds: u64) -> Response {
    (
        StatusCode::TOO_MANY_REQUESTS,
        [(RETRY_AFTER, reset_seconds.max(1).to_string())],
        Json(json!({ "error": "rate_limited" })),
    )
        .into_response()
}
