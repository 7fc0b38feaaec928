//! Double-submit CSRF tokens.
//!
//! The client gets a random token to echo back with every state-changing
//! request. The same token travels in the `csrf-token` cookie together with an
//! HMAC-SHA256 signature under the server secret (`token.signature`). A
//! submission passes only when the echoed token equals the cookie token and the
//! cookie signature verifies, so the cookie must have been issued by us.

use std::collections::HashMap;

use axum::{
    body::{Body, Bytes},
    extract::{Request, State},
    http::{header::CONTENT_TYPE, HeaderMap, Method, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use ring::hmac;
use serde_json::json;
use time::Duration;
use tower_cookies::{cookie::SameSite, Cookie, Cookies};
use tracing::{debug, warn};

use crate::{
    config::CsrfSecret,
    state::AppState,
    utils::{base64_url_encode, constant_time_eq, random_token},
};

pub const CSRF_COOKIE_NAME: &str = "csrf-token";
pub const CSRF_HEADER_NAME: &str = "x-csrf-token";

const CSRF_TOKEN_BYTES: usize = 32;
const CSRF_TTL_MINUTES: i64 = 60;
const MAX_BODY_BYTES: usize = 256 * 1024;

/// Body field names accepted when the header is absent
const FORM_FIELDS: [&str; 2] = ["csrfToken", "csrf_token"];

#[derive(Debug, thiserror::Error)]
#[error("invalid or missing CSRF token")]
pub struct InvalidCsrf;

impl IntoResponse for InvalidCsrf {
    fn into_response(self) -> Response {
        (
            StatusCode::FORBIDDEN,
            Json(json!({ "error": "invalid_csrf" })),
        )
            .into_response()
    }
}

/// A freshly issued token and the cookie that binds it
pub struct IssuedCsrfToken {
    pub token: String,
    pub cookie: Cookie<'static>,
}

#[derive(Clone)]
pub struct CsrfGuard {
    key: hmac::Key,
    secure: bool,
}

impl CsrfGuard {
    pub fn new(secret: &CsrfSecret, secure: bool) -> Self {
        Self {
            key: hmac::Key::new(hmac::HMAC_SHA256, secret.as_bytes()),
            secure,
        }
    }

    pub fn issue(&self) -> IssuedCsrfToken {
        let token = random_token(CSRF_TOKEN_BYTES);
        let signature = self.sign(&token);

        let cookie = Cookie::build((CSRF_COOKIE_NAME, format!("{}.{}", token, signature)))
            .path("/")
            .http_only(true)
            .secure(self.secure)
            .same_site(SameSite::Lax)
            .max_age(Duration::minutes(CSRF_TTL_MINUTES))
            .build();

        IssuedCsrfToken { token, cookie }
    }

    /// Check a submitted token against the raw `csrf-token` cookie value.
    /// Fails closed on anything absent or malformed.
    pub fn validate(&self, cookie_value: Option<&str>, submitted: &str) -> bool {
        let Some((stored_token, stored_signature)) = cookie_value.and_then(|v| v.split_once('.'))
        else {
            return false;
        };

        if stored_token.is_empty() || submitted.is_empty() {
            return false;
        }

        if !constant_time_eq(stored_token, submitted) {
            return false;
        }

        let Ok(signature) = URL_SAFE_NO_PAD.decode(stored_signature) else {
            return false;
        };

        hmac::verify(&self.key, stored_token.as_bytes(), &signature).is_ok()
    }

    fn sign(&self, token: &str) -> String {
        base64_url_encode(hmac::sign(&self.key, token.as_bytes()).as_ref())
    }
}

fn is_safe_method(method: &Method) -> bool {
    matches!(*method, Method::GET | Method::HEAD | Method::OPTIONS)
}

/// Pull the submitted token out of the request, header first, then body fields
fn extract_submitted_token(headers: &HeaderMap, body: &Bytes) -> Option<String> {
    if let Some(token) = headers
        .get(CSRF_HEADER_NAME)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
    {
        return Some(token.to_string());
    }

    let content_type = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    if content_type.starts_with("application/x-www-form-urlencoded") {
        let fields: HashMap<String, String> = serde_urlencoded::from_bytes(body).ok()?;
        return FORM_FIELDS
            .iter()
            .find_map(|name| fields.get(*name).cloned());
    }

    if content_type.starts_with("application/json") {
        let value: serde_json::Value = serde_json::from_slice(body).ok()?;
        return FORM_FIELDS
            .iter()
            .find_map(|name| value.get(*name).and_then(|v| v.as_str()).map(str::to_string));
    }

    None
}

/// Middleware guarding every state-changing route.
///
/// Safe methods pass through untouched. Other requests have their body
/// buffered so the token can be read from form or JSON fields, then the body
/// is handed on to the handler unchanged. Bodies over 256 KiB get a 413.
pub async fn require_csrf(
    State(state): State<AppState>,
    cookies: Cookies,
    request: Request,
    next: Next,
) -> Response {
    if is_safe_method(request.method()) {
        return next.run(request).await;
    }

    let (parts, body) = request.into_parts();
    let bytes = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(limit = MAX_BODY_BYTES, "Rejected request body: {}", e);
            return (
                StatusCode::PAYLOAD_TOO_LARGE,
                Json(json!({ "error": "payload_too_large" })),
            )
                .into_response();
        }
    };

    let cookie_value = cookies.get(CSRF_COOKIE_NAME).map(|c| c.value().to_string());
    let valid = extract_submitted_token(&parts.headers, &bytes)
        .is_some_and(|token| state.csrf.validate(cookie_value.as_deref(), &token));

    if !valid {
        warn!(
            method = %parts.method,
            path = %parts.uri.path(),
            has_cookie = cookie_value.is_some(),
            "Rejected request with invalid CSRF token"
        );
        return InvalidCsrf.into_response();
    }

    debug!("CSRF token accepted");
    next.run(Request::from_parts(parts, Body::from(bytes))).await
}

/// `GET /api/csrf` hands out a token and sets the matching cookie
pub async fn csrf_token(State(state): State<AppState>, cookies: Cookies) -> impl IntoResponse {
    let issued = state.csrf.issue();
    cookies.add(issued.cookie);

    Json(json!({ "csrfToken": issued.token }))
}
