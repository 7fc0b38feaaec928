use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{header::HOST, request::Parts, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tracing::{error, info};

use crate::{
    cookies::PrivateJar,
    oidc::{
        session::{clear_session_cookie, cookie_domain},
        Session, SESSION_COOKIE_NAME,
    },
    state::AppState,
};

/// The logged in applicant, resolved from the `session-id` cookie
#[derive(Debug, Clone)]
pub struct AuthApplicant {
    pub session: Session,
}

fn unauthenticated() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({ "error": "unauthenticated" })),
    )
        .into_response()
}

#[async_trait]
impl FromRequestParts<AppState> for AuthApplicant {
    type Rejection = Response;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let cookies = PrivateJar::from_request_parts(parts, state).await?;

        // Check if we have a session cookie
        let session_id = match get_session_id_from_cookie(&cookies) {
            Some(id) => id,
            None => {
                info!("No session cookie found");
                return Err(unauthenticated());
            }
        };

        match state.sessions.resolve(&session_id).await {
            Ok(Some(session)) => Ok(AuthApplicant { session }),
            Ok(None) => {
                info!("Session is invalid or expired");
                Err(unauthenticated())
            }
            Err(err) => {
                error!("Error validating session: {:?}", err);
                Err(StatusCode::INTERNAL_SERVER_ERROR.into_response())
            }
        }
    }
}

/// Get the session ID from the cookie
pub fn get_session_id_from_cookie(cookies: &PrivateJar) -> Option<String> {
    cookies.value(SESSION_COOKIE_NAME)
}

/// Host the browser addressed, used to scope the session cookie
pub fn request_host(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("x-forwarded-host")
        .or_else(|| headers.get(HOST))
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
}

/// Revoke the server-side session and remove the cookie
pub async fn end_session(
    state: &AppState,
    cookies: &PrivateJar,
    headers: &HeaderMap,
) -> color_eyre::Result<()> {
    if let Some(session_id) = get_session_id_from_cookie(cookies) {
        state.sessions.revoke(&session_id).await?;
    }

    let domain = cookie_domain(
        request_host(headers),
        state.config.cookie_domain_host.as_deref(),
    );
    cookies.remove(clear_session_cookie(domain));
    info!("Session cookie removed");

    Ok(())
}
