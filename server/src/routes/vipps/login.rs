use axum::{
    extract::{Query, State},
    http::HeaderMap,
    response::{IntoResponse, Redirect, Response},
};
use color_eyre::eyre::eyre;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::login_failure_redirect;
use crate::{
    cookies::PrivateJar,
    errors::{ServerResult, WithRedirect},
    oidc::{
        resolve_return_path,
        token::{request_origin, resolve_redirect_uri},
        AuthorizationContext, ContextStore,
    },
    routes::{too_many_requests, ClientIp},
    state::AppState,
};

#[derive(Deserialize)]
pub struct LoginParams {
    /// Where to send the applicant after a successful login
    #[serde(rename = "returnTo")]
    pub return_to: Option<String>,
}

#[derive(Serialize)]
struct AuthUrlParams<'a> {
    client_id: &'a str,
    response_type: &'static str,
    scope: &'a str,
    state: &'a str,
    nonce: &'a str,
    redirect_uri: &'a str,
}

/// Start the Vipps login flow
pub async fn login(
    State(state): State<AppState>,
    cookies: PrivateJar,
    ClientIp(ip): ClientIp,
    headers: HeaderMap,
    Query(params): Query<LoginParams>,
) -> ServerResult<Response, Redirect> {
    let decision = state.rate_limiter.enforce(&format!("login:{}", ip)).await;
    if !decision.allowed {
        warn!("Login initiation rate limited");
        return Ok(too_many_requests(decision.reset_seconds));
    }

    let config = &state.config;

    let metadata = match state.provider.discover().await {
        Ok(metadata) => metadata,
        Err(err) => {
            warn!(error = %err, "Could not load provider metadata for login");
            return Ok(
                login_failure_redirect(&config.login_path, "provider_unreachable").into_response(),
            );
        }
    };

    let origin = request_origin(&headers, config.default_scheme());
    let redirect_uri = resolve_redirect_uri(&config.vipps.redirect_uris, origin.as_ref())
        .ok_or_else(|| eyre!("No redirect URI available for this request"))
        .with_redirect(login_failure_redirect(&config.login_path, "missing_params"))?;

    let return_path =
        resolve_return_path(params.return_to.as_deref(), &config.default_return_path);
    let context = AuthorizationContext::new(return_path, redirect_uri.to_string());

    let context_id = state
        .contexts
        .save(&context)
        .await
        .with_redirect(login_failure_redirect(&config.login_path, "session_failed"))?;
    cookies.add(ContextStore::cookie(context_id, config.secure_cookies()));

    let query = serde_urlencoded::to_string(AuthUrlParams {
        client_id: &config.vipps.client_id,
        response_type: "code",
        scope: &config.vipps.scopes,
        state: &context.state,
        nonce: &context.nonce,
        redirect_uri: &context.redirect_uri,
    })
    .map_err(|e| eyre!("Failed to encode authorize parameters: {}", e))
    .with_redirect(login_failure_redirect(&config.login_path, "provider_error"))?;

    let separator = if metadata.authorization_endpoint.contains('?') {
        '&'
    } else {
        '?'
    };
    let authorize_url = format!("{}{}{}", metadata.authorization_endpoint, separator, query);

    info!(redirect_uri = %context.redirect_uri, "Redirecting applicant to Vipps login");
    Ok(Redirect::to(&authorize_url).into_response())
}
