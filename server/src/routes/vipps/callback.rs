use axum::{
    extract::{Query, State},
    http::HeaderMap,
    response::Redirect,
};
use tracing::{error, info, warn};

use super::login_failure_redirect;
use crate::{
    auth::request_host,
    cookies::PrivateJar,
    oidc::{
        session::{cookie_domain, session_cookie},
        AuthFailure, CallbackParams, ContextStore,
    },
    state::AppState,
};

/// Provider redirect target. Always answers with a redirect.
pub async fn callback(
    State(state): State<AppState>,
    cookies: PrivateJar,
    headers: HeaderMap,
    Query(params): Query<CallbackParams>,
) -> Redirect {
    let config = &state.config;

    // Take the login attempt before anything else so it can never be reused
    let context = match cookies.take(ContextStore::removal_cookie()) {
        Some(context_id) => state.contexts.take(&context_id).await,
        None => Ok(None),
    };

    let context = match context {
        Ok(context) => context,
        Err(err) => {
            let failure = AuthFailure::SessionStorageFailed(err);
            error!(code = failure.code(), error = %failure, "Could not load login context");
            return login_failure_redirect(&config.login_path, failure.code());
        }
    };

    match state.callback.handle(&params, context).await {
        Ok(success) => {
            let domain = cookie_domain(request_host(&headers), config.cookie_domain_host.as_deref());
            cookies.add(session_cookie(
                &success.session,
                state.sessions.ttl(),
                domain,
                config.secure_cookies(),
            ));

            info!(return_path = %success.return_path, "Applicant logged in");
            Redirect::to(&success.return_path)
        }
        Err(failure) => {
            match &failure {
                AuthFailure::SessionStorageFailed(_)
                | AuthFailure::ProviderUnreachable(_)
                | AuthFailure::KeySetUnreachable(_) => {
                    error!(code = failure.code(), error = %failure, "Login callback failed")
                }
                _ => warn!(code = failure.code(), error = %failure, "Login callback failed"),
            }

            login_failure_redirect(&config.login_path, failure.code())
        }
    }
}
