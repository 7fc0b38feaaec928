use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Redirect},
};

use crate::{
    auth::end_session,
    cookies::PrivateJar,
    errors::{ServerResult, WithStatus},
    state::AppState,
};

/// End the applicant's session
pub async fn logout(
    State(state): State<AppState>,
    cookies: PrivateJar,
    headers: HeaderMap,
) -> ServerResult<impl IntoResponse, StatusCode> {
    end_session(&state, &cookies, &headers)
        .await
        .with_status(StatusCode::INTERNAL_SERVER_ERROR)?;

    Ok(Redirect::to("/"))
}
