use axum::{extract::{Query, State}, response::{IntoResponse, Redirect, Response}};
use tower_cookies::Cookies;

use crate::app::AppState;
use crate::auth::flow::{CallbackParams, LoginRedirect};
use crate::error::AuthError;

// Starts the authorization flow, or resumes a session that is still valid.
pub async fn login(State(state): State<AppState>, cookies: Cookies) -> Result<Response, AuthError> {
    let target = match state.flow.begin_login(&cookies).await? {
        LoginRedirect::Resume => Redirect::temporary("/"),
        LoginRedirect::Provider(url) => Redirect::temporary(&url),
    };
    Ok(target.into_response())
}

// Handles the redirect back from the provider.
pub async fn callback(
    State(state): State<AppState>,
    cookies: Cookies,
    Query(params): Query<CallbackParams>,
) -> Result<Response, AuthError> {
    state.flow.complete_callback(&cookies, params).await?;
    Ok(Redirect::temporary("/").into_response())
}
