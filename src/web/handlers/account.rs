use axum::{extract::State, response::{IntoResponse, Redirect, Response}, Json};
use tower_cookies::Cookies;

use crate::app::AppState;
use crate::error::AuthError;

pub async fn index(State(state): State<AppState>, cookies: Cookies) -> Result<Response, AuthError> {
    match state.flow.index_view(&cookies).await? {
        Some(view) => Ok(Json(view).into_response()),
        None => Ok(Redirect::temporary("/login").into_response()),
    }
}

pub async fn logout(State(state): State<AppState>, cookies: Cookies) -> Result<Response, AuthError> {
    state.flow.logout(&cookies).await?;
    Ok(Redirect::temporary("/").into_response())
}
