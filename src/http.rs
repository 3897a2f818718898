//! HTTP surface of the harness
//!
//! | Method | Path                 | Body      | Success                 |
//! |--------|----------------------|-----------|-------------------------|
//! | GET    | `/executor`          |           | 200, JSON string array  |
//! | POST   | `/executor`          | text      | 204                     |
//! | DELETE | `/executor`          |           | 204                     |
//! | POST   | `/executor/crash`    | text      | never (process exits)   |
//! | GET    | `/executor/recovery` |           | 200, JSON string array  |
//! | GET    | `/executor/jndi`     |           | 204                     |
//!
//! Errors answer with the error's status and its display text as the body.
//! Driver calls block (file I/O, recovery polling), so they run on tokio's
//! blocking pool.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};

use crate::error::{HarnessError, Result};
use crate::harness::Harness;

impl IntoResponse for HarnessError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        log::warn!("Request failed ({}): {}", status, self);
        (status, self.to_string()).into_response()
    }
}

/// Build the `/executor` router over `harness`
pub fn router(harness: Arc<Harness>) -> Router {
    Router::new()
        .route(
            "/executor",
            get(get_strings).post(save_string).delete(remove_all),
        )
        .route("/executor/crash", post(crash))
        .route("/executor/recovery", get(recovery))
        .route("/executor/jndi", get(jndi))
        .with_state(harness)
}

/// Run `f` against the harness on the blocking pool
async fn blocking<T, F>(harness: Arc<Harness>, f: F) -> Result<T>
where
    F: FnOnce(&Harness) -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(move || f(&harness))
        .await
        .map_err(|e| HarnessError::Internal(format!("request task failed: {}", e)))?
}

async fn get_strings(State(harness): State<Arc<Harness>>) -> Result<Json<Vec<String>>> {
    blocking(harness, |h| h.driver().get_strings())
        .await
        .map(Json)
}

async fn save_string(State(harness): State<Arc<Harness>>, body: String) -> Result<StatusCode> {
    blocking(harness, move |h| h.driver().save_string(&body)).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn remove_all(State(harness): State<Arc<Harness>>) -> Result<StatusCode> {
    let removed = blocking(harness, |h| h.driver().remove_all()).await?;
    log::debug!("Removed {} rows", removed);
    Ok(StatusCode::NO_CONTENT)
}

async fn crash(State(harness): State<Arc<Harness>>, body: String) -> Result<StatusCode> {
    blocking(harness, move |h| h.driver().crash(&body)).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn recovery(State(harness): State<Arc<Harness>>) -> Result<Json<Vec<String>>> {
    blocking(harness, |h| h.driver().recovery())
        .await
        .map(Json)
}

async fn jndi(State(harness): State<Arc<Harness>>) -> Result<StatusCode> {
    blocking(harness, |h| h.driver().verify_jndi()).await?;
    Ok(StatusCode::NO_CONTENT)
}
