pub mod health;

use crate::callback::{self, CallbackState};
use axum::Router;
use axum::http::StatusCode;
use std::sync::Arc;

/// Every HTTP surface the process exposes. Anything unmatched, including a
/// wrong method on a known path, answers 404.
pub fn router(state: Arc<CallbackState>) -> Router {
    Router::new()
        .merge(health::router())
        .merge(callback::router(state))
        .fallback(not_found)
}

pub async fn not_found() -> StatusCode {
    StatusCode::NOT_FOUND
}
