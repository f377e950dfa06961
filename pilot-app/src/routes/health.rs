use axum::routing::get;

pub fn router() -> axum::Router {
    axum::Router::new().route("/health", get(get_health).fallback(super::not_found))
}

#[tracing::instrument(level = "trace", skip_all)]
async fn get_health() -> &'static str {
    "OK"
}
