//! opencode-pilot server.
//!
//! Runs the session broker on its Unix socket and the callback HTTP server
//! side by side, plus a periodic nonce sweep, until SIGINT/SIGTERM.

use crate::broker::{self, Broker};
use crate::callback::CallbackState;
use crate::config::PilotConfig;
use crate::routes;
use anyhow::Result;
use axum::http::{HeaderMap, Request, StatusCode};
use axum::response::Response;
use pilot_auth::{NonceAuthority, TokenAuthority};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower::limit::GlobalConcurrencyLimitLayer;
use tower_http::classify::ServerErrorsFailureClass;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

pub async fn doctor(config_path: Option<PathBuf>) -> Result<()> {
    let (cfg, path) = PilotConfig::load_with_path(config_path).await?;
    let topic = cfg.ntfy_topic()?;
    if cfg.callback_host_is_fallback() {
        tracing::warn!(
            "NTFY_CALLBACK_HOST is not set; notification buttons will only work on this machine"
        );
    }
    tracing::info!(
        config_path = %path.display(),
        ntfy_server = %cfg.ntfy.server,
        ntfy_topic = %topic,
        ntfy_token_configured = cfg.ntfy.token.is_some(),
        callback_base_url = %cfg.callback_base_url(),
        callback_secret_configured = cfg.callback.secret.is_some(),
        socket_path = %cfg.broker.socket_path.display(),
        nonce_ttl_seconds = cfg.broker.nonce_ttl_seconds,
        token_ttl_seconds = cfg.token_ttl().as_secs(),
        tokens_single_use = cfg.tokens.single_use,
        "config ok"
    );
    println!("config ok: {}", path.display());
    println!("callback url: {}", cfg.callback_base_url());
    Ok(())
}

pub async fn status(config_path: Option<PathBuf>) -> Result<()> {
    let cfg = PilotConfig::load(config_path).await?;
    let socket = &cfg.broker.socket_path;
    let broker_up = tokio::net::UnixStream::connect(socket).await.is_ok();

    let health_url = format!("http://127.0.0.1:{}/health", cfg.callback.port);
    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(2))
        .build()?;
    let callback_up = match http.get(&health_url).send().await {
        Ok(response) => response.status().is_success(),
        Err(error) => {
            tracing::debug!(%error, url = %health_url, "callback health probe failed");
            false
        }
    };

    tracing::info!(
        socket_path = %socket.display(),
        broker_up,
        callback_up,
        "status probe completed"
    );
    println!(
        "broker {} at {}",
        if broker_up { "running" } else { "not running" },
        socket.display()
    );
    println!(
        "callback server {} on port {}",
        if callback_up { "healthy" } else { "unreachable" },
        cfg.callback.port
    );
    if broker_up && callback_up {
        Ok(())
    } else {
        Err(anyhow::anyhow!("opencode-pilot is not fully running"))
    }
}

pub async fn serve(config_path: Option<PathBuf>) -> Result<()> {
    let (cfg, cfg_path) = PilotConfig::load_with_path(config_path).await?;
    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.callback.port));
    tracing::info!(
        config_path = %cfg_path.display(),
        bind_addr = %addr,
        callback_base_url = %cfg.callback_base_url(),
        socket_path = %cfg.broker.socket_path.display(),
        nonce_ttl_seconds = cfg.broker.nonce_ttl_seconds,
        sweep_interval_seconds = cfg.broker.sweep_interval_seconds,
        tokens_single_use = cfg.tokens.single_use,
        http_timeout_seconds = cfg.runtime.http_timeout_seconds,
        http_max_in_flight = cfg.runtime.http_max_in_flight,
        "server configuration loaded"
    );
    if cfg.callback_host_is_fallback() {
        tracing::warn!(
            "NTFY_CALLBACK_HOST is not set; callback links use localhost and only work on this machine"
        );
    }

    let listener = preflight_bind_listener(addr).await?;
    let socket_listener = broker::bind_socket(&cfg.broker.socket_path).await?;

    let nonces = Arc::new(NonceAuthority::new(cfg.nonce_ttl()));
    let tokens = Arc::new(
        TokenAuthority::from_optional_secret(cfg.callback.secret.as_deref())?
            .with_ttl(cfg.token_ttl())
            .with_single_use(cfg.tokens.single_use),
    );
    let broker = Arc::new(Broker::new(nonces.clone()));

    let shutdown = CancellationToken::new();
    let broker_handle = tokio::spawn(broker.clone().run(socket_listener, shutdown.child_token()));
    let sweep_handle = tokio::spawn(run_nonce_sweep(
        nonces.clone(),
        cfg.sweep_interval(),
        shutdown.child_token(),
    ));

    let state = Arc::new(CallbackState {
        nonces,
        tokens,
        handler: broker.clone(),
    });

    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(|request: &Request<_>| {
            tracing::info_span!(
                "http.request",
                method = %request.method(),
                path = %request.uri().path(),
                version = ?request.version(),
                request_id = %request_id_from_headers(request.headers())
            )
        })
        .on_request(|request: &Request<_>, _span: &tracing::Span| {
            tracing::info!(
                method = %request.method(),
                path = %request.uri().path(),
                request_id = %request_id_from_headers(request.headers()),
                "http request started"
            );
        })
        .on_response(
            |response: &Response, latency: Duration, _span: &tracing::Span| {
                tracing::info!(
                    status = response.status().as_u16(),
                    latency_ms = latency.as_millis() as u64,
                    "http request completed"
                );
            },
        )
        .on_failure(
            |error: ServerErrorsFailureClass, latency: Duration, _span: &tracing::Span| {
                tracing::error!(
                    error_class = %error,
                    latency_ms = latency.as_millis() as u64,
                    "http request failed"
                );
            },
        );

    let app = routes::router(state)
        .layer(GlobalConcurrencyLimitLayer::new(cfg.runtime.http_max_in_flight))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(cfg.runtime.http_timeout_seconds),
        ))
        .layer(trace_layer)
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid));

    tracing::info!(%addr, "opencode-pilot serving");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;
    tracing::info!("http server shutdown completed");

    shutdown.cancel();
    if let Err(e) = broker_handle.await {
        tracing::error!(error = %e, "broker task join failed during shutdown");
    }
    if let Err(e) = sweep_handle.await {
        tracing::error!(error = %e, "sweep task join failed during shutdown");
    }
    broker::remove_socket(&cfg.broker.socket_path);
    let stats = broker.stats();
    tracing::info!(
        sessions = stats.sessions,
        connections_total = stats.connections_total,
        "broker shutdown completed"
    );
    Ok(())
}

async fn run_nonce_sweep(
    nonces: Arc<NonceAuthority>,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let purged = nonces.sweep();
                if purged > 0 {
                    let stats = nonces.stats();
                    tracing::debug!(
                        purged,
                        stored = stats.stored,
                        issued_total = stats.issued_total,
                        consumed_total = stats.consumed_total,
                        "nonce sweep completed"
                    );
                }
            }
        }
    }
}

async fn preflight_bind_listener(addr: SocketAddr) -> Result<tokio::net::TcpListener> {
    tracing::info!(%addr, "preflight bind check starting");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| anyhow::anyhow!("preflight bind failed for {addr}: {e}"))?;
    tracing::info!(%addr, "preflight bind check passed");
    Ok(listener)
}

fn request_id_from_headers(headers: &HeaderMap) -> String {
    headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
        .unwrap_or_else(|| "missing".to_string())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(sig) => sig,
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler; falling back to ctrl_c only");
                if let Err(ctrlc_err) = tokio::signal::ctrl_c().await {
                    tracing::error!(error = %ctrlc_err, "failed to await ctrl-c signal");
                }
                shutdown.cancel();
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("received ctrl-c; beginning graceful shutdown");
            }
            _ = terminate.recv() => {
                tracing::warn!("received SIGTERM; beginning graceful shutdown");
            }
            _ = shutdown.cancelled() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::select! {
            result = tokio::signal::ctrl_c() => match result {
                Ok(()) => tracing::warn!("received ctrl-c; beginning graceful shutdown"),
                Err(e) => tracing::error!(error = %e, "failed to await ctrl-c signal"),
            },
            _ = shutdown.cancelled() => {}
        }
    }
    shutdown.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_id_falls_back_to_missing() {
        let mut headers = HeaderMap::new();
        assert_eq!(request_id_from_headers(&headers), "missing");
        headers.insert("x-request-id", "abc-123".parse().expect("header value"));
        assert_eq!(request_id_from_headers(&headers), "abc-123");
    }

    #[tokio::test]
    async fn sweep_task_stops_on_shutdown() {
        let nonces = Arc::new(NonceAuthority::default());
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(run_nonce_sweep(
            nonces,
            Duration::from_millis(10),
            shutdown.clone(),
        ));
        tokio::time::sleep(Duration::from_millis(30)).await;
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("sweep stops promptly")
            .expect("sweep task join");
    }
}
