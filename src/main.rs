use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::signal;
use tracing::{info, warn};

mod api;
mod backends;
mod catalog;
mod classifier;
mod config;
mod error;
mod executor;
mod router;
mod stream;
mod traffic;
mod validator;

pub use config::Configuration;
pub use error::AppError;
pub use traffic::TrafficLog;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // When invoked as a Docker HEALTHCHECK, hit the admin /health endpoint and
    // exit immediately. This avoids needing any external tool (curl/wget) in
    // the container image.
    if std::env::args().nth(1).as_deref() == Some("--healthcheck") {
        return healthcheck().await;
    }

    // §6.5's CLAWROUTE_DEBUG raises the default filter before any config
    // file is even read, since early startup logging needs it too.
    let debug = std::env::var("CLAWROUTE_DEBUG").map(|v| v == "1" || v.eq_ignore_ascii_case("true")).unwrap_or(false);
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            if debug { "clawroute=debug,tower_http=info".into() } else { "clawroute=info,tower_http=warn".into() }
        }))
        .init();

    // §6.5: an explicit CLAWROUTE_CONFIG wins; otherwise fall back to the
    // conventional system path if it happens to exist, else run on bundled
    // defaults + env overrides alone (Configuration::load treats a missing
    // path the same way either way).
    let config_path = std::env::var("CLAWROUTE_CONFIG")
        .ok()
        .map(PathBuf::from)
        .or_else(|| {
            let default_path = PathBuf::from("/etc/clawroute/config.toml");
            default_path.exists().then_some(default_path)
        });

    // A configuration error (including "no provider key anywhere") is fatal
    // at startup per §7's error taxonomy — Configuration::load enforces it.
    let config = Configuration::load(config_path.as_deref())
        .with_context(|| format!("failed to load config from {:?}", config_path.as_deref().unwrap_or_else(|| std::path::Path::new("<bundled defaults>"))))?;

    info!(proxy_port = config.proxy_port, admin_port = config.admin_port, "clawroute starting");

    // §9 "Anthropic shape gap": the translation layer in backends/anthropic.rs
    // is best-effort for non-text content. Flag it once, loudly, rather than
    // silently degrading multi-block/tool-heavy Anthropic responses.
    if config.api_key_for(catalog::Provider::Anthropic).is_some() {
        warn!("anthropic provider key configured — note that the OpenAI<->Anthropic /v1/messages translation layer is best-effort for multi-block and tool-use content");
    }

    // TrafficLog is an in-memory ring buffer, not a durable store — size it
    // from retention_days against a generous estimate of daily request volume.
    const ASSUMED_REQUESTS_PER_DAY: usize = 10_000;
    let traffic_capacity = config.retention_days as usize * ASSUMED_REQUESTS_PER_DAY;
    let state = Arc::new(router::RouterState::new(config, traffic_capacity, config_path));

    tokio::spawn(config_watcher(Arc::clone(&state)));

    // Both listeners share one host (§6.5's CLAWROUTE_HOST); the admin
    // surface is not exposed more widely than the client-facing one.
    let host = state.config.load().host.clone();
    let proxy_addr: SocketAddr = format!("{host}:{}", state.config.load().proxy_port).parse()?;
    let admin_addr: SocketAddr = format!("{host}:{}", state.config.load().admin_port).parse()?;

    info!(%proxy_addr, "client API listening");
    info!(%admin_addr, "admin API listening");

    let proxy_listener = tokio::net::TcpListener::bind(proxy_addr).await?;
    let admin_listener = tokio::net::TcpListener::bind(admin_addr).await?;

    let trace_layer = || {
        tower_http::trace::TraceLayer::new_for_http()
            .make_span_with(tower_http::trace::DefaultMakeSpan::new().level(tracing::Level::INFO))
            .on_response(tower_http::trace::DefaultOnResponse::new().level(tracing::Level::INFO))
    };

    let client_app = api::client::router(Arc::clone(&state))
        .layer(axum::middleware::from_fn_with_state(Arc::clone(&state), api::auth::require_token))
        .layer(axum::middleware::from_fn_with_state(Arc::clone(&state), api::rate_limit::rate_limit_middleware))
        .layer(axum::middleware::from_fn(api::request_id::request_id_middleware))
        .layer(trace_layer());
    let admin_app = api::admin::router(Arc::clone(&state))
        .layer(axum::middleware::from_fn_with_state(Arc::clone(&state), api::auth::require_token))
        .layer(axum::middleware::from_fn_with_state(Arc::clone(&state), api::rate_limit::rate_limit_middleware))
        .layer(axum::middleware::from_fn(api::request_id::request_id_middleware))
        .layer(trace_layer());

    tokio::select! {
        result = axum::serve(proxy_listener, client_app.into_make_service_with_connect_info::<SocketAddr>()) => {
            result.context("client API server error")?;
        }
        result = axum::serve(admin_listener, admin_app.into_make_service_with_connect_info::<SocketAddr>()) => {
            result.context("admin API server error")?;
        }
        _ = shutdown_signal() => {
            info!("shutdown signal received");
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Lightweight healthcheck: GET the admin `/health` endpoint and exit 0 on
/// 200, 1 otherwise. Invoked via `clawroute --healthcheck` from Docker
/// HEALTHCHECK.
async fn healthcheck() -> anyhow::Result<()> {
    let port = std::env::var("CLAWROUTE_ADMIN_PORT").ok().and_then(|v| v.parse::<u16>().ok()).unwrap_or(8089);

    let url = format!("http://127.0.0.1:{port}/health");
    let resp = reqwest::get(&url).await?;

    if resp.status().is_success() {
        std::process::exit(0);
    } else {
        std::process::exit(1);
    }
}

/// Background task: polls the config file every 5 seconds and hot-reloads on
/// change. Uses filesystem `mtime` for change detection. Parse failures are
/// logged and ignored; the running config is unchanged. A no-op when the
/// process was started from bundled defaults with no config file.
async fn config_watcher(state: Arc<router::RouterState>) {
    let Some(path) = state.config_path.clone() else {
        return;
    };

    let mut last_mtime = std::fs::metadata(&path).and_then(|m| m.modified()).ok();

    let mut interval = tokio::time::interval(Duration::from_secs(5));
    interval.tick().await;

    loop {
        interval.tick().await;

        let mtime = std::fs::metadata(&path).and_then(|m| m.modified()).ok();
        if mtime == last_mtime {
            continue;
        }

        match Configuration::load(Some(&path)) {
            Ok(new_cfg) => {
                state.config.store(new_cfg);
                info!(path = %path.display(), "config hot-reloaded");
                last_mtime = mtime;
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "config reload failed — keeping previous config");
            }
        }
    }
}
