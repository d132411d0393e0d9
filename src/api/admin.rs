//! Admin HTTP surface (§6.3) — operator-facing introspection and mutators.
//!
//! Runs on its own listener (`admin_port`) so it can be firewalled off from
//! the client-facing port independently. Every mutator follows the same
//! load-clone-mutate-store cycle against `state.config`'s `ArcSwap`
//! (§5's shared-resource policy) rather than a direct field write, since
//! `Configuration` has no interior mutability of its own.

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::config::SessionOverride;
use crate::error::AppError;
use crate::router::RouterState;

const REDACTED: &str = "[REDACTED]";

/// Build the admin-facing axum router.
pub fn router(state: Arc<RouterState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(super::metrics::metrics))
        .route("/stats", get(stats))
        .route("/api/config", get(get_config))
        .route("/api/enable", post(enable))
        .route("/api/disable", post(disable))
        .route("/api/dry-run/enable", post(dry_run_enable))
        .route("/api/dry-run/disable", post(dry_run_disable))
        .route("/api/override/global", post(set_global_override))
        .route("/api/override/session", post(set_session_override).delete(clear_session_override))
        .fallback(not_found)
        .with_state(state)
}

/// `GET /health`.
async fn health(State(state): State<Arc<RouterState>>) -> impl IntoResponse {
    let config = state.config.load();
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "enabled": config.enabled,
        "dryRun": config.dry_run,
        "timestamp": chrono::Utc::now(),
    }))
}

/// `GET /stats` — aggregated view from the in-process traffic sink.
async fn stats(State(state): State<Arc<RouterState>>) -> impl IntoResponse {
    Json(state.traffic.stats().await)
}

/// `GET /api/config` — current configuration with secrets redacted.
async fn get_config(State(state): State<Arc<RouterState>>) -> impl IntoResponse {
    let mut config = (**state.config.load()).clone();
    if config.auth_token.is_some() {
        config.auth_token = Some(REDACTED.to_string());
    }
    Json(config)
}

fn set_enabled(state: &RouterState, enabled: bool) {
    let mut config = (**state.config.load()).clone();
    config.enabled = enabled;
    state.config.store(config);
}

fn set_dry_run(state: &RouterState, dry_run: bool) {
    let mut config = (**state.config.load()).clone();
    config.dry_run = dry_run;
    state.config.store(config);
}

async fn enable(State(state): State<Arc<RouterState>>) -> impl IntoResponse {
    set_enabled(&state, true);
    Json(json!({ "enabled": true }))
}

async fn disable(State(state): State<Arc<RouterState>>) -> impl IntoResponse {
    set_enabled(&state, false);
    Json(json!({ "enabled": false }))
}

async fn dry_run_enable(State(state): State<Arc<RouterState>>) -> impl IntoResponse {
    set_dry_run(&state, true);
    Json(json!({ "dryRun": true }))
}

async fn dry_run_disable(State(state): State<Arc<RouterState>>) -> impl IntoResponse {
    set_dry_run(&state, false);
    Json(json!({ "dryRun": false }))
}

#[derive(Deserialize)]
struct GlobalOverrideBody {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    enabled: Option<bool>,
}

/// `POST /api/override/global` — body `{model}` sets, `{enabled:false}` clears.
async fn set_global_override(State(state): State<Arc<RouterState>>, Json(body): Json<GlobalOverrideBody>) -> Result<impl IntoResponse, AppError> {
    let mut config = (**state.config.load()).clone();
    if body.enabled == Some(false) {
        config.overrides.global_force_model = None;
        state.config.store(config);
        return Ok(Json(json!({ "globalForceModel": Value::Null })));
    }
    let Some(model) = body.model else {
        return Err(AppError::bad_request("expected `model` or `enabled:false`"));
    };
    config.overrides.global_force_model = Some(model.clone());
    state.config.store(config);
    Ok(Json(json!({ "globalForceModel": model })))
}

#[derive(Deserialize)]
struct SessionOverrideBody {
    #[serde(rename = "sessionId")]
    session_id: String,
    model: String,
    #[serde(default)]
    turns: Option<u32>,
}

/// `POST /api/override/session` — upsert, `remainingTurns = turns ?? ∞`.
async fn set_session_override(State(state): State<Arc<RouterState>>, Json(body): Json<SessionOverrideBody>) -> impl IntoResponse {
    let mut config = (**state.config.load()).clone();
    config.overrides.sessions.insert(
        body.session_id.clone(),
        SessionOverride { model: body.model, remaining_turns: body.turns.unwrap_or(u32::MAX) },
    );
    state.config.store(config);
    Json(json!({ "sessionId": body.session_id, "status": "set" }))
}

#[derive(Deserialize)]
struct SessionOverrideClearBody {
    #[serde(rename = "sessionId")]
    session_id: String,
}

/// `DELETE /api/override/session`.
async fn clear_session_override(State(state): State<Arc<RouterState>>, Json(body): Json<SessionOverrideClearBody>) -> impl IntoResponse {
    let mut config = (**state.config.load()).clone();
    config.overrides.sessions.remove(&body.session_id);
    state.config.store(config);
    Json(json!({ "sessionId": body.session_id, "status": "cleared" }))
}

async fn not_found() -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(json!({
            "error": {
                "message": "no such admin route",
                "type": "proxy_error",
                "code": "not_found",
            }
        })),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::Request as HttpRequest};
    use std::collections::HashMap;
    use tower::ServiceExt;

    fn state() -> Arc<RouterState> {
        let mut config = crate::config::Configuration {
            proxy_port: 0,
            admin_port: 0,
            host: "127.0.0.1".to_string(),
            debug: false,
            log_content: false,
            retention_days: 1,
            min_confidence: 0.5,
            enabled: true,
            dry_run: false,
            tool_aware_escalation: true,
            conservative_mode: false,
            always_fallback_to_original: true,
            max_retries: 2,
            retry_delay_ms: 0,
            auth_token: Some("top-secret".to_string()),
            tiers: HashMap::new(),
            api_key_envs: HashMap::new(),
            overrides: Default::default(),
            rate_limit_rpm: None,
        };
        for tier in crate::config::Tier::ALL {
            config.tiers.insert(tier, crate::config::TierModelConfig { primary: "openai/gpt-4o-mini".into(), fallback: None });
        }
        Arc::new(RouterState::new(config, 10, None))
    }

    async fn body_json(resp: axum::response::Response) -> Value {
        let bytes = axum::body::to_bytes(resp.into_body(), 1024 * 1024).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_reports_enabled_and_dry_run() {
        let resp = router(state()).oneshot(HttpRequest::get("/health").body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["enabled"], true);
        assert_eq!(body["dryRun"], false);
    }

    #[tokio::test]
    async fn config_redacts_auth_token() {
        let resp = router(state()).oneshot(HttpRequest::get("/api/config").body(Body::empty()).unwrap()).await.unwrap();
        let body = body_json(resp).await;
        assert_eq!(body["auth_token"], REDACTED);
    }

    #[tokio::test]
    async fn enable_disable_toggle_config() {
        let s = state();
        let resp = router(s.clone())
            .oneshot(HttpRequest::post("/api/disable").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(!s.config.load().enabled);

        router(s.clone()).oneshot(HttpRequest::post("/api/enable").body(Body::empty()).unwrap()).await.unwrap();
        assert!(s.config.load().enabled);
    }

    #[tokio::test]
    async fn dry_run_toggle_updates_config() {
        let s = state();
        router(s.clone())
            .oneshot(HttpRequest::post("/api/dry-run/enable").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert!(s.config.load().dry_run);
    }

    #[tokio::test]
    async fn global_override_set_and_clear() {
        let s = state();
        let req = HttpRequest::post("/api/override/global")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"model":"openai/gpt-4o"}"#))
            .unwrap();
        router(s.clone()).oneshot(req).await.unwrap();
        assert_eq!(s.config.load().overrides.global_force_model.as_deref(), Some("openai/gpt-4o"));

        let req = HttpRequest::post("/api/override/global")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"enabled":false}"#))
            .unwrap();
        router(s.clone()).oneshot(req).await.unwrap();
        assert!(s.config.load().overrides.global_force_model.is_none());
    }

    #[tokio::test]
    async fn session_override_upsert_and_delete() {
        let s = state();
        let req = HttpRequest::post("/api/override/session")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"sessionId":"sess-1","model":"anthropic/claude-sonnet-4-5","turns":3}"#))
            .unwrap();
        router(s.clone()).oneshot(req).await.unwrap();
        let session = s.config.load().overrides.sessions.get("sess-1").cloned().unwrap();
        assert_eq!(session.remaining_turns, 3);

        let req = HttpRequest::delete("/api/override/session")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"sessionId":"sess-1"}"#))
            .unwrap();
        router(s.clone()).oneshot(req).await.unwrap();
        assert!(s.config.load().overrides.sessions.get("sess-1").is_none());
    }

    #[tokio::test]
    async fn session_override_defaults_to_unbounded_turns() {
        let s = state();
        let req = HttpRequest::post("/api/override/session")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"sessionId":"sess-2","model":"anthropic/claude-sonnet-4-5"}"#))
            .unwrap();
        router(s.clone()).oneshot(req).await.unwrap();
        let session = s.config.load().overrides.sessions.get("sess-2").cloned().unwrap();
        assert_eq!(session.remaining_turns, u32::MAX);
    }

    #[tokio::test]
    async fn unknown_route_returns_404() {
        let resp = router(state()).oneshot(HttpRequest::get("/nope").body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
