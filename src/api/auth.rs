//! Shared Bearer/`?token=` authentication middleware (§6.4).
//!
//! Applied to both the client listener (`/v1/*`) and the admin listener
//! (`/api/*`, `/health`, `/stats`, `/metrics`) — a single check instead of
//! the teacher's separate `client_auth`/`admin_auth` middlewares, since the
//! spec defines one `auth_token` guarding both surfaces rather than
//! per-client keys and a distinct admin secret.
//!
//! When `Configuration.auth_token` is unset, the middleware is a no-op:
//! "missing config means open on localhost" (§6.4).

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::router::RouterState;

/// Axum middleware: requires `Authorization: Bearer <token>` (case-insensitive
/// scheme) or `?token=<token>` when `state.config.auth_token` is set.
pub async fn require_token(State(state): State<Arc<RouterState>>, req: Request, next: Next) -> Response {
    let config = state.config.load();
    let Some(expected) = &config.auth_token else {
        return next.run(req).await;
    };

    if token_matches(&req, expected) {
        return next.run(req).await;
    }

    unauthorized()
}

fn token_matches(req: &Request, expected: &str) -> bool {
    let bearer = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| {
            let mut parts = v.splitn(2, ' ');
            let scheme = parts.next()?;
            let value = parts.next()?;
            scheme.eq_ignore_ascii_case("bearer").then_some(value)
        });
    if bearer == Some(expected) {
        return true;
    }

    req.uri()
        .query()
        .and_then(|q| {
            url_query_pairs(q).find_map(|(k, v)| (k == "token").then_some(v))
        })
        .is_some_and(|v| v == expected)
}

/// Minimal `application/x-www-form-urlencoded`-style query parser — no
/// percent-decoding beyond `+`-as-space, sufficient for an opaque token
/// value that a client controls.
fn url_query_pairs(query: &str) -> impl Iterator<Item = (&str, std::borrow::Cow<'_, str>)> {
    query.split('&').filter_map(|pair| {
        let mut parts = pair.splitn(2, '=');
        let key = parts.next()?;
        let value = parts.next().unwrap_or("");
        Some((key, std::borrow::Cow::Owned(value.replace('+', " "))))
    })
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({
            "error": {
                "message": "valid Authorization: Bearer <token> or ?token= required",
                "type": "proxy_error",
                "code": "unauthorized",
            }
        })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::Body,
        http::Request as HttpRequest,
        middleware,
        routing::get,
        Router,
    };
    use tower::ServiceExt;

    fn state_with_token(token: Option<&str>) -> Arc<RouterState> {
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
            auth_token: token.map(str::to_string),
            tiers: std::collections::HashMap::new(),
            api_key_envs: std::collections::HashMap::new(),
            overrides: Default::default(),
            rate_limit_rpm: None,
        };
        for tier in crate::config::Tier::ALL {
            config.tiers.insert(tier, crate::config::TierModelConfig { primary: "openai/gpt-4o-mini".into(), fallback: None });
        }
        Arc::new(RouterState::new(config, 10, None))
    }

    async fn ok() -> &'static str {
        "ok"
    }

    fn app(state: Arc<RouterState>) -> Router {
        Router::new()
            .route("/", get(ok))
            .layer(middleware::from_fn_with_state(state.clone(), require_token))
            .with_state(state)
    }

    #[tokio::test]
    async fn no_token_configured_passes_through() {
        let resp = app(state_with_token(None))
            .oneshot(HttpRequest::get("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn missing_credentials_returns_401() {
        let resp = app(state_with_token(Some("secret")))
            .oneshot(HttpRequest::get("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn valid_bearer_header_passes() {
        let resp = app(state_with_token(Some("secret")))
            .oneshot(HttpRequest::get("/").header("authorization", "Bearer secret").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn bearer_scheme_is_case_insensitive() {
        let resp = app(state_with_token(Some("secret")))
            .oneshot(HttpRequest::get("/").header("authorization", "bearer secret").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn valid_query_token_passes() {
        let resp = app(state_with_token(Some("secret")))
            .oneshot(HttpRequest::get("/?token=secret").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn wrong_token_is_rejected() {
        let resp = app(state_with_token(Some("secret")))
            .oneshot(HttpRequest::get("/?token=nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }
}
