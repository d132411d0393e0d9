//! Client-facing API — the listener agents/applications talk to (§6.1).
//!
//! Thin HTTP layer: classification, routing, and execution all live in
//! [`crate::classifier`], [`crate::router`], and [`crate::executor`].
//! Handlers translate between HTTP and those pure/async building blocks.

use std::sync::Arc;
use std::time::Instant;

use axum::{
    body::Body,
    extract::{Request, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use serde_json::{json, Value};

use crate::catalog;
use crate::classifier::{self, ChatCompletionRequest};
use crate::error::AppError;
use crate::executor::{self, ExecutionBody};
use crate::router::{self, RouterState};

const SESSION_HEADER: &str = "x-session-id";

pub fn router(state: Arc<RouterState>) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/messages", post(unsupported_messages_format))
        .with_state(state)
}

/// `POST /v1/messages` — always a placeholder 400; Anthropic's native wire
/// shape is not accepted directly, only via OpenAI-shaped requests routed
/// to an Anthropic-backed tier (§6.1).
async fn unsupported_messages_format() -> impl IntoResponse {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({
            "error": {
                "message": "the /v1/messages wire format is not supported; send an OpenAI-shaped request to /v1/chat/completions",
                "type": "proxy_error",
                "code": "unsupported_format",
            }
        })),
    )
}

/// `POST /v1/chat/completions` — classify, route, execute, and decorate the
/// response with `X-ClawRoute-*` headers (§4.2–§4.6).
async fn chat_completions(State(state): State<Arc<RouterState>>, req: axum::http::Request<Body>) -> Result<Response, AppError> {
    let session_id = req
        .headers()
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let bytes = axum::body::to_bytes(req.into_body(), 16 * 1024 * 1024)
        .await
        .map_err(|e| AppError::bad_request(format!("failed to read request body: {e}")))?;
    let request: ChatCompletionRequest = serde_json::from_slice(&bytes).map_err(|e| AppError::bad_request(format!("invalid request body: {e}")))?;

    let start = Instant::now();
    let config = state.config.load();
    let original_model = request.model.clone();

    // §7 "core internal error" / P10 fail-open: classify+route are pure and
    // infallible in normal operation, but if either ever panics, the panic
    // is caught here and converted into a plain pass-through decision for
    // the originally requested model rather than tearing down the request
    // task or surfacing a 500 for something neither side actually did wrong.
    let decision = match std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        let classification = classifier::classify(&request, config.conservative_mode, config.tool_aware_escalation);
        // §4.3 rule 5: the output side of the savings estimate is capped at
        // 4000 tokens regardless of how large the input estimate is.
        let estimated_output_tokens = classification.estimated_input_tokens.min(4000);
        router::route(&config, &original_model, &classification, session_id.as_deref(), classification.estimated_input_tokens, estimated_output_tokens)
    })) {
        Ok(decision) => decision,
        Err(_) => {
            tracing::error!(model = %original_model, "classifier/router panicked; failing open to the originally requested model");
            router::RoutingDecision {
                model: original_model.clone(),
                intended_model: original_model.clone(),
                tier: crate::config::Tier::Moderate,
                reason: "core_internal_error_fail_open",
                confidence: 0.0,
                dry_run: false,
                overridden: false,
                is_passthrough: true,
                estimated_savings_usd: 0.0,
                safe_to_retry: false,
                consumed_session: None,
            }
        }
    };

    if let Some(sid) = &decision.consumed_session {
        let updated = router::consume_session_turn(&config, sid);
        state.config.store(updated);
    }

    if request.stream {
        let (outcome, entry) = executor::execute_streaming(&config, &request, &original_model, &decision).await?;
        return Ok(stream_response(state, outcome, entry, start, session_id, decision.overridden));
    }

    let (outcome, mut entry) = executor::execute_buffered(&config, &request, &original_model, &decision).await?;
    entry.session_id = session_id;
    entry.response_time_ms = start.elapsed().as_millis() as u64;

    let ExecutionBody::Buffered(body_text) = outcome.body else {
        unreachable!("execute_buffered always returns a buffered body");
    };

    // §4.5 step 3: prefer the upstream's own token counts over the
    // pre-flight estimate when `usage` is present in the response.
    if let Some(prompt_tokens) = extract_usage_field(&body_text, "prompt_tokens") {
        entry.input_tokens = prompt_tokens;
    }
    let output_tokens = extract_usage_field(&body_text, "completion_tokens").unwrap_or(0);
    entry.output_tokens = output_tokens;
    entry.original_cost_usd = catalog::cost(&original_model, entry.input_tokens, output_tokens);
    entry.actual_cost_usd = catalog::cost(&outcome.final_model, entry.input_tokens, output_tokens);
    // P4: savings is never negative even when an escalation cost more.
    entry.savings_usd = (entry.original_cost_usd - entry.actual_cost_usd).max(0.0);

    state.traffic.push(entry);

    let mut response = (outcome.status, body_text).into_response();
    decorate(&mut response, &outcome.final_model, decision.tier, outcome.escalated);
    response.headers_mut().insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
    Ok(response)
}

fn stream_response(state: Arc<RouterState>, outcome: crate::executor::ExecutionOutcome, mut entry: crate::traffic::TrafficEntry, start: Instant, session_id: Option<String>, overridden: bool) -> Response {
    let crate::executor::ExecutionBody::Streaming(body_stream, observation_rx) = outcome.body else {
        unreachable!("execute_streaming always returns a streaming body");
    };

    entry.session_id = session_id;
    entry.overridden = overridden;
    let final_model = outcome.final_model.clone();
    let original_model = entry.original_model.clone();
    let estimated_input_tokens = entry.input_tokens;
    let tier = entry.tier;
    let traffic = Arc::clone(&state.traffic);

    tokio::spawn(async move {
        let elapsed_ms = start.elapsed().as_millis() as u64;
        entry.response_time_ms = elapsed_ms;
        if let Ok(obs) = observation_rx.await {
            // §4.5 step 3: prefer the upstream's own `usage` counts over
            // the pre-flight estimate when the stream's final frame sent them.
            let input_tokens = obs.input_tokens.unwrap_or(estimated_input_tokens);
            let output_tokens = obs.estimated_output_tokens();
            entry.input_tokens = input_tokens;
            entry.output_tokens = output_tokens;
            entry.had_tool_calls = entry.had_tool_calls || obs.had_tool_calls;
            entry.original_cost_usd = catalog::cost(&original_model, input_tokens, output_tokens);
            entry.actual_cost_usd = catalog::cost(&final_model, input_tokens, output_tokens);
            entry.savings_usd = (entry.original_cost_usd - entry.actual_cost_usd).max(0.0);
            if obs.read_error {
                entry.success = false;
                entry.error = Some("stream_read_error".to_string());
            }
        }
        traffic.push(entry);
    });

    let mut response = Response::new(Body::from_stream(body_stream));
    *response.status_mut() = outcome.status;
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
    decorate(&mut response, &outcome.final_model, tier, outcome.escalated);
    response
}

fn decorate(response: &mut Response, model: &str, tier: crate::config::Tier, escalated: bool) {
    let headers = response.headers_mut();
    if let Ok(v) = HeaderValue::from_str(model) {
        headers.insert("x-clawroute-model", v);
    }
    if let Ok(v) = HeaderValue::from_str(&tier.to_string()) {
        headers.insert("x-clawroute-tier", v);
    }
    headers.insert("x-clawroute-escalated", HeaderValue::from_static(if escalated { "true" } else { "false" }));
}

/// Best-effort `usage.<field>` extraction from a buffered response body
/// (`prompt_tokens` or `completion_tokens`), for cost accounting (§6.6).
/// Absent or malformed usage simply yields `None`, never an error — cost
/// accounting is advisory.
fn extract_usage_field(body_text: &str, field: &str) -> Option<u64> {
    let value: Value = serde_json::from_str(body_text).ok()?;
    value.pointer(&format!("/usage/{field}")).and_then(Value::as_u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_both_usage_fields_when_present() {
        let body = r#"{"choices":[],"usage":{"prompt_tokens":123,"completion_tokens":45}}"#;
        assert_eq!(extract_usage_field(body, "prompt_tokens"), Some(123));
        assert_eq!(extract_usage_field(body, "completion_tokens"), Some(45));
    }

    #[test]
    fn missing_usage_yields_none() {
        let body = r#"{"choices":[]}"#;
        assert_eq!(extract_usage_field(body, "prompt_tokens"), None);
    }
}
