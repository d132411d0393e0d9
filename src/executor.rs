//! Executor — §4.5: dispatches a routed request, retrying/escalating on
//! validation failure within a bounded attempt budget.
//!
//! State machine per attempt: `Routed -> Dispatching -> {Validated,
//! InvalidRetriable, InvalidTerminal, Streaming, Error}`. Three rules bound
//! the loop:
//!
//! - **R1 (streaming commitment).** Once a streaming response's headers
//!   arrive with a 2xx status, the Executor commits — no further retries,
//!   even if the body later turns out malformed.
//! - **R2 (tool-call immutability).** Once a response carries `tool_calls`,
//!   it is never retried or escalated away, even if otherwise borderline —
//!   tool calls may already be in flight on the client side.
//! - **R3 (fail-open).** If every tier escalation is exhausted and
//!   `always_fallback_to_original` is set, the Executor makes one final
//!   attempt against the client's originally-requested model before
//!   surfacing an error.
//!
//! Grounded in the teacher's `backends/mod.rs` dispatch enum and
//! `router.rs`'s escalate loop, generalized from a fixed two-tier ladder to
//! the spec's bounded `max_retries + 1` attempt budget with full tier
//! escalation.

use reqwest::StatusCode;
use serde_json::Value;

use crate::backends::{BackendClient, SseStream};
use crate::catalog;
use crate::classifier::ChatCompletionRequest;
use crate::config::{Configuration, Tier};
use crate::router::RoutingDecision;
use crate::stream::{self, StreamObservation};
use crate::traffic::TrafficEntry;
use crate::validator::{self, Validity};

pub enum ExecutionBody {
    Buffered(String),
    Streaming(SseStream, tokio::sync::oneshot::Receiver<StreamObservation>),
}

pub struct ExecutionOutcome {
    pub status: StatusCode,
    pub body: ExecutionBody,
    pub final_model: String,
    pub escalated: bool,
}

/// One attempt's outcome, folded into the retry/escalation loop below.
enum Attempt {
    /// Usable response, stop. Also used for the "return as-is" cases in
    /// §4.5 step 3 (tool calls observed, or `safeToRetry` is false).
    Done { status: StatusCode, body: String, had_tool_calls: bool },
    /// Worth retrying or escalating.
    Retry,
    /// Not worth retrying; carries the response to surface if escalation
    /// is also exhausted.
    Terminal { status: StatusCode, body: String },
    /// A dispatch-level failure (no response at all) where `safeToRetry`
    /// is false — stop the retry loop immediately without recording a
    /// response, but still eligible for the R3 fail-open attempt.
    Stop,
}

/// Execute a non-streaming request starting from `decision`, retrying and
/// escalating per §4.5 until a valid response, a terminal failure, or the
/// attempt budget is exhausted.
pub async fn execute_buffered(config: &Configuration, request: &ChatCompletionRequest, original_model: &str, decision: &RoutingDecision) -> anyhow::Result<(ExecutionOutcome, TrafficEntry)> {
    let mut entry = TrafficEntry::new(original_model.to_string(), decision.intended_model.clone(), decision.tier, decision.reason, decision.confidence)
        .with_dry_run(decision.dry_run)
        .with_overridden(decision.overridden);
    entry.input_tokens = estimate_request_tokens(request);

    let mut current_model = decision.model.clone();
    let mut current_tier = decision.tier;
    let mut escalated = false;
    let mut last_status = StatusCode::BAD_GATEWAY;
    let mut last_body = String::new();

    let max_attempts = config.max_retries + 1;

    for attempt in 0..max_attempts {
        match attempt_once(config, &current_model, request, decision.safe_to_retry).await {
            Attempt::Done { status, body, had_tool_calls } => {
                entry.had_tool_calls = had_tool_calls;
                if escalated {
                    entry = entry.mark_escalated(&current_model);
                }
                return Ok((
                    ExecutionOutcome { status, body: ExecutionBody::Buffered(body), final_model: current_model, escalated },
                    entry,
                ));
            }
            Attempt::Terminal { status, body } => {
                last_status = status;
                last_body = body;
                break;
            }
            Attempt::Stop => {
                last_status = StatusCode::BAD_GATEWAY;
                break;
            }
            Attempt::Retry => {
                last_status = StatusCode::BAD_GATEWAY;
                if attempt + 1 < max_attempts {
                    if let Some((next_tier, next_model)) = next_escalation(config, current_tier) {
                        current_tier = next_tier;
                        current_model = next_model;
                        escalated = true;
                        if config.retry_delay_ms > 0 {
                            tokio::time::sleep(std::time::Duration::from_millis(config.retry_delay_ms)).await;
                        }
                        continue;
                    }
                }
                break;
            }
        }
    }

    // R3: fail open to the client's originally-requested model, once.
    if config.always_fallback_to_original && current_model != original_model {
        if let Attempt::Done { status, body, had_tool_calls } = attempt_once(config, original_model, request, decision.safe_to_retry).await {
            entry = entry.with_error("escalation_exhausted_fell_back_to_original");
            entry = entry.mark_escalated(original_model);
            entry.had_tool_calls = had_tool_calls;
            return Ok((
                ExecutionOutcome { status, body: ExecutionBody::Buffered(body), final_model: original_model.to_string(), escalated: true },
                entry,
            ));
        }
    }

    entry = entry.with_error("all_attempts_exhausted");
    if escalated {
        entry = entry.mark_escalated(&current_model);
    }
    Ok((
        ExecutionOutcome { status: last_status, body: ExecutionBody::Buffered(last_body), final_model: current_model, escalated },
        entry,
    ))
}

/// Dispatch once to `model` and classify the result for the retry loop
/// (§4.5 steps 2-3). A dispatch-level failure (missing key, network error)
/// is retriable only when `safe_to_retry` — otherwise the loop stops
/// immediately rather than trying another model with an in-flight side
/// effect risk still on the table.
async fn attempt_once(config: &Configuration, model: &str, request: &ChatCompletionRequest, safe_to_retry: bool) -> Attempt {
    let provider = catalog::provider_of(model);
    let Some(api_key) = config.api_key_for(provider) else {
        return if safe_to_retry { Attempt::Retry } else { Attempt::Stop };
    };
    let Ok(client) = BackendClient::new(provider, &api_key) else {
        return if safe_to_retry { Attempt::Retry } else { Attempt::Stop };
    };
    let body = request_body_for(request, model);

    let (status, body_text) = match client.chat_completions(&body).await {
        Ok(pair) => pair,
        Err(_) => return if safe_to_retry { Attempt::Retry } else { Attempt::Stop },
    };

    match validator::validate(status, &body_text, request, tier_for_model(config, model)) {
        res if res.validity == Validity::Valid => Attempt::Done { status, body: body_text, had_tool_calls: res.had_tool_calls },
        // R2: a tool call is never retried away, regardless of validity.
        res if res.had_tool_calls => Attempt::Done { status, body: body_text, had_tool_calls: true },
        // safeToRetry false: return the response as-is rather than retry.
        _ if !safe_to_retry => Attempt::Done { status, body: body_text, had_tool_calls: false },
        res if res.validity == Validity::InvalidTerminal => Attempt::Terminal { status, body: body_text },
        _ => Attempt::Retry,
    }
}

/// Find which configured tier `model` currently serves, for validator
/// context (the suspiciously-short-response heuristic is tier-gated).
/// Falls back to `Moderate` if the model isn't any tier's configured
/// primary/fallback (e.g. a global/session override or original-model
/// fail-open target).
fn tier_for_model(config: &Configuration, model: &str) -> Tier {
    for tier in Tier::ALL {
        if let Some(cfg) = config.tiers.get(&tier) {
            if cfg.primary == model || cfg.fallback.as_deref() == Some(model) {
                return tier;
            }
        }
    }
    Tier::Moderate
}

/// Execute a streaming request. Streaming bypasses mid-body retries (R1):
/// once the upstream responds with a 2xx status the Executor commits to
/// that stream. A pre-stream (connection/non-2xx) failure still escalates
/// exactly like the buffered path.
pub async fn execute_streaming(config: &Configuration, request: &ChatCompletionRequest, original_model: &str, decision: &RoutingDecision) -> anyhow::Result<(ExecutionOutcome, TrafficEntry)> {
    let mut entry = TrafficEntry::new(original_model.to_string(), decision.intended_model.clone(), decision.tier, decision.reason, decision.confidence)
        .with_dry_run(decision.dry_run)
        .with_overridden(decision.overridden);
    entry.input_tokens = estimate_request_tokens(request);

    let mut current_model = decision.model.clone();
    let mut current_tier = decision.tier;
    let mut escalated = false;

    let max_attempts = config.max_retries + 1;

    for attempt in 0..max_attempts {
        if let Some((status, upstream)) = try_stream(config, &current_model, request).await {
            // R1: commit to this stream, no further retries.
            if escalated {
                entry = entry.mark_escalated(&current_model);
            }
            let (forwarded, rx) = stream::observe(upstream);
            return Ok((
                ExecutionOutcome { status, body: ExecutionBody::Streaming(forwarded, rx), final_model: current_model, escalated },
                entry,
            ));
        }

        if !decision.safe_to_retry {
            break;
        }

        if attempt + 1 < max_attempts {
            if let Some((next_tier, next_model)) = next_escalation(config, current_tier) {
                current_tier = next_tier;
                current_model = next_model;
                escalated = true;
                if config.retry_delay_ms > 0 {
                    tokio::time::sleep(std::time::Duration::from_millis(config.retry_delay_ms)).await;
                }
                continue;
            }
        }
        break;
    }

    if config.always_fallback_to_original && current_model != original_model {
        if let Some((status, upstream)) = try_stream(config, original_model, request).await {
            entry = entry.with_error("escalation_exhausted_fell_back_to_original");
            entry = entry.mark_escalated(original_model);
            let (forwarded, rx) = stream::observe(upstream);
            return Ok((
                ExecutionOutcome { status, body: ExecutionBody::Streaming(forwarded, rx), final_model: original_model.to_string(), escalated: true },
                entry,
            ));
        }
    }

    anyhow::bail!("streaming dispatch failed for every candidate model, including fail-open to {original_model}")
}

async fn try_stream(config: &Configuration, model: &str, request: &ChatCompletionRequest) -> Option<(StatusCode, SseStream)> {
    let provider = catalog::provider_of(model);
    let api_key = config.api_key_for(provider)?;
    let client = BackendClient::new(provider, &api_key).ok()?;
    let mut body = request_body_for(request, model);
    body["stream"] = Value::Bool(true);
    match client.chat_completions_stream(&body).await {
        Ok((status, upstream)) if status.is_success() => Some((status, upstream)),
        _ => None,
    }
}

fn request_body_for(request: &ChatCompletionRequest, model: &str) -> Value {
    let mut value = serde_json::to_value(request).unwrap_or_else(|_| serde_json::json!({}));
    value["model"] = Value::String(catalog::bare_model_name(model).to_string());
    value
}

/// Choose the next tier up whose primary or fallback has a non-empty
/// provider key (§4.5.1). Walks strictly upward past tiers with no
/// available key at all, rather than stopping at the immediate next tier;
/// returns `None` once `Frontier` is passed with no key found (P3).
fn next_escalation(config: &Configuration, tier: Tier) -> Option<(Tier, String)> {
    let mut candidate = tier.bump()?;
    loop {
        let (model, reason) = crate::router::resolve_tier_model(config, candidate);
        if reason != "no_provider_key_available" {
            return Some((candidate, model));
        }
        candidate = candidate.bump()?;
    }
}

fn estimate_request_tokens(request: &ChatCompletionRequest) -> u64 {
    request.messages.iter().map(|m| (m.text().chars().count() / 4) as u64 + 4).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Provider;
    use crate::classifier::ChatMessage;
    use crate::config::{Overrides, TierModelConfig};
    use std::collections::HashMap;

    fn request() -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: "gpt-4o".into(),
            messages: vec![ChatMessage { role: "user".into(), content: Some(serde_json::json!("hi")), tool_calls: None, extra: HashMap::new() }],
            stream: false,
            tools: None,
            tool_choice: None,
            extra: HashMap::new(),
        }
    }

    fn base_config(moderate_base: &str, complex_base: &str) -> Configuration {
        let mut tiers = HashMap::new();
        tiers.insert(Tier::Heartbeat, TierModelConfig { primary: "openai/gpt-4o-mini".into(), fallback: None });
        tiers.insert(Tier::Simple, TierModelConfig { primary: "openai/gpt-4o-mini".into(), fallback: None });
        tiers.insert(Tier::Moderate, TierModelConfig { primary: moderate_base.into(), fallback: None });
        tiers.insert(Tier::Complex, TierModelConfig { primary: complex_base.into(), fallback: None });
        tiers.insert(Tier::Frontier, TierModelConfig { primary: complex_base.into(), fallback: None });

        let mut api_key_envs = HashMap::new();
        api_key_envs.insert(Provider::OpenAI, "EXECUTOR_TEST_OPENAI_KEY".to_string());

        Configuration {
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
            auth_token: None,
            tiers,
            api_key_envs,
            overrides: Overrides::default(),
            rate_limit_rpm: None,
        }
    }

    fn decision_for(model: &str, tier: Tier) -> RoutingDecision {
        RoutingDecision {
            model: model.to_string(),
            intended_model: model.to_string(),
            tier,
            reason: "test",
            confidence: 0.8,
            dry_run: false,
            overridden: false,
            is_passthrough: false,
            estimated_savings_usd: 0.0,
            safe_to_retry: matches!(tier, Tier::Heartbeat | Tier::Simple),
            consumed_session: None,
        }
    }

    #[test]
    fn tier_for_model_finds_configured_tier() {
        let config = base_config("anthropic/claude-haiku-4-5", "anthropic/claude-sonnet-4-5");
        assert_eq!(tier_for_model(&config, "anthropic/claude-haiku-4-5"), Tier::Moderate);
        assert_eq!(tier_for_model(&config, "anthropic/claude-sonnet-4-5"), Tier::Complex);
    }

    #[test]
    fn tier_for_model_defaults_to_moderate_for_unknown_model() {
        let config = base_config("anthropic/claude-haiku-4-5", "anthropic/claude-sonnet-4-5");
        assert_eq!(tier_for_model(&config, "some/override-model"), Tier::Moderate);
    }

    #[test]
    fn next_escalation_bumps_tier_and_resolves_model() {
        let config = base_config("anthropic/claude-haiku-4-5", "anthropic/claude-sonnet-4-5");
        let (tier, model) = next_escalation(&config, Tier::Moderate).unwrap();
        assert_eq!(tier, Tier::Complex);
        assert_eq!(model, "anthropic/claude-sonnet-4-5");
    }

    #[test]
    fn next_escalation_returns_none_past_frontier() {
        let config = base_config("anthropic/claude-haiku-4-5", "anthropic/claude-sonnet-4-5");
        assert!(next_escalation(&config, Tier::Frontier).is_none());
    }

    #[test]
    fn next_escalation_skips_tiers_with_no_available_key() {
        // Complex/Frontier both point at an anthropic model and no anthropic
        // key is configured anywhere; escalating from Moderate must skip
        // straight past them rather than "escalating" to a keyless model.
        let config = base_config("openai/gpt-4o-mini", "anthropic/claude-sonnet-4-5");
        assert!(next_escalation(&config, Tier::Moderate).is_none());
    }

    #[test]
    fn next_escalation_skips_past_a_keyless_tier_to_one_with_a_key() {
        // Complex has no available key (anthropic, unset); Frontier reuses
        // the keyed openai model. Escalating from Moderate must walk past
        // Complex rather than stopping there.
        let mut config = base_config("anthropic/claude-haiku-4-5", "anthropic/claude-sonnet-4-5");
        config.tiers.insert(Tier::Frontier, TierModelConfig { primary: "openai/gpt-4o-mini".into(), fallback: None });
        std::env::set_var("EXECUTOR_TEST_OPENAI_KEY", "sk-test");
        let (tier, model) = next_escalation(&config, Tier::Moderate).unwrap();
        std::env::remove_var("EXECUTOR_TEST_OPENAI_KEY");
        assert_eq!(tier, Tier::Frontier);
        assert_eq!(model, "openai/gpt-4o-mini");
    }

    #[tokio::test]
    async fn missing_api_key_is_retriable_and_falls_open_to_original() {
        let config = base_config("anthropic/claude-haiku-4-5", "anthropic/claude-sonnet-4-5");
        // No anthropic key configured anywhere, and original model's provider
        // (openai, heuristically) also has no key -- every attempt should be
        // treated as retriable, exhausting escalation, then fail-open also
        // fails to resolve a key, surfacing as an error via bail!.
        let decision = decision_for("anthropic/claude-haiku-4-5", Tier::Moderate);
        let result = execute_buffered(&config, &request(), "gpt-4o", &decision).await;
        assert!(result.is_ok());
        let (outcome, entry) = result.unwrap();
        assert!(!entry.success);
        if let ExecutionBody::Buffered(_) = outcome.body {
        } else {
            panic!("expected buffered body");
        }
    }
}
