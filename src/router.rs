//! Router — §4.3: resolves a classified request to a concrete model.
//!
//! Rule order: disabled passthrough, global override, session override,
//! tier-based primary/fallback resolution by key availability, then the
//! dry-run overwrite and savings estimate. Generalizes the teacher's
//! `RouterState`/`route` pair (`router.rs`) from a fixed tier ladder to
//! the spec's five-tier model with overrides.

use std::sync::Arc;
use std::time::Instant;

use crate::api::rate_limit::RateLimiter;
use crate::catalog;
use crate::classifier::ClassificationResult;
use crate::config::{Configuration, SessionOverride, SharedConfig, Tier};
use crate::traffic::TrafficLog;

/// Shared application state injected into every request handler.
pub struct RouterState {
    pub config: SharedConfig,
    pub traffic: Arc<TrafficLog>,
    pub started_at: Instant,
    pub rate_limiter: Option<RateLimiter>,
    /// Path to the config file this state was loaded from, for the
    /// hot-reload watcher. `None` when running from bundled defaults only.
    pub config_path: Option<std::path::PathBuf>,
}

impl RouterState {
    pub fn new(config: Configuration, traffic_capacity: usize, config_path: Option<std::path::PathBuf>) -> Self {
        let rate_limiter = config.rate_limit_rpm.map(RateLimiter::new);
        Self {
            config: SharedConfig::new(config),
            traffic: Arc::new(TrafficLog::new(traffic_capacity)),
            started_at: Instant::now(),
            rate_limiter,
            config_path,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RoutingDecision {
    /// Model the Executor should actually dispatch to. Equal to
    /// `intended_model` unless `dry_run` is set, in which case it is the
    /// original client-requested model (dry-run never changes behavior,
    /// only reports what would have happened).
    pub model: String,
    /// Model the tier/override resolution chose, regardless of dry-run.
    pub intended_model: String,
    pub tier: Tier,
    pub reason: &'static str,
    pub confidence: f64,
    pub dry_run: bool,
    pub overridden: bool,
    /// True when the request is dispatched to `originalModel` unmodified
    /// because routing declined to act — disabled, or no provider key was
    /// available anywhere for the resolved tier (§3, §4.3 rule 3, P6).
    pub is_passthrough: bool,
    pub estimated_savings_usd: f64,
    /// Carried straight from the classification (§4.2): necessary but not
    /// sufficient for the executor to actually retry on a dispatch failure.
    pub safe_to_retry: bool,
    /// Session id whose `remaining_turns` should be decremented by the
    /// caller after this decision is made, if a session override fired.
    pub consumed_session: Option<String>,
}

/// Resolve a classified request to a routing decision (§4.3).
///
/// Pure with respect to `config` — session-turn decrementing is the
/// caller's responsibility (via `consumed_session`), since `Configuration`
/// snapshots are immutable once loaded from the `ArcSwap`.
pub fn route(config: &Configuration, original_model: &str, classification: &ClassificationResult, session_id: Option<&str>, estimated_input_tokens: u64, estimated_output_tokens: u64) -> RoutingDecision {
    if !config.enabled {
        return RoutingDecision {
            model: original_model.to_string(),
            intended_model: original_model.to_string(),
            tier: classification.tier,
            reason: "disabled_passthrough",
            confidence: classification.confidence,
            dry_run: false,
            overridden: false,
            is_passthrough: true,
            estimated_savings_usd: 0.0,
            safe_to_retry: classification.safe_to_retry,
            consumed_session: None,
        };
    }

    let (mut intended_model, mut reason, overridden, consumed_session) =
        resolve_model(config, classification.tier, session_id);

    if overridden {
        reason = session_id
            .filter(|_| consumed_session.is_some())
            .map(|_| "session_override")
            .unwrap_or("global_override");
    }

    // §4.3 rule 3: primary, else fallback, else pass-through — no key
    // anywhere for the resolved tier means dispatching to `originalModel`
    // rather than a model we know will fail upstream auth.
    let is_passthrough = !overridden && reason == "no_provider_key_available";
    if is_passthrough {
        intended_model = original_model.to_string();
        reason = "no_provider_key_available_passthrough";
    }

    let savings = estimate_savings(original_model, &intended_model, estimated_input_tokens, estimated_output_tokens);
    let dry_run = config.dry_run;
    let model = if dry_run { original_model.to_string() } else { intended_model.clone() };

    RoutingDecision {
        model,
        intended_model,
        tier: classification.tier,
        reason,
        confidence: classification.confidence,
        dry_run,
        overridden,
        is_passthrough,
        estimated_savings_usd: savings,
        safe_to_retry: classification.safe_to_retry,
        consumed_session,
    }
}

/// Apply a previously-resolved session override's turn decrement, removing
/// the session entry once its budget is exhausted. Returns the updated
/// configuration snapshot to store back into the `ArcSwap`.
pub fn consume_session_turn(config: &Configuration, session_id: &str) -> Configuration {
    let mut updated = config.clone();
    if let Some(session) = updated.overrides.sessions.get_mut(session_id) {
        if session.remaining_turns <= 1 {
            updated.overrides.sessions.remove(session_id);
        } else {
            session.remaining_turns -= 1;
        }
    }
    updated
}

fn resolve_model(config: &Configuration, tier: Tier, session_id: Option<&str>) -> (String, &'static str, bool, Option<String>) {
    if let Some(forced) = &config.overrides.global_force_model {
        return (forced.clone(), "global_override", true, None);
    }

    if let Some(sid) = session_id {
        if let Some(SessionOverride { model, .. }) = config.overrides.sessions.get(sid) {
            return (model.clone(), "session_override", true, Some(sid.to_string()));
        }
    }

    let (model, reason) = resolve_tier_model(config, tier);
    (model, reason, false, None)
}

/// Pick the model for `tier` by primary/fallback key availability, ignoring
/// overrides. Used both by the top-level `route` and by the Executor's
/// escalation step, which moves up the tier ladder without re-applying
/// global/session overrides.
pub fn resolve_tier_model(config: &Configuration, tier: Tier) -> (String, &'static str) {
    let Some(tier_cfg) = config.tiers.get(&tier) else {
        return ("openai/gpt-4o-mini".to_string(), "missing_tier_config_fallback");
    };

    if provider_has_key(config, &tier_cfg.primary) {
        return (tier_cfg.primary.clone(), "tier_primary");
    }
    if let Some(fallback) = &tier_cfg.fallback {
        if provider_has_key(config, fallback) {
            return (fallback.clone(), "tier_fallback_key_unavailable_on_primary");
        }
    }
    // Neither primary nor fallback has an available key — use primary anyway
    // and let the executor surface the upstream auth failure.
    (tier_cfg.primary.clone(), "no_provider_key_available")
}

fn provider_has_key(config: &Configuration, model_id: &str) -> bool {
    config.api_key_for(catalog::provider_of(model_id)).is_some()
}

/// Estimated USD savings vs. sending the original model unmodified.
/// Clamped to zero per §4.3 rule 5 (`max(0, cost(original) - cost(routed))`)
/// and P4 — an escalation that costs more than the original is never
/// reported as a negative saving.
fn estimate_savings(original_model: &str, routed_model: &str, input_tokens: u64, output_tokens: u64) -> f64 {
    let original_cost = catalog::cost(original_model, input_tokens, output_tokens);
    let routed_cost = catalog::cost(routed_model, input_tokens, output_tokens);
    (original_cost - routed_cost).max(0.0)
}
