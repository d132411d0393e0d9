//! Configuration types for ClawRoute.
//!
//! Configuration is loaded once at startup — bundled field defaults,
//! layered with an optional TOML file, layered with environment variables
//! (§6.5) — and validated before either listener opens. Mutable runtime
//! state (`enabled`, `dry_run`, override tables) is split out into
//! [`RuntimeState`], which the rest of the proxy reaches through an
//! `arc_swap::ArcSwap` so admin toggles never block a request in flight.

use std::{collections::HashMap, path::Path};

use anyhow::Context;
use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};

use crate::catalog::Provider;

/// The five complexity tiers a request can be classified into, in
/// ascending order so the derived [`Ord`] matches the spec's total order
/// (`Heartbeat < Simple < Moderate < Complex < Frontier`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Heartbeat,
    Simple,
    Moderate,
    Complex,
    Frontier,
}

impl Tier {
    pub const ALL: [Tier; 5] = [
        Tier::Heartbeat,
        Tier::Simple,
        Tier::Moderate,
        Tier::Complex,
        Tier::Frontier,
    ];

    /// Tier immediately above this one, or `None` at `Frontier`.
    pub fn bump(self) -> Option<Tier> {
        match self {
            Tier::Heartbeat => Some(Tier::Simple),
            Tier::Simple => Some(Tier::Moderate),
            Tier::Moderate => Some(Tier::Complex),
            Tier::Complex => Some(Tier::Frontier),
            Tier::Frontier => None,
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Tier::Heartbeat => "heartbeat",
            Tier::Simple => "simple",
            Tier::Moderate => "moderate",
            Tier::Complex => "complex",
            Tier::Frontier => "frontier",
        })
    }
}

/// The primary/fallback model pair configured for one tier (§3, §4.3).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TierModelConfig {
    pub primary: String,
    #[serde(default)]
    pub fallback: Option<String>,
}

/// A per-session model override with a turn budget (§4.3, §9b).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SessionOverride {
    pub model: String,
    pub remaining_turns: u32,
}

/// Global and per-session routing overrides (§3).
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Overrides {
    #[serde(default)]
    pub global_force_model: Option<String>,
    #[serde(default)]
    pub sessions: HashMap<String, SessionOverride>,
}

/// The on-disk/env-layered configuration, validated once at startup.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Configuration {
    #[serde(default = "defaults::proxy_port")]
    pub proxy_port: u16,
    #[serde(default = "defaults::admin_port")]
    pub admin_port: u16,

    /// Listen address for both ports (§6.5's `CLAWROUTE_HOST`). Defaults to
    /// loopback — "missing config means open on localhost" (§6.4) only
    /// makes sense when the proxy isn't already bound to every interface.
    #[serde(default = "defaults::host")]
    pub host: String,

    /// Verbose logging toggle (§6.5's `CLAWROUTE_DEBUG`). Read directly from
    /// the environment in `main.rs` before `tracing_subscriber` initializes,
    /// but also captured here so `GET /api/config` reports it accurately.
    #[serde(default)]
    pub debug: bool,

    /// Gates whether prompt/response content is ever written to a log line.
    /// Must default to `false` (§6.5) — no call site in this proxy logs
    /// message content unless this is explicitly set.
    #[serde(default)]
    pub log_content: bool,

    /// Days of traffic history the in-memory ring buffer is sized for
    /// (used to size `TrafficLog`'s capacity, not a durable retention SLA).
    #[serde(default = "defaults::retention_days")]
    pub retention_days: u32,

    /// Classifier confidence below which conservative mode escalates (§4.2).
    #[serde(default = "defaults::min_confidence")]
    pub min_confidence: f64,

    #[serde(default = "defaults::bool_true")]
    pub enabled: bool,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default = "defaults::bool_true")]
    pub tool_aware_escalation: bool,
    #[serde(default)]
    pub conservative_mode: bool,
    #[serde(default = "defaults::bool_true")]
    pub always_fallback_to_original: bool,

    #[serde(default = "defaults::max_retries")]
    pub max_retries: u32,
    #[serde(default = "defaults::retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Bearer token required on both listeners. `None` disables auth
    /// entirely (only sane when both ports are firewalled).
    #[serde(default)]
    pub auth_token: Option<String>,

    #[serde(default = "defaults::tiers")]
    pub tiers: HashMap<Tier, TierModelConfig>,

    /// Provider -> env var name holding that provider's API key. Mirrors
    /// the teacher's `key_env` indirection so secrets never live in the
    /// config file itself. Defaults to `<PROVIDER>_API_KEY` per §6.5's
    /// table; a config file may remap a provider to a differently-named
    /// variable but rarely needs to.
    #[serde(default = "defaults::api_key_envs")]
    pub api_key_envs: HashMap<Provider, String>,

    #[serde(default)]
    pub overrides: Overrides,

    /// Per-IP requests/minute limit on both listeners. `None` disables
    /// rate limiting entirely.
    #[serde(default)]
    pub rate_limit_rpm: Option<u32>,
}

impl Configuration {
    /// Load bundled defaults, overlay an optional TOML file, overlay
    /// environment variables (§6.5's layering order).
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut config: Self = match path {
            Some(p) if p.exists() => {
                let content = std::fs::read_to_string(p)
                    .with_context(|| format!("reading {}", p.display()))?;
                toml::from_str(&content).context("parsing config TOML")?
            }
            _ => toml::from_str("").context("building default configuration")?,
        };
        config.apply_env_overrides();
        config.validate()?;
        // §3: "at least one provider key is non-empty at startup, else
        // startup fails" — a configuration error, so this is fatal here
        // rather than a soft warning at the call site.
        anyhow::ensure!(config.has_any_provider_key(), "no provider API key is set in the environment (checked {:?}) — at least one is required at startup", config.api_key_envs.values().collect::<Vec<_>>());
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        // §6.5's canonical name. CLAWROUTE_PROXY_PORT is kept as a fallback
        // for configs written before the admin port grew its own variable.
        if let Ok(v) = std::env::var("CLAWROUTE_PORT").or_else(|_| std::env::var("CLAWROUTE_PROXY_PORT")) {
            if let Ok(p) = v.parse() {
                self.proxy_port = p;
            }
        }
        if let Ok(v) = std::env::var("CLAWROUTE_ADMIN_PORT") {
            if let Ok(p) = v.parse() {
                self.admin_port = p;
            }
        }
        if let Ok(v) = std::env::var("CLAWROUTE_HOST") {
            self.host = v;
        }
        // §6.5's canonical name. CLAWROUTE_AUTH_TOKEN is kept as a fallback
        // for configs written before the variable was renamed.
        if let Ok(v) = std::env::var("CLAWROUTE_TOKEN").or_else(|_| std::env::var("CLAWROUTE_AUTH_TOKEN")) {
            self.auth_token = Some(v);
        }
        if let Ok(v) = std::env::var("CLAWROUTE_ENABLED") {
            self.enabled = v == "1" || v.eq_ignore_ascii_case("true");
        }
        if let Ok(v) = std::env::var("CLAWROUTE_DRY_RUN") {
            self.dry_run = v == "1" || v.eq_ignore_ascii_case("true");
        }
        if let Ok(v) = std::env::var("CLAWROUTE_DEBUG") {
            self.debug = v == "1" || v.eq_ignore_ascii_case("true");
        }
        if let Ok(v) = std::env::var("CLAWROUTE_LOG_CONTENT") {
            self.log_content = v == "1" || v.eq_ignore_ascii_case("true");
        }
        if let Ok(v) = std::env::var("CLAWROUTE_CONSERVATIVE_MODE") {
            self.conservative_mode = v == "1" || v.eq_ignore_ascii_case("true");
        }
    }

    /// Validate the tier ladder and scalar ranges (§3's invariants).
    fn validate(&self) -> anyhow::Result<()> {
        for tier in Tier::ALL {
            let cfg = self
                .tiers
                .get(&tier)
                .with_context(|| format!("tier `{tier}` has no model configuration"))?;
            anyhow::ensure!(!cfg.primary.is_empty(), "tier `{tier}` has an empty primary model");
            // §3: "for every tier, both primary and fallback are non-empty
            // strings" — fallback is `Option` only to let executor escalation
            // treat a missing fallback distinctly from a configured one, but
            // a well-formed config always supplies both.
            match &cfg.fallback {
                Some(f) => anyhow::ensure!(!f.is_empty(), "tier `{tier}` has an empty fallback model"),
                None => anyhow::bail!("tier `{tier}` has no fallback model configured"),
            }
        }
        anyhow::ensure!(
            (1..=65535).contains(&self.proxy_port),
            "proxy_port must be in 1..=65535, got {}",
            self.proxy_port
        );
        anyhow::ensure!(
            (1..=65535).contains(&self.admin_port),
            "admin_port must be in 1..=65535, got {}",
            self.admin_port
        );
        anyhow::ensure!(self.retention_days >= 1, "retention_days must be >= 1");
        anyhow::ensure!(
            (0.0..=1.0).contains(&self.min_confidence),
            "min_confidence must be in 0.0..=1.0, got {}",
            self.min_confidence
        );
        Ok(())
    }

    /// True if at least one provider has a usable API key in the
    /// environment. The proxy refuses to start with zero usable keys.
    pub fn has_any_provider_key(&self) -> bool {
        self.resolved_api_keys().next().is_some()
    }

    /// Resolve every configured `api_key_envs` entry against the process
    /// environment, yielding only the providers whose env var is set and
    /// non-empty.
    pub fn resolved_api_keys(&self) -> impl Iterator<Item = (Provider, String)> + '_ {
        self.api_key_envs.iter().filter_map(|(provider, env_var)| {
            std::env::var(env_var)
                .ok()
                .filter(|v| !v.is_empty())
                .map(|v| (*provider, v))
        })
    }

    pub fn api_key_for(&self, provider: Provider) -> Option<String> {
        let env_var = self.api_key_envs.get(&provider)?;
        std::env::var(env_var).ok().filter(|v| !v.is_empty())
    }
}

/// Live, swappable wrapper around [`Configuration`] (§5's shared-resource
/// policy: reads never block writers and vice versa).
pub struct SharedConfig(ArcSwap<Configuration>);

impl SharedConfig {
    pub fn new(config: Configuration) -> Self {
        Self(ArcSwap::from_pointee(config))
    }

    pub fn load(&self) -> arc_swap::Guard<std::sync::Arc<Configuration>> {
        self.0.load()
    }

    pub fn store(&self, config: Configuration) {
        self.0.store(std::sync::Arc::new(config));
    }
}

mod defaults {
    use super::{HashMap, Provider, Tier, TierModelConfig};

    pub fn proxy_port() -> u16 {
        8088
    }
    pub fn admin_port() -> u16 {
        8089
    }
    pub fn host() -> String {
        "127.0.0.1".to_string()
    }
    pub fn retention_days() -> u32 {
        7
    }
    pub fn min_confidence() -> f64 {
        0.5
    }
    pub fn bool_true() -> bool {
        true
    }
    pub fn max_retries() -> u32 {
        2
    }
    pub fn retry_delay_ms() -> u64 {
        200
    }

    fn pair(primary: &str, fallback: &str) -> TierModelConfig {
        TierModelConfig { primary: primary.to_string(), fallback: Some(fallback.to_string()) }
    }

    /// Bundled tier ladder, present even with no config file or environment
    /// overlay at all (§6.5's "bundled defaults" layer). Matches the
    /// routing in spec.md §8's end-to-end scenarios: a cheap multimodal
    /// model for Heartbeat/Simple, scaling up through Anthropic's line for
    /// Moderate/Complex/Frontier, each with an OpenAI fallback.
    pub fn tiers() -> HashMap<Tier, TierModelConfig> {
        HashMap::from([
            (Tier::Heartbeat, pair("google/gemini-2.5-flash-lite", "openai/gpt-4o-mini")),
            (Tier::Simple, pair("google/gemini-2.5-flash", "openai/gpt-4o-mini")),
            (Tier::Moderate, pair("anthropic/claude-haiku-4-5", "openai/gpt-4o-mini")),
            (Tier::Complex, pair("anthropic/claude-sonnet-4-5", "openai/gpt-4o")),
            (Tier::Frontier, pair("anthropic/claude-opus-4-5", "openai/gpt-4o")),
        ])
    }

    /// Bundled `<PROVIDER>_API_KEY` environment variable names (§6.5's
    /// table), overridable per-provider from the config file.
    pub fn api_key_envs() -> HashMap<Provider, String> {
        Provider::all().into_iter().map(|p| (p, format!("{}_API_KEY", p.to_string().to_ascii_uppercase()))).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_toml() -> &'static str {
        r#"
        [tiers.heartbeat]
        primary = "google/gemini-2.5-flash-lite"
        fallback = "openai/gpt-4o-mini"

        [tiers.simple]
        primary = "openai/gpt-4o-mini"
        fallback = "google/gemini-2.5-flash-lite"

        [tiers.moderate]
        primary = "anthropic/claude-haiku-4-5"
        fallback = "openai/gpt-4o-mini"

        [tiers.complex]
        primary = "anthropic/claude-sonnet-4-5"
        fallback = "openai/gpt-4o"

        [tiers.frontier]
        primary = "anthropic/claude-opus-4-5"
        fallback = "openai/gpt-4o"

        [api_key_envs]
        anthropic = "TEST_ANTHROPIC_KEY_CLAWROUTE"
        "#
    }

    fn minimal_config() -> Configuration {
        toml::from_str(minimal_toml()).expect("minimal config should parse")
    }

    #[test]
    fn defaults_are_applied_when_sections_are_minimal() {
        let config = minimal_config();
        assert_eq!(config.proxy_port, 8088);
        assert_eq!(config.admin_port, 8089);
        assert_eq!(config.retention_days, 7);
        assert!(config.enabled);
        assert!(!config.dry_run);
    }

    #[test]
    fn validate_rejects_missing_tier() {
        let mut config = minimal_config();
        config.tiers.remove(&Tier::Frontier);
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_empty_primary_model() {
        let mut config = minimal_config();
        config.tiers.get_mut(&Tier::Simple).unwrap().primary.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_missing_fallback_model() {
        let mut config = minimal_config();
        config.tiers.get_mut(&Tier::Simple).unwrap().fallback = None;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_out_of_range_port() {
        let mut config = minimal_config();
        config.proxy_port = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_out_of_range_confidence() {
        let mut config = minimal_config();
        config.min_confidence = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_accepts_well_formed_config() {
        let config = minimal_config();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn tier_bump_reaches_frontier_then_stops() {
        assert_eq!(Tier::Heartbeat.bump(), Some(Tier::Simple));
        assert_eq!(Tier::Complex.bump(), Some(Tier::Frontier));
        assert_eq!(Tier::Frontier.bump(), None);
    }

    #[test]
    fn tier_ord_matches_spec_total_order() {
        assert!(Tier::Heartbeat < Tier::Simple);
        assert!(Tier::Simple < Tier::Moderate);
        assert!(Tier::Moderate < Tier::Complex);
        assert!(Tier::Complex < Tier::Frontier);
    }

    #[test]
    fn resolved_api_keys_skips_unset_env_vars() {
        let config = minimal_config();
        std::env::remove_var("TEST_ANTHROPIC_KEY_CLAWROUTE");
        assert!(!config.has_any_provider_key());
        std::env::set_var("TEST_ANTHROPIC_KEY_CLAWROUTE", "sk-test-value");
        assert!(config.has_any_provider_key());
        std::env::remove_var("TEST_ANTHROPIC_KEY_CLAWROUTE");
    }

    #[test]
    fn shared_config_store_then_load_reflects_update() {
        let shared = SharedConfig::new(minimal_config());
        assert!(!shared.load().dry_run);
        let mut updated = minimal_config();
        updated.dry_run = true;
        shared.store(updated);
        assert!(shared.load().dry_run);
    }
}
