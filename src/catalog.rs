//! Model catalog — §4.1.
//!
//! A static, compiled-in table of `{id, provider, pricing, capabilities}`
//! plus the pure helpers the rest of the proxy needs: resolving a model id
//! to its entry, inferring a provider from an id string, and computing the
//! USD cost of a request. None of this performs I/O; the catalog is data,
//! compiled once at startup per the teacher's "compile pattern tables once"
//! convention (see `classifier.rs`).

use std::collections::HashMap;
use std::sync::LazyLock;

use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};

/// One of the five upstream providers this proxy speaks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    Anthropic,
    OpenAI,
    Google,
    Deepseek,
    Openrouter,
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Anthropic => "anthropic",
            Self::OpenAI => "openai",
            Self::Google => "google",
            Self::Deepseek => "deepseek",
            Self::Openrouter => "openrouter",
        })
    }
}

impl Provider {
    /// Parse a provider name, as it would appear as the `provider/` prefix
    /// of a model id or an `apiKeys` config key.
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "anthropic" => Some(Self::Anthropic),
            "openai" => Some(Self::OpenAI),
            "google" => Some(Self::Google),
            "deepseek" => Some(Self::Deepseek),
            "openrouter" => Some(Self::Openrouter),
            _ => None,
        }
    }

    pub fn all() -> [Provider; 5] {
        [
            Self::Anthropic,
            Self::OpenAI,
            Self::Google,
            Self::Deepseek,
            Self::Openrouter,
        ]
    }

    /// Fixed per-provider base URL (no trailing slash).
    pub fn base_url(self) -> &'static str {
        match self {
            Self::Anthropic => "https://api.anthropic.com",
            Self::OpenAI => "https://api.openai.com",
            Self::Google => "https://generativelanguage.googleapis.com",
            Self::Deepseek => "https://api.deepseek.com",
            Self::Openrouter => "https://openrouter.ai/api",
        }
    }

    /// Build the authentication headers for this provider.
    ///
    /// Anthropic uses `x-api-key` + an explicit `anthropic-version`; every
    /// other provider uses `Authorization: Bearer <key>`.
    pub fn auth_headers(self, api_key: &str) -> anyhow::Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        match self {
            Self::Anthropic => {
                headers.insert("x-api-key", HeaderValue::from_str(api_key)?);
                headers.insert("anthropic-version", HeaderValue::from_static("2023-06-01"));
            }
            Self::Openrouter => {
                headers.insert(AUTHORIZATION, HeaderValue::from_str(&format!("Bearer {api_key}"))?);
                headers.insert("HTTP-Referer", HeaderValue::from_static("https://clawroute.local"));
                headers.insert("X-Title", HeaderValue::from_static("ClawRoute"));
            }
            _ => {
                headers.insert(AUTHORIZATION, HeaderValue::from_str(&format!("Bearer {api_key}"))?);
            }
        }
        Ok(headers)
    }
}

/// Immutable pricing/capability record for one model id.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ModelEntry {
    pub id: String,
    pub provider: Provider,
    pub input_cost_per_million: f64,
    pub output_cost_per_million: f64,
    pub max_context: u32,
    pub tool_capable: bool,
    pub multimodal: bool,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

/// High-tier cost used for models missing from the catalog, so savings
/// estimates are never overestimated downward (§4.1).
const UNKNOWN_MODEL_INPUT_COST: f64 = 15.0;
const UNKNOWN_MODEL_OUTPUT_COST: f64 = 75.0;

fn entry(
    id: &str,
    provider: Provider,
    input: f64,
    output: f64,
    max_context: u32,
    tool_capable: bool,
    multimodal: bool,
) -> ModelEntry {
    ModelEntry {
        id: id.to_string(),
        provider,
        input_cost_per_million: input,
        output_cost_per_million: output,
        max_context,
        tool_capable,
        multimodal,
        enabled: true,
    }
}

/// Compiled-in model catalog. Keyed by canonical `provider/model-name`.
pub static CATALOG: LazyLock<HashMap<String, ModelEntry>> = LazyLock::new(|| {
    use Provider::*;
    let entries = vec![
        entry("google/gemini-2.5-flash-lite", Google, 0.10, 0.40, 1_000_000, true, true),
        entry("google/gemini-2.5-flash", Google, 0.30, 2.50, 1_000_000, true, true),
        entry("google/gemini-2.5-pro", Google, 1.25, 10.00, 2_000_000, true, true),
        entry("deepseek/deepseek-chat", Deepseek, 0.28, 0.42, 64_000, true, false),
        entry("deepseek/deepseek-reasoner", Deepseek, 0.55, 2.19, 64_000, true, false),
        entry("openai/gpt-4o-mini", OpenAI, 0.15, 0.60, 128_000, true, true),
        entry("openai/gpt-4o", OpenAI, 2.50, 10.00, 128_000, true, true),
        entry("openai/o3-mini", OpenAI, 1.10, 4.40, 200_000, true, false),
        entry("anthropic/claude-haiku-4-5", Anthropic, 1.00, 5.00, 200_000, true, true),
        entry("anthropic/claude-sonnet-4-5", Anthropic, 3.00, 15.00, 200_000, true, true),
        entry("anthropic/claude-opus-4-5", Anthropic, 15.00, 75.00, 200_000, true, true),
        entry(
            "openrouter/meta-llama/llama-3.3-70b-instruct",
            Openrouter,
            0.12,
            0.30,
            128_000,
            true,
            false,
        ),
    ];
    entries.into_iter().map(|e| (e.id.clone(), e)).collect()
});

/// Resolve a model id to its catalog entry.
///
/// Resolution order (§4.1): (1) exact match; (2) suffix match against the
/// `provider/name` form; (3) case-insensitive substring match. The latter
/// two are best-effort for unregistered models.
pub fn lookup(model_id: &str) -> Option<&'static ModelEntry> {
    if let Some(e) = CATALOG.get(model_id) {
        return Some(e);
    }
    if let Some(e) = CATALOG.values().find(|e| e.id.ends_with(model_id) || model_id.ends_with(&e.id)) {
        return Some(e);
    }
    let needle = model_id.to_ascii_lowercase();
    CATALOG.values().find(|e| e.id.to_ascii_lowercase().contains(&needle))
}

/// Infer a provider from a model id string (§4.1).
///
/// If the id contains `/`, the prefix is used when it names a known
/// provider. Otherwise providers are inferred from substrings; unmatched
/// ids default to `openai`.
pub fn provider_of(model_id: &str) -> Provider {
    if let Some((prefix, _)) = model_id.split_once('/') {
        if let Some(p) = Provider::parse(prefix) {
            return p;
        }
    }
    let lower = model_id.to_ascii_lowercase();
    if lower.contains("claude") {
        Provider::Anthropic
    } else if lower.contains("gpt") || lower.contains("o1") || lower.contains("o3") {
        Provider::OpenAI
    } else if lower.contains("gemini") {
        Provider::Google
    } else if lower.contains("deepseek") {
        Provider::Deepseek
    } else {
        Provider::OpenAI
    }
}

/// Strip the `provider/` prefix, leaving the bare model name to send upstream.
pub fn bare_model_name(model_id: &str) -> &str {
    model_id.split_once('/').map(|(_, rest)| rest).unwrap_or(model_id)
}

/// Compute the USD cost of a request against `model_id`.
///
/// Falls back to a high-tier default for unregistered models so savings
/// are never overestimated downward.
pub fn cost(model_id: &str, input_tokens: u64, output_tokens: u64) -> f64 {
    let (input_rate, output_rate) = match lookup(model_id) {
        Some(e) => (e.input_cost_per_million, e.output_cost_per_million),
        None => (UNKNOWN_MODEL_INPUT_COST, UNKNOWN_MODEL_OUTPUT_COST),
    };
    (input_tokens as f64 / 1_000_000.0) * input_rate + (output_tokens as f64 / 1_000_000.0) * output_rate
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_exact_match() {
        let e = lookup("google/gemini-2.5-flash-lite").unwrap();
        assert_eq!(e.provider, Provider::Google);
    }

    #[test]
    fn lookup_suffix_match_without_prefix() {
        let e = lookup("gemini-2.5-flash-lite").unwrap();
        assert_eq!(e.id, "google/gemini-2.5-flash-lite");
    }

    #[test]
    fn lookup_substring_match_best_effort() {
        let e = lookup("claude-sonnet-4-5-20250929").unwrap();
        assert_eq!(e.id, "anthropic/claude-sonnet-4-5");
    }

    #[test]
    fn lookup_returns_none_for_unrelated_string() {
        assert!(lookup("totally-unregistered-model-xyz").is_none());
    }

    #[test]
    fn provider_of_parses_known_prefix() {
        assert_eq!(provider_of("anthropic/claude-sonnet-4-5"), Provider::Anthropic);
    }

    #[test]
    fn provider_of_infers_from_substring_without_prefix() {
        assert_eq!(provider_of("gpt-4o"), Provider::OpenAI);
        assert_eq!(provider_of("claude-haiku-4-5"), Provider::Anthropic);
        assert_eq!(provider_of("gemini-2.5-pro"), Provider::Google);
        assert_eq!(provider_of("deepseek-chat"), Provider::Deepseek);
    }

    #[test]
    fn provider_of_falls_back_to_openai() {
        assert_eq!(provider_of("some-unknown-local-model"), Provider::OpenAI);
    }

    #[test]
    fn bare_model_name_strips_provider_prefix() {
        assert_eq!(bare_model_name("anthropic/claude-sonnet-4-5"), "claude-sonnet-4-5");
        assert_eq!(bare_model_name("gpt-4o"), "gpt-4o");
    }

    #[test]
    fn cost_is_nonnegative_for_known_and_unknown_models() {
        assert!(cost("google/gemini-2.5-flash-lite", 1000, 500) >= 0.0);
        assert!(cost("totally-unregistered", 1000, 500) >= 0.0);
    }

    #[test]
    fn cost_of_unknown_model_is_at_least_as_expensive_as_frontier() {
        let unknown = cost("totally-unregistered-model", 1_000_000, 1_000_000);
        let frontier = cost("anthropic/claude-opus-4-5", 1_000_000, 1_000_000);
        assert!(unknown >= frontier);
    }

    #[test]
    fn anthropic_auth_headers_use_x_api_key() {
        let headers = Provider::Anthropic.auth_headers("sk-test").unwrap();
        assert!(headers.contains_key("x-api-key"));
        assert!(headers.contains_key("anthropic-version"));
        assert!(!headers.contains_key(AUTHORIZATION));
    }

    #[test]
    fn openai_auth_headers_use_bearer() {
        let headers = Provider::OpenAI.auth_headers("sk-test").unwrap();
        let value = headers.get(AUTHORIZATION).unwrap().to_str().unwrap();
        assert_eq!(value, "Bearer sk-test");
    }
}
