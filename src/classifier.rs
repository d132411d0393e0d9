//! Request classifier — §4.2.
//!
//! Pure, deterministic, rule-based: no model calls, no I/O, intended to
//! run in well under 5ms per request. Pattern tables are compiled once at
//! startup (`std::sync::LazyLock`-backed `regex::Regex` statics) rather
//! than per-call, matching the teacher's "compile pattern tables once"
//! convention.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::Tier;

/// One message in an OpenAI-shaped chat-completions request.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default)]
    pub content: Option<Value>,
    #[serde(default)]
    pub tool_calls: Option<Value>,
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

impl ChatMessage {
    /// Best-effort flattening of `content` to plain text, for classification
    /// heuristics only — never used to rewrite the request sent upstream.
    pub fn text(&self) -> String {
        match &self.content {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Array(parts)) => parts
                .iter()
                .filter_map(|p| p.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join(" "),
            _ => String::new(),
        }
    }
}

/// The subset of an OpenAI chat-completions request the classifier and
/// router need. Unknown fields are preserved via `extra` so the original
/// request body can be reconstructed byte-faithfully minus the `model`
/// field swap (§6.1's "no wire-protocol rewriting beyond model + auth").
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub tools: Option<Value>,
    #[serde(default)]
    pub tool_choice: Option<Value>,
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

impl ChatCompletionRequest {
    pub fn has_tools(&self) -> bool {
        matches!(&self.tools, Some(Value::Array(a)) if !a.is_empty())
    }

    /// True when `tool_choice` is present and is anything other than the
    /// literal string `"none"` (§4.2 rule 3's frontier tool-choice signal).
    fn tool_choice_forces_a_call(&self) -> bool {
        match &self.tool_choice {
            None => false,
            Some(Value::String(s)) => s != "none",
            Some(_) => true,
        }
    }

    pub fn last_user_text(&self) -> String {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == "user")
            .map(ChatMessage::text)
            .unwrap_or_default()
    }

    pub fn all_text(&self) -> String {
        self.messages.iter().map(ChatMessage::text).collect::<Vec<_>>().join("\n")
    }

    /// True when any message's `content` is a parts array containing an
    /// `image_url` (or `type: "image"`) block (§4.2 rule 3's multimodal
    /// signal).
    fn has_image_content(&self) -> bool {
        self.messages.iter().any(|m| {
            matches!(&m.content, Some(Value::Array(parts)) if parts.iter().any(|p| {
                matches!(p.get("type").and_then(Value::as_str), Some("image_url") | Some("image"))
            }))
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ClassificationResult {
    pub tier: Tier,
    pub confidence: f64,
    pub reason: &'static str,
    /// Which rule(s) fired along the way, for observability (§3's `signals`
    /// set). Not used for control flow — `reason` alone drives the tier.
    pub signals: Vec<&'static str>,
    /// Whether the request declared any tools, independent of tier.
    pub tools_detected: bool,
    /// True only when the final tier is Heartbeat or Simple AND no tools
    /// are present (§4.2). Necessary but not sufficient for the executor to
    /// actually retry — see `executor.rs`'s R2 rule.
    pub safe_to_retry: bool,
    /// Estimated input token count, `ceil(chars/4)` heuristic plus a fixed
    /// per-message overhead — never a real tokenizer (§4.2, §9).
    pub estimated_input_tokens: u64,
}

// Fixed heartbeat word set, optionally followed by punctuation (§4.2 rule 2).
static HEARTBEAT_WORDS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*(ping|status|alive|check|heartbeat|hey|hi|hello|test|yo)\s*[!.?]*\s*$").expect("static heartbeat word pattern is valid")
});
static HEARTBEAT_PHRASES: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)are you (there|up|alive|ok|ready)|can you hear me|you there|testing").expect("static heartbeat phrase pattern is valid")
});

// Fenced code block detection for the frontier rule (§4.2 rule 3).
static FENCED_CODE_BLOCK: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"```").expect("static fence pattern is valid"));

static FRONTIER_KEYWORDS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)implement|architect|design|refactor|debug|optimize|prove|derive|analyze.{0,20}(code|system|architecture|algorithm)")
        .expect("static frontier keyword pattern is valid")
});

static COMPLEX_KEYWORDS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)explain|compare|analyze|research|summarize|evaluate|assess|review|write.{0,10}(essay|report|article|doc|documentation)")
        .expect("static complex keyword pattern is valid")
});

// Fixed acknowledgment word set (§4.2 rule 5).
static ACKNOWLEDGMENT_WORDS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^\s*(thanks|thank you|thx|ty|ok|okay|k|kk|alright|sure|yes|no|yep|nope|yeah|nah|got it|sounds good|cool|great|nice|perfect|awesome|agreed|right|lol|haha|hehe|lmao|rofl)\s*[!.?]*\s*$",
    )
    .expect("static acknowledgment pattern is valid")
});
static EMOJI_ONLY: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[\s👍🙏😊👌✅❤]+$").expect("static emoji pattern is valid"));
static SHORT_QUESTION: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s).*\?\s*$").expect("static question pattern is valid"));

/// Classify a request into a tier via §4.2's ordered rule list: model-name
/// hint, heartbeat patterns, frontier signals, complex signals, simple
/// patterns, then a default of Moderate. `conservative_mode` and
/// `tool_aware_escalation` are applied afterward as post-adjustments, in
/// that order.
pub fn classify(req: &ChatCompletionRequest, conservative_mode: bool, tool_aware_escalation: bool) -> ClassificationResult {
    let text = req.last_user_text();
    let all_text = req.all_text();
    let estimated_input_tokens = estimate_input_tokens(req);
    let tools_detected = req.has_tools();

    let (mut tier, mut confidence, mut reason) = classify_core(req, &text, &all_text, estimated_input_tokens);
    let mut signals = vec![reason];

    // Tool-aware escalation (§4.2): a request with tools declared is never
    // routed below Complex, and its confidence is capped at 0.8 — tool-call
    // correctness matters more than a confident low-tier classification.
    if tool_aware_escalation && tools_detected && tier < Tier::Complex {
        tier = Tier::Complex;
        confidence = confidence.min(0.8);
        reason = "tool_aware_escalation_to_complex";
        signals.push(reason);
    }

    if conservative_mode {
        // One-step bump first. This does not change `confidence` itself.
        if let Some(bumped) = tier.bump() {
            tier = bumped;
            reason = "conservative_mode_bump";
            signals.push(reason);
        }
        // The direct-to-Frontier override reads the *original* confidence,
        // not a value mutated by the bump above — confidence is never
        // mutated by classification, only read.
        if confidence < 0.5 {
            tier = Tier::Frontier;
            reason = "conservative_mode_low_confidence_frontier";
            signals.push(reason);
        }
    }

    // Necessary but not sufficient for the executor to retry — a tool call
    // actually observed in a response still forbids retry even here (R2).
    let safe_to_retry = matches!(tier, Tier::Heartbeat | Tier::Simple) && !tools_detected;

    ClassificationResult {
        tier,
        confidence,
        reason,
        signals,
        tools_detected,
        safe_to_retry,
        estimated_input_tokens,
    }
}

/// Implements §4.2's ordered rule list 1–6. Rules 3 (frontier) can override
/// whatever tentative tier rules 1–2 set; rules 4 (complex) and 5 (simple)
/// only fire when frontier didn't and the tier is still Moderate.
fn classify_core(req: &ChatCompletionRequest, last_user_text: &str, all_text: &str, estimated_input_tokens: u64) -> (Tier, f64, &'static str) {
    let shallow_history = req.messages.len() <= 2;
    let trimmed = last_user_text.trim();

    // Rule 1: model-name hint.
    let mut tentative: Option<(Tier, f64, &'static str)> = model_name_hint_tier(&req.model).map(|t| (t, 0.85, "model_name_hint_keyword"));

    // Rule 2: heartbeat patterns.
    if tentative.is_none() {
        if HEARTBEAT_WORDS.is_match(trimmed) || HEARTBEAT_PHRASES.is_match(trimmed) {
            tentative = Some((Tier::Heartbeat, 0.95, "heartbeat_pattern"));
        } else if trimmed.chars().count() < 30 && shallow_history && !req.has_tools() {
            tentative = Some((Tier::Heartbeat, 0.8, "heartbeat_short_shallow"));
        }
    }

    // Rule 3: frontier signals, which override whatever rules 1–2 set.
    if req.has_tools() && req.tool_choice_forces_a_call() {
        return (Tier::Frontier, 0.9, "frontier_tool_choice_forced");
    }
    if FENCED_CODE_BLOCK.is_match(last_user_text) {
        return (Tier::Frontier, 0.85, "frontier_fenced_code_block");
    }
    if last_user_text.chars().count() > 1000 && FRONTIER_KEYWORDS.is_match(last_user_text) {
        return (Tier::Frontier, 0.8, "frontier_keyword_long_message");
    }
    if estimated_input_tokens > 8000 {
        return (Tier::Frontier, 0.75, "frontier_token_estimate");
    }
    if req.has_image_content() {
        return (Tier::Frontier, 0.8, "frontier_multimodal_image");
    }

    if let Some(t) = tentative {
        return t;
    }

    // Rule 4: complex signals — only evaluated while still Moderate.
    if req.has_tools() && req.tool_choice.is_none() {
        return (Tier::Complex, 0.85, "complex_tools_present");
    }
    let last_len = last_user_text.chars().count();
    if (500..=1000).contains(&last_len) && COMPLEX_KEYWORDS.is_match(last_user_text) {
        return (Tier::Complex, 0.8, "complex_keyword_medium_message");
    }
    if req.messages.len() > 8 {
        return (Tier::Complex, 0.75, "complex_deep_history");
    }
    if (4000..=8000).contains(&estimated_input_tokens) {
        return (Tier::Complex, 0.7, "complex_token_estimate");
    }

    // Rule 5: simple patterns — only evaluated while still Moderate.
    if ACKNOWLEDGMENT_WORDS.is_match(trimmed) || EMOJI_ONLY.is_match(trimmed) {
        return (Tier::Simple, 0.9, "simple_acknowledgment");
    }
    if trimmed.chars().count() < 80 && SHORT_QUESTION.is_match(trimmed) && shallow_history {
        return (Tier::Simple, 0.8, "simple_short_question");
    }

    // Rule 6: default. Confidence is deliberately below the conservative-mode
    // frontier-override threshold (0.5) — an unclassified request is exactly
    // the case conservative mode exists to second-guess.
    (Tier::Moderate, 0.4, "general_conversation")
}

/// Substring match (case-insensitive) of the request's `model` field against
/// the fixed keyword set `{heartbeat, cron, health}` (§4.2 rule 1).
fn model_name_hint_tier(model: &str) -> Option<Tier> {
    let lower = model.to_ascii_lowercase();
    if lower.contains("heartbeat") || lower.contains("cron") || lower.contains("health") {
        Some(Tier::Heartbeat)
    } else {
        None
    }
}

/// `ceil(chars/4)` per message plus a small fixed overhead, matching the
/// spec's explicit avoidance of a real tokenizer in the hot path (§4.2, §9).
fn estimate_input_tokens(req: &ChatCompletionRequest) -> u64 {
    const CHARS_PER_TOKEN: usize = 4;
    const PER_MESSAGE_OVERHEAD: u64 = 4;

    let mut total = 0u64;
    for msg in &req.messages {
        let chars = msg.text().chars().count();
        total += chars.div_ceil(CHARS_PER_TOKEN) as u64 + PER_MESSAGE_OVERHEAD;
        if msg.tool_calls.is_some() {
            total += 20;
        }
    }
    if let Some(Value::Array(tools)) = &req.tools {
        total += tools.len() as u64 * 30;
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(model: &str, user_text: &str) -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: model.to_string(),
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: Some(Value::String(user_text.to_string())),
                tool_calls: None,
                extra: HashMap::new(),
            }],
            stream: false,
            tools: None,
            tool_choice: None,
            extra: HashMap::new(),
        }
    }

    #[test]
    fn classify_is_deterministic() {
        let req = request("gpt-4o-mini", "what is the capital of France?");
        let a = classify(&req, false, true);
        let b = classify(&req, false, true);
        assert_eq!(a.tier, b.tier);
        assert_eq!(a.confidence, b.confidence);
    }

    #[test]
    fn classify_runs_in_under_five_milliseconds() {
        let req = request("gpt-4o-mini", "explain step by step how TCP congestion control works");
        let start = std::time::Instant::now();
        for _ in 0..100 {
            let _ = classify(&req, false, true);
        }
        let per_call = start.elapsed() / 100;
        assert!(per_call.as_millis() < 5, "classify took {per_call:?} per call");
    }

    #[test]
    fn heartbeat_greeting_classified_as_heartbeat() {
        let req = request("gpt-4o-mini", "hello!");
        let result = classify(&req, false, true);
        assert_eq!(result.tier, Tier::Heartbeat);
    }

    #[test]
    fn frontier_fenced_code_block_overrides_default() {
        let req = request("gpt-4o-mini", "can you review this?\n```rust\nfn main() {}\n```");
        let result = classify(&req, false, true);
        assert_eq!(result.tier, Tier::Frontier);
        assert_eq!(result.reason, "frontier_fenced_code_block");
    }

    #[test]
    fn frontier_keyword_on_long_message_overrides_default() {
        let filler = "please consider the background context here. ".repeat(22);
        let text = format!("{filler}now implement a distributed caching layer for this system.");
        assert!(text.chars().count() > 1000, "fixture must exceed the 1000-char threshold");
        let req = request("gpt-4o-mini", &text);
        let result = classify(&req, false, true);
        assert_eq!(result.tier, Tier::Frontier);
        assert_eq!(result.reason, "frontier_keyword_long_message");
    }

    #[test]
    fn frontier_tool_choice_forced_overrides_default() {
        let mut req = request("gpt-4o-mini", "hello!");
        req.tools = Some(serde_json::json!([{"type": "function", "function": {"name": "lookup"}}]));
        req.tool_choice = Some(serde_json::json!({"type": "function", "function": {"name": "lookup"}}));
        let result = classify(&req, false, true);
        assert_eq!(result.tier, Tier::Frontier);
        assert_eq!(result.reason, "frontier_tool_choice_forced");
    }

    #[test]
    fn complex_signal_detected_for_tools_without_tool_choice() {
        let mut req = request("gpt-4o-mini", "please help me with a task that needs a lookup");
        req.tools = Some(serde_json::json!([{"type": "function", "function": {"name": "lookup"}}]));
        let result = classify(&req, false, true);
        assert_eq!(result.tier, Tier::Complex);
        assert_eq!(result.reason, "complex_tools_present");
    }

    #[test]
    fn complex_keyword_on_medium_message_detected() {
        let filler = "some relevant detail about the topic at hand. ".repeat(12);
        let text = format!("{filler}please explain the trade-offs involved here.");
        assert!((500..=1000).contains(&text.chars().count()), "fixture must land in the medium-length band");
        let req = request("gpt-4o-mini", &text);
        let result = classify(&req, false, true);
        assert_eq!(result.tier, Tier::Complex);
        assert_eq!(result.reason, "complex_keyword_medium_message");
    }

    #[test]
    fn simple_pattern_detected() {
        let req = request("gpt-4o-mini", "what is the boiling point of water?");
        let result = classify(&req, false, true);
        assert_eq!(result.tier, Tier::Simple);
    }

    #[test]
    fn model_name_hint_takes_priority_over_text_heuristics() {
        let req = request("heartbeat-checker", "explain the theory of relativity in depth");
        let result = classify(&req, false, true);
        assert_eq!(result.tier, Tier::Heartbeat);
        assert_eq!(result.reason, "model_name_hint_keyword");
    }

    #[test]
    fn tool_aware_escalation_lifts_heartbeat_requests_with_tools() {
        let mut req = request("gpt-4o-mini", "hi");
        req.tools = Some(serde_json::json!([{"type": "function", "function": {"name": "lookup"}}]));
        let result = classify(&req, false, true);
        assert_eq!(result.tier, Tier::Complex);
        assert!(result.confidence <= 0.8);
    }

    #[test]
    fn tool_aware_escalation_leaves_frontier_tier_alone() {
        let mut req = request("gpt-4o-mini", "```rust\nfn main() {}\n```");
        req.tools = Some(serde_json::json!([{"type": "function", "function": {"name": "lookup"}}]));
        let result = classify(&req, false, true);
        assert_eq!(result.tier, Tier::Frontier);
    }

    #[test]
    fn tool_aware_escalation_can_be_disabled() {
        let mut req = request("gpt-4o-mini", "hi");
        req.tools = Some(serde_json::json!([{"type": "function", "function": {"name": "lookup"}}]));
        let result = classify(&req, false, false);
        assert_eq!(result.tier, Tier::Heartbeat);
    }

    #[test]
    fn conservative_mode_bumps_tier_by_one_step() {
        let req = request("gpt-4o-mini", "what is the capital of France?");
        let without = classify(&req, false, true);
        let with = classify(&req, true, true);
        assert_eq!(with.tier, without.tier.bump().unwrap());
    }

    #[test]
    fn conservative_mode_overrides_to_frontier_when_confidence_low() {
        let req = request("gpt-4o-mini", "tell me something moderately complicated about things");
        let base = classify(&req, false, true);
        assert!(base.confidence < 0.5, "fixture must hit the low-confidence path: {}", base.confidence);
        let result = classify(&req, true, true);
        assert_eq!(result.tier, Tier::Frontier);
    }

    #[test]
    fn token_estimate_scales_with_text_length() {
        let short = request("gpt-4o-mini", "hi");
        let long = request("gpt-4o-mini", &"word ".repeat(500));
        let short_result = classify(&short, false, true);
        let long_result = classify(&long, false, true);
        assert!(long_result.estimated_input_tokens > short_result.estimated_input_tokens);
    }
}
