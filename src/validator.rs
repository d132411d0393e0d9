//! Response validator — §4.4.
//!
//! Pure function: given an upstream HTTP status and body, decide whether
//! the response is usable as-is, retriable, or terminal. No I/O, no
//! classification state — the executor calls this once per attempt.

use reqwest::StatusCode;
use serde_json::Value;

use crate::classifier::ChatCompletionRequest;
use crate::config::Tier;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Validity {
    /// Usable as-is.
    Valid,
    /// Worth another attempt (transient upstream failure, malformed body).
    InvalidRetriable,
    /// Not worth retrying (client-side request error, tool-call corruption).
    InvalidTerminal,
}

#[derive(Debug, Clone)]
pub struct ValidationResult {
    pub validity: Validity,
    pub reason: &'static str,
    /// True once any tool call has been observed in the response — used by
    /// the executor's R2 rule to forbid retrying after tool calls.
    pub had_tool_calls: bool,
}

impl ValidationResult {
    fn valid(had_tool_calls: bool) -> Self {
        Self { validity: Validity::Valid, reason: "ok", had_tool_calls }
    }

    fn retriable(reason: &'static str) -> Self {
        Self { validity: Validity::InvalidRetriable, reason, had_tool_calls: false }
    }

    fn terminal(reason: &'static str) -> Self {
        Self { validity: Validity::InvalidTerminal, reason, had_tool_calls: false }
    }

    fn terminal_tool_call(reason: &'static str) -> Self {
        Self { validity: Validity::InvalidTerminal, reason, had_tool_calls: true }
    }
}

/// Validate one buffered (non-streaming) upstream response (§4.4).
///
/// `tier` gates the suspiciously-short-response heuristic: Heartbeat
/// responses are expected to be short, so the heuristic is skipped there.
pub fn validate(status: StatusCode, body_text: &str, request: &ChatCompletionRequest, tier: Tier) -> ValidationResult {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS || status == StatusCode::REQUEST_TIMEOUT {
        return ValidationResult::retriable("http_error_5xx_or_429");
    }
    if status.is_client_error() {
        return ValidationResult::terminal_with_code(status);
    }
    if !status.is_success() {
        return ValidationResult::retriable("http_error_unexpected");
    }

    let body: Value = match serde_json::from_str(body_text) {
        Ok(v) => v,
        Err(_) => return ValidationResult::retriable("invalid_json_body"),
    };

    if body.get("error").is_some() {
        return ValidationResult::retriable("api_error_response");
    }

    let message = body.pointer("/choices/0/message");
    let Some(message) = message else {
        return ValidationResult::retriable("missing_choices_or_message");
    };

    let tool_calls = message.get("tool_calls").and_then(Value::as_array);
    let had_tool_calls = matches!(tool_calls, Some(a) if !a.is_empty());

    if let Some(calls) = tool_calls {
        // §4.4: `hadToolCalls` is true here irrespective of validity — a
        // tool call was demonstrably present even though it's malformed,
        // and the executor's R2 rule must see that to refuse a retry.
        if let Some(invalid_reason) = invalid_tool_call_reason(calls, request) {
            return ValidationResult::terminal_tool_call(invalid_reason);
        }
    }

    // §4.4: a trimmed content length in [1, 14] guards against cheap-model
    // stalls (a near-empty reply); it deliberately excludes 0 (covered by
    // the missing-content/message checks above) and anything 15+.
    let content_len = message.get("content").and_then(Value::as_str).map(str::trim).map(str::len).unwrap_or(0);
    if !had_tool_calls && tier != Tier::Heartbeat && (1..=14).contains(&content_len) {
        return ValidationResult::retriable("suspiciously_short_response");
    }

    ValidationResult::valid(had_tool_calls)
}

impl ValidationResult {
    fn terminal_with_code(status: StatusCode) -> Self {
        let reason: &'static str = match status {
            StatusCode::BAD_REQUEST => "http_error_400",
            StatusCode::UNAUTHORIZED => "http_error_401",
            StatusCode::FORBIDDEN => "http_error_403",
            StatusCode::NOT_FOUND => "http_error_404",
            _ => "http_error_4xx",
        };
        Self::terminal(reason)
    }
}

/// Check each tool call's `function.name` against the request's declared
/// tool set and that `arguments` parses as JSON (§4.4's tool-call validity
/// rule). Returns a rejection reason on the first invalid call found.
fn invalid_tool_call_reason(calls: &[Value], request: &ChatCompletionRequest) -> Option<&'static str> {
    let declared_names: Vec<&str> = request
        .tools
        .as_ref()
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|t| t.pointer("/function/name").and_then(Value::as_str))
        .collect();

    for call in calls {
        let name = call.pointer("/function/name").and_then(Value::as_str);
        match name {
            None => return Some("tool_call_missing_name"),
            Some(n) if !declared_names.is_empty() && !declared_names.contains(&n) => {
                return Some("tool_call_unknown_name");
            }
            _ => {}
        }

        // §4.4: non-empty arguments must parse as JSON (the literal "{}" is
        // explicitly fine, as is absent/empty arguments for a no-arg call).
        let args = call.pointer("/function/arguments").and_then(Value::as_str).unwrap_or("");
        if !args.is_empty() && args != "{}" && serde_json::from_str::<Value>(args).is_err() {
            return Some("tool_call_invalid_arguments_json");
        }
    }
    None
}
