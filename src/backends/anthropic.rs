//! Anthropic Messages API adapter.
//!
//! Translates between the OpenAI chat completions schema (used internally
//! throughout the proxy) and Anthropic's
//! [`/v1/messages`](https://docs.anthropic.com/en/api/messages) API. Callers
//! route requests as normal OpenAI-format JSON; this adapter handles the
//! schema differences transparently.
//!
//! # Protocol differences handled here
//!
//! | Concern | OpenAI | Anthropic |
//! |---|---|---|
//! | System prompt | First message with `role: "system"` | Top-level `system` field |
//! | Max tokens | Optional (`max_tokens`) | **Required** (`max_tokens`) |
//! | Finish reasons | `"stop"`, `"length"` | `"end_turn"`, `"max_tokens"` |
//! | Response shape | `choices[].message.content` | `content[].text` |
//! | Auth header | `Authorization: Bearer …` | `x-api-key: …` |
//!
//! Non-text content blocks (tool use, images) are translated on a
//! best-effort basis; see the module-level startup warning logged from
//! `main.rs` when an Anthropic backend is configured.

use std::time::Duration;

use anyhow::Context;
use async_stream::try_stream;
use bytes::Bytes;
use futures_util::StreamExt as _;
use reqwest::{header::HeaderMap, Client};
use serde_json::{json, Value};

use super::SseStream;

/// Default max_tokens when the caller omits it. Required by Anthropic; sensible
/// ceiling for most conversational use-cases.
const DEFAULT_MAX_TOKENS: u64 = 8_192;

/// Adapter for the Anthropic Messages API.
pub struct AnthropicAdapter {
    client: Client,
    stream_client: Client,
    base_url: String,
}

impl AnthropicAdapter {
    pub fn new(base_url: String, timeout_ms: u64, headers: HeaderMap) -> anyhow::Result<Self> {
        let client = Client::builder()
            .default_headers(headers.clone())
            .timeout(Duration::from_millis(timeout_ms))
            .build()
            .context("building reqwest client")?;
        let stream_client = Client::builder()
            .default_headers(headers)
            .build()
            .context("building streaming reqwest client")?;
        Ok(Self { client, stream_client, base_url })
    }

    /// Translate and forward a chat completions request to `POST /v1/messages`,
    /// then translate the response back to the OpenAI schema.
    ///
    /// On a non-2xx status the raw Anthropic error body is returned
    /// untranslated so the Validator can classify it accurately.
    pub async fn chat_completions(&self, request: &Value) -> anyhow::Result<(reqwest::StatusCode, String)> {
        let anthropic_req = to_anthropic(request.clone())?;
        let url = format!("{}/v1/messages", self.base_url);

        let response = self
            .client
            .post(&url)
            .json(&anthropic_req)
            .send()
            .await
            .with_context(|| format!("POST {url}"))?;

        let status = response.status();
        let text = response.text().await.context("reading Anthropic response body")?;

        if !status.is_success() {
            return Ok((status, text));
        }

        let body: Value = serde_json::from_str(&text)
            .with_context(|| format!("parsing Anthropic response as JSON: {text}"))?;
        let translated = from_anthropic(body)?;
        Ok((status, translated.to_string()))
    }

    /// Translate and forward a streaming request, re-emitting Anthropic's SSE
    /// events as OpenAI-compatible `chat.completion.chunk` frames.
    pub async fn chat_completions_stream(&self, request: &Value) -> anyhow::Result<(reqwest::StatusCode, SseStream)> {
        let mut anthropic_req = to_anthropic(request.clone())?;
        anthropic_req["stream"] = Value::Bool(true);
        let url = format!("{}/v1/messages", self.base_url);

        let response = self
            .stream_client
            .post(&url)
            .json(&anthropic_req)
            .send()
            .await
            .with_context(|| format!("POST {url} (streaming)"))?;
        let status = response.status();

        if !status.is_success() {
            let stream = response.bytes_stream().map(|r| r.map_err(anyhow::Error::from));
            return Ok((status, Box::pin(stream)));
        }

        let upstream = response.bytes_stream();
        let translated = try_stream! {
            futures_util::pin_mut!(upstream);
            let mut buf = String::new();
            let mut model = String::new();
            while let Some(chunk) = upstream.next().await {
                let chunk = chunk?;
                buf.push_str(&String::from_utf8_lossy(&chunk));
                while let Some(pos) = buf.find("\n\n") {
                    let frame = buf[..pos].to_string();
                    buf.drain(..pos + 2);
                    if let Some(out) = translate_anthropic_sse_frame(&frame, &mut model) {
                        yield Bytes::from(out);
                    }
                }
            }
            yield Bytes::from_static(b"data: [DONE]\n\n");
        };
        Ok((status, Box::pin(translated)))
    }
}

/// Translate one `event: ...\ndata: {...}` Anthropic SSE frame into an
/// OpenAI `chat.completion.chunk` SSE frame, or `None` for event types with
/// no OpenAI-chunk equivalent (`ping`, `message_start`, block boundaries).
fn translate_anthropic_sse_frame(frame: &str, model: &mut String) -> Option<String> {
    let data_line = frame.lines().find(|l| l.starts_with("data:"))?;
    let data: Value = serde_json::from_str(data_line.trim_start_matches("data:").trim()).ok()?;
    match data["type"].as_str()? {
        "message_start" => {
            if let Some(m) = data["message"]["model"].as_str() {
                *model = m.to_string();
            }
            None
        }
        "content_block_delta" => {
            let text = data["delta"]["text"].as_str()?;
            let chunk = json!({
                "object": "chat.completion.chunk",
                "model": model,
                "choices": [{
                    "index": 0,
                    "delta": { "content": text },
                    "finish_reason": Value::Null,
                }],
            });
            Some(format!("data: {chunk}\n\n"))
        }
        "message_delta" => {
            let finish_reason = match data["delta"]["stop_reason"].as_str().unwrap_or("") {
                "end_turn" => "stop",
                "max_tokens" => "length",
                other if !other.is_empty() => other,
                _ => return None,
            };
            let chunk = json!({
                "object": "chat.completion.chunk",
                "model": model,
                "choices": [{ "index": 0, "delta": {}, "finish_reason": finish_reason }],
            });
            Some(format!("data: {chunk}\n\n"))
        }
        _ => None,
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// Schema translation — pub(crate) for unit testing
// ──────────────────────────────────────────────────────────────────────────────

/// Convert an OpenAI chat completions request to the Anthropic Messages format.
pub(crate) fn to_anthropic(request: Value) -> anyhow::Result<Value> {
    let model = request["model"].as_str().context("`model` field is required")?.to_string();

    let max_tokens = request["max_tokens"].as_u64().unwrap_or(DEFAULT_MAX_TOKENS);

    let raw_messages = request["messages"].as_array().context("`messages` array is required")?;

    // Anthropic treats system content as a top-level field, not a message role.
    // If multiple system messages are present, concatenate them.
    let mut system_parts: Vec<&str> = Vec::new();
    let mut messages: Vec<Value> = Vec::with_capacity(raw_messages.len());

    for msg in raw_messages {
        if msg["role"].as_str() == Some("system") {
            if let Some(content) = msg["content"].as_str() {
                system_parts.push(content);
            }
        } else {
            messages.push(msg.clone());
        }
    }

    let mut req = json!({
        "model": model,
        "max_tokens": max_tokens,
        "messages": messages,
    });

    if !system_parts.is_empty() {
        req["system"] = Value::String(system_parts.join("\n\n"));
    }

    if let Some(temp) = request["temperature"].as_f64() {
        req["temperature"] = json!(temp);
    }
    if let Some(stop) = request.get("stop") {
        req["stop_sequences"] = stop.clone();
    }
    if let Some(tools) = request.get("tools") {
        req["tools"] = translate_tools_to_anthropic(tools);
    }

    Ok(req)
}

/// OpenAI's `tools[].function.{name,description,parameters}` maps directly
/// onto Anthropic's `tools[].{name,description,input_schema}`.
fn translate_tools_to_anthropic(tools: &Value) -> Value {
    let Some(arr) = tools.as_array() else {
        return Value::Array(vec![]);
    };
    Value::Array(
        arr.iter()
            .filter_map(|t| {
                let f = t.get("function")?;
                Some(json!({
                    "name": f["name"],
                    "description": f.get("description").cloned().unwrap_or(Value::Null),
                    "input_schema": f.get("parameters").cloned().unwrap_or(json!({"type": "object"})),
                }))
            })
            .collect(),
    )
}

/// Convert an Anthropic Messages API response to the OpenAI chat completions schema.
pub(crate) fn from_anthropic(resp: Value) -> anyhow::Result<Value> {
    let blocks = resp["content"].as_array().context("no `content` array in Anthropic response")?;

    let text: String = blocks
        .iter()
        .filter(|b| b["type"] == "text")
        .filter_map(|b| b["text"].as_str())
        .collect::<Vec<_>>()
        .join("");

    let tool_calls: Vec<Value> = blocks
        .iter()
        .filter(|b| b["type"] == "tool_use")
        .map(|b| {
            json!({
                "id": b["id"],
                "type": "function",
                "function": {
                    "name": b["name"],
                    "arguments": b["input"].to_string(),
                },
            })
        })
        .collect();

    anyhow::ensure!(
        !text.is_empty() || !tool_calls.is_empty(),
        "Anthropic response contains neither a text nor a tool_use block"
    );

    let model = resp["model"].as_str().unwrap_or("unknown");

    let finish_reason = match resp["stop_reason"].as_str().unwrap_or("stop") {
        "end_turn" => "stop",
        "max_tokens" => "length",
        "tool_use" => "tool_calls",
        other => other,
    };

    let input_tokens = resp["usage"]["input_tokens"].as_u64().unwrap_or(0);
    let output_tokens = resp["usage"]["output_tokens"].as_u64().unwrap_or(0);

    let mut message = json!({ "role": "assistant", "content": if text.is_empty() { Value::Null } else { Value::String(text) } });
    if !tool_calls.is_empty() {
        message["tool_calls"] = Value::Array(tool_calls);
    }

    Ok(json!({
        "id": resp["id"],
        "object": "chat.completion",
        "model": model,
        "choices": [{
            "index": 0,
            "message": message,
            "finish_reason": finish_reason,
        }],
        "usage": {
            "prompt_tokens": input_tokens,
            "completion_tokens": output_tokens,
            "total_tokens": input_tokens + output_tokens,
        },
    }))
}

// ──────────────────────────────────────────────────────────────────────────────
// Tests
// ──────────────────────────────────────────────────────────────────────────────
