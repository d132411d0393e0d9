//! OpenAI-compatible chat completions adapter.
//!
//! Handles any upstream that speaks the OpenAI `/v1/chat/completions`
//! protocol: OpenAI itself, OpenRouter, Google's Gemini OpenAI-compatibility
//! endpoint, and DeepSeek — all strict supersets of the same wire schema.
//! The request body is forwarded verbatim aside from the `model` field
//! (§6.1: no wire-protocol rewriting beyond `model` + auth headers).

use std::time::Duration;

use anyhow::Context;
use futures_util::StreamExt as _;
use reqwest::{header::HeaderMap, Client};
use serde_json::Value;

use super::SseStream;

/// Adapter for any OpenAI-compatible upstream.
pub struct OpenAIAdapter {
    /// Buffered requests — has the configured request timeout.
    client: Client,
    /// Streaming requests — no request-level timeout (body arrives incrementally).
    stream_client: Client,
    base_url: String,
}

impl OpenAIAdapter {
    /// Build an adapter for the given base URL with pre-built auth headers
    /// (from [`crate::catalog::Provider::auth_headers`]).
    pub fn new(base_url: String, timeout_ms: u64, headers: HeaderMap) -> anyhow::Result<Self> {
        let client = Client::builder()
            .default_headers(headers.clone())
            .timeout(Duration::from_millis(timeout_ms))
            .build()
            .context("building reqwest client")?;

        // No request-level timeout for streaming — the response body arrives
        // incrementally. TCP connect timeout still applies.
        let stream_client = Client::builder()
            .default_headers(headers)
            .build()
            .context("building streaming reqwest client")?;

        Ok(Self { client, stream_client, base_url })
    }

    /// Forward a chat completions request to `POST /v1/chat/completions`.
    pub async fn chat_completions(&self, body: &Value) -> anyhow::Result<(reqwest::StatusCode, String)> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .with_context(|| format!("POST {url}"))?;

        let status = response.status();
        let text = response.text().await.context("reading upstream response body")?;
        Ok((status, text))
    }

    /// Send `POST /v1/chat/completions` and return an [`SseStream`] for proxying.
    ///
    /// The upstream response bytes are forwarded verbatim — no buffering, no
    /// schema translation. Uses the no-timeout `stream_client`.
    pub async fn chat_completions_stream(&self, body: &Value) -> anyhow::Result<(reqwest::StatusCode, SseStream)> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let response = self
            .stream_client
            .post(&url)
            .json(body)
            .send()
            .await
            .with_context(|| format!("POST {url} (streaming)"))?;
        let status = response.status();
        let stream = response.bytes_stream().map(|r| r.map_err(anyhow::Error::from));
        Ok((status, Box::pin(stream)))
    }
}
