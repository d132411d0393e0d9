//! Backend client factory and unified dispatch interface.
//!
//! [`BackendClient`] wraps the concrete provider adapter chosen at
//! construction time from a [`Provider`]. All routing code interacts with
//! the same two-method API (`chat_completions`, `chat_completions_stream`);
//! adapter-specific protocol differences are fully encapsulated in the
//! adapter modules.

mod anthropic;
mod openai;

pub use anthropic::AnthropicAdapter;
pub use openai::OpenAIAdapter;

use std::pin::Pin;

use bytes::Bytes;
use futures_util::Stream;
use reqwest::StatusCode;
use serde_json::Value;

use crate::catalog::Provider;

/// A `Send`-able, heap-allocated SSE byte stream.
pub type SseStream = Pin<Box<dyn Stream<Item = anyhow::Result<Bytes>> + Send>>;

/// Unified backend client — dispatch over a concrete provider adapter.
///
/// Constructed per-attempt from a [`Provider`] + bare model name + resolved
/// API key; the correct adapter is selected once at construction time.
pub enum BackendClient {
    /// OpenAI-compatible passthrough: openai, openrouter, google, deepseek.
    OpenAI(OpenAIAdapter),
    /// Anthropic Messages API with request/response translation.
    Anthropic(AnthropicAdapter),
}

const DEFAULT_TIMEOUT_MS: u64 = 60_000;

impl BackendClient {
    /// Build a backend client for `provider`, resolving auth headers from
    /// `api_key`.
    pub fn new(provider: Provider, api_key: &str) -> anyhow::Result<Self> {
        let base_url = provider.base_url().to_string();
        let headers = provider.auth_headers(api_key)?;

        Ok(match provider {
            Provider::Anthropic => {
                Self::Anthropic(AnthropicAdapter::new(base_url, DEFAULT_TIMEOUT_MS, headers)?)
            }
            Provider::OpenAI | Provider::Google | Provider::Deepseek | Provider::Openrouter => {
                Self::OpenAI(OpenAIAdapter::new(base_url, DEFAULT_TIMEOUT_MS, headers)?)
            }
        })
    }

    /// Forward a non-streaming `/v1/chat/completions`-shaped request.
    ///
    /// The request body should already have `model` rewritten to the bare
    /// (provider-stripped) model name by the caller.
    pub async fn chat_completions(&self, request: &Value) -> anyhow::Result<(StatusCode, String)> {
        match self {
            Self::OpenAI(a) => a.chat_completions(request).await,
            Self::Anthropic(a) => a.chat_completions(request).await,
        }
    }

    /// Forward a streaming request and return the upstream status plus an
    /// [`SseStream`] of OpenAI-shaped SSE frames.
    pub async fn chat_completions_stream(&self, request: &Value) -> anyhow::Result<(StatusCode, SseStream)> {
        match self {
            Self::OpenAI(a) => a.chat_completions_stream(request).await,
            Self::Anthropic(a) => a.chat_completions_stream(request).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn ok_completion_body() -> serde_json::Value {
        json!({
            "choices": [{
                "message": {
                    "content": "Here is a comprehensive response that is definitely long enough."
                }
            }]
        })
    }

    #[test]
    fn new_builds_openai_adapter_for_openai_compatible_providers() {
        for provider in [Provider::OpenAI, Provider::Google, Provider::Deepseek, Provider::Openrouter] {
            assert!(BackendClient::new(provider, "sk-test").is_ok());
        }
    }

    #[test]
    fn new_builds_anthropic_adapter_for_anthropic() {
        assert!(BackendClient::new(Provider::Anthropic, "sk-test").is_ok());
    }

    #[tokio::test]
    async fn chat_completions_returns_status_and_body_on_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(ok_completion_body()))
            .mount(&server)
            .await;

        let headers = Provider::OpenAI.auth_headers("sk-test").unwrap();
        let adapter = OpenAIAdapter::new(server.uri(), 5_000, headers).unwrap();
        let (status, body) = adapter
            .chat_completions(&json!({"model": "test", "messages": []}))
            .await
            .unwrap();

        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("comprehensive"));
    }

    #[tokio::test]
    async fn chat_completions_surfaces_non_2xx_status_without_erroring() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(429).set_body_string("rate limited"))
            .mount(&server)
            .await;

        let headers = Provider::OpenAI.auth_headers("sk-test").unwrap();
        let adapter = OpenAIAdapter::new(server.uri(), 5_000, headers).unwrap();
        let (status, body) = adapter
            .chat_completions(&json!({"model": "test", "messages": []}))
            .await
            .unwrap();

        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body, "rate limited");
    }
}
