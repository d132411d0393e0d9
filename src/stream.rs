//! SSE byte-exact streaming pump — §4.6.
//!
//! Streamed bytes are forwarded to the client untouched; this module only
//! observes them through a side channel to recover `usage` and detect
//! `tool_calls`, so the Executor can record a [`TrafficEntry`] after the
//! stream completes. Grounded in the teacher's verbatim-forwarding
//! `chat_completions_stream` adapters and in `other_examples`'s
//! `RESMP-DEV-ccr-rust` SSE usage-verification pattern — unlike
//! `sblanchard-SerialAgent`'s `sse.rs`, which reconstructs `StreamEvent`s,
//! this pump never buffers for correctness, only to find `\n\n` frame
//! boundaries.

use async_stream::stream;
use bytes::Bytes;
use futures_util::{Stream, StreamExt as _};

use crate::backends::SseStream;

/// What the side channel observed by the time the stream ended.
#[derive(Debug, Clone, Default)]
pub struct StreamObservation {
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
    pub had_tool_calls: bool,
    pub chunk_count: u64,
    pub read_error: bool,
}

impl StreamObservation {
    /// Output token estimate: real `usage` if the upstream sent it,
    /// otherwise `ceil(1.5 * chunk_count)` (§4.6, §9).
    pub fn estimated_output_tokens(&self) -> u64 {
        self.output_tokens.unwrap_or_else(|| (self.chunk_count as f64 * 1.5).ceil() as u64)
    }
}

/// Wrap an upstream SSE byte stream, forwarding every chunk verbatim while
/// updating `observation` via the returned notifier channel.
///
/// Returns `(stream, receiver)`: the receiver yields the final
/// [`StreamObservation`] once the upstream stream ends (including on a
/// read error, in which case a synthesized `[DONE]` frame is appended so
/// downstream SSE consumers see a well-formed terminator).
pub fn observe(mut upstream: SseStream) -> (SseStream, tokio::sync::oneshot::Receiver<StreamObservation>) {
    let (tx, rx) = tokio::sync::oneshot::channel();

    let forwarded: SseStream = Box::pin(stream! {
        let mut obs = StreamObservation::default();
        let mut buf = String::new();
        let mut ended_with_error = false;

        while let Some(item) = upstream.next().await {
            match item {
                Ok(bytes) => {
                    observe_chunk(&bytes, &mut buf, &mut obs);
                    yield Ok(bytes);
                }
                Err(e) => {
                    ended_with_error = true;
                    obs.read_error = true;
                    yield Err(e);
                    break;
                }
            }
        }

        if ended_with_error {
            yield Ok(Bytes::from_static(b"data: [DONE]\n\n"));
        }

        let _ = tx.send(obs);
    });

    (forwarded, rx)
}

/// Parse as many complete `data: ...\n\n` frames as are available in `buf`
/// (after appending `chunk`), updating `obs` from any `usage` or
/// `tool_calls` fields found. Incomplete trailing data is left in `buf`
/// for the next chunk.
fn observe_chunk(chunk: &Bytes, buf: &mut String, obs: &mut StreamObservation) {
    buf.push_str(&String::from_utf8_lossy(chunk));
    while let Some(pos) = buf.find("\n\n") {
        let frame = buf[..pos].to_string();
        buf.drain(..pos + 2);
        obs.chunk_count += 1;
        for line in frame.lines() {
            let Some(data) = line.strip_prefix("data:") else { continue };
            let data = data.trim();
            if data == "[DONE]" {
                continue;
            }
            let Ok(value) = serde_json::from_str::<serde_json::Value>(data) else { continue };
            if let Some(total) = value.pointer("/usage/completion_tokens").and_then(serde_json::Value::as_u64) {
                obs.output_tokens = Some(total);
            }
            if let Some(total) = value.pointer("/usage/prompt_tokens").and_then(serde_json::Value::as_u64) {
                obs.input_tokens = Some(total);
            }
            if value
                .pointer("/choices/0/delta/tool_calls")
                .and_then(serde_json::Value::as_array)
                .is_some_and(|a| !a.is_empty())
            {
                obs.had_tool_calls = true;
            }
        }
    }
}

/// Collapse any `Stream<Item = anyhow::Result<Bytes>>` into an [`SseStream`].
pub fn boxed(s: impl Stream<Item = anyhow::Result<Bytes>> + Send + 'static) -> SseStream {
    Box::pin(s)
}
