use std::sync::Arc;
use std::time::Duration;

use eventsource_stream::Eventsource;
use futures_util::StreamExt;
use reqwest::Client;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::client::breaker::{BreakerRegistry, Execution};
use crate::client::ModelRequest;
use crate::config::CouncilConfig;
use crate::events::{FailureKind, ModelFailure, StreamEvent, Usage};

/// Default completion budget when the caller does not set one.
pub const DEFAULT_MAX_TOKENS: u64 = 16384;

/// Cap on accumulated streaming content (defends against runaway upstreams).
pub const MAX_RESPONSE_BYTES: usize = 2 * 1024 * 1024;

/// Maximum time to wait for response headers after sending the request.
pub const HEADERS_TIMEOUT: Duration = Duration::from_secs(60);

/// Backoff ceiling before jitter.
const BACKOFF_CAP_SECS: f64 = 60.0;

/// Model families that reject the `reasoning: {exclude: true}` hint.
const NO_REASONING_EXCLUDE: &[&str] = &["gemini-3", "gemini-2.5", "kimi", "moonshot", "grok"];

/// Returns true when the payload may carry the reasoning-exclude hint.
pub fn supports_reasoning_exclude(model: &str) -> bool {
    let lower = model.to_lowercase();
    !NO_REASONING_EXCLUDE.iter().any(|f| lower.contains(f))
}

/// An error is retryable iff its code is a transient HTTP status or its
/// message names a transient condition.
pub fn is_retryable_error(message: &str, code: Option<u16>) -> bool {
    if let Some(c) = code
        && matches!(c, 429 | 500 | 502 | 503 | 504)
    {
        return true;
    }
    let msg = message.to_lowercase();
    msg.contains("overloaded") || msg.contains("rate") || msg.contains("internal server")
}

/// Full-jitter exponential backoff: `min(cap, base · 2^retries) · U(0.5, 1.5)`.
/// Rate limits get the longer base.
pub fn backoff_delay(retries: u32, rate_limited: bool) -> Duration {
    use rand::Rng;
    let base = if rate_limited { 5.0 } else { 2.0 };
    let capped = (base * 2f64.powi(retries as i32)).min(BACKOFF_CAP_SECS);
    let jitter = rand::rng().random_range(0.5..1.5);
    Duration::from_secs_f64(capped * jitter)
}

/// SSE streaming chunk from the chat-completions endpoint. A chunk carries a
/// content delta, a usage summary, or an error object.
#[derive(Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    usage: Option<UsageChunk>,
    error: Option<ApiError>,
}

#[derive(Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
    finish_reason: Option<String>,
}

#[derive(Deserialize, Default)]
struct StreamDelta {
    content: Option<String>,
}

#[derive(Deserialize)]
struct UsageChunk {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    #[serde(default)]
    total_tokens: u64,
    #[serde(default)]
    cache_read_input_tokens: u64,
    #[serde(default)]
    cache_creation_input_tokens: u64,
}

#[derive(Deserialize)]
struct ApiError {
    message: Option<String>,
    code: Option<serde_json::Value>,
}

/// Result of parsing a single SSE event.
enum ParsedChunk {
    /// Stream is complete (`data: [DONE]`).
    Done,
    /// Content delta to accumulate and forward.
    Text(String),
    /// Model hit `max_tokens`; content is partial.
    Truncated,
    /// Usage summary chunk.
    Usage(UsageChunk),
    /// Error object embedded in the stream.
    Error { message: String, code: Option<u16> },
    /// Non-content event (keepalive, metadata) — skip.
    Skip,
}

fn parse_sse_event(data: &str) -> ParsedChunk {
    if data.trim() == "[DONE]" {
        return ParsedChunk::Done;
    }
    let Ok(chunk) = serde_json::from_str::<StreamChunk>(data) else {
        return ParsedChunk::Skip;
    };

    if let Some(err) = chunk.error {
        let code = err.code.as_ref().and_then(|v| match v {
            serde_json::Value::Number(n) => n.as_u64().map(|n| n as u16),
            serde_json::Value::String(s) => s.parse::<u16>().ok(),
            _ => None,
        });
        return ParsedChunk::Error {
            message: err.message.unwrap_or_else(|| "unknown error".to_string()),
            code,
        };
    }

    if let Some(usage) = chunk.usage {
        return ParsedChunk::Usage(usage);
    }

    let Some(choice) = chunk.choices.first() else {
        return ParsedChunk::Skip;
    };

    if choice.finish_reason.as_deref() == Some("length") {
        return ParsedChunk::Truncated;
    }

    match &choice.delta.content {
        Some(c) if !c.is_empty() => ParsedChunk::Text(c.clone()),
        _ => ParsedChunk::Skip,
    }
}

enum Attempt {
    /// Terminal events already emitted (or cancellation observed).
    Done,
    /// Transient failure; caller decides whether retries remain.
    Retry { rate_limited: bool, reason: String },
}

/// Streaming client for a single chat-completions endpoint.
///
/// One call = one model. Emits `StreamEvent`s into the caller's channel:
/// tokens as they arrive, at most one usage record, then exactly one
/// terminal. Transient upstream failures retry internally with backoff;
/// callers never see the intermediate attempts except as repeated tokens.
pub struct ModelClient {
    client: Client,
    api_url: String,
    api_key: String,
    max_retries: u32,
    breakers: Arc<BreakerRegistry>,
}

impl ModelClient {
    pub fn new(config: &CouncilConfig, breakers: Arc<BreakerRegistry>) -> Self {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(4)
            .build()
            .expect("failed to build HTTP client");

        Self {
            client,
            api_url: config.api_url.clone(),
            api_key: config.api_key.clone(),
            max_retries: config.max_retries,
            breakers: breakers.clone(),
        }
    }

    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        &self.breakers
    }

    /// Stream one model call, emitting events into `events`.
    ///
    /// Never panics and never returns an error: every failure mode becomes a
    /// terminal `StreamEvent::Error`. A dropped receiver or a cancelled token
    /// stops the call silently.
    pub async fn stream_chat(&self, req: &ModelRequest, events: &mpsc::Sender<StreamEvent>) {
        let start = Instant::now();

        match self.breakers.can_execute(&req.model).await {
            Execution::Rejected { retry_in } => {
                let _ = events
                    .send(StreamEvent::Error {
                        model: req.model.clone(),
                        error: ModelFailure::new(
                            FailureKind::Unavailable,
                            format!(
                                "model temporarily unavailable — retry in {}s",
                                retry_in.as_secs().max(1)
                            ),
                        ),
                    })
                    .await;
                return;
            }
            Execution::Allowed => {}
        }

        let mut retries = 0u32;
        loop {
            match self.attempt(req, events, start).await {
                Attempt::Done => return,
                Attempt::Retry {
                    rate_limited,
                    reason,
                } => {
                    if retries >= self.max_retries {
                        self.breakers.record_failure(&req.model).await;
                        let kind = if rate_limited {
                            FailureKind::RateLimited
                        } else {
                            FailureKind::Upstream
                        };
                        let _ = events
                            .send(StreamEvent::Error {
                                model: req.model.clone(),
                                error: ModelFailure::new(
                                    kind,
                                    format!("retries exhausted: {reason}"),
                                ),
                            })
                            .await;
                        return;
                    }

                    let delay = backoff_delay(retries, rate_limited);
                    retries += 1;
                    tracing::warn!(
                        model = %req.model,
                        retries,
                        delay_ms = delay.as_millis() as u64,
                        reason = %reason,
                        "retrying model call"
                    );
                    if self.sleep_or_cancel(req, delay).await {
                        return; // cancelled during backoff — emit nothing
                    }
                }
            }
        }
    }

    /// Sleep for `delay`, returning true if cancellation fired first.
    async fn sleep_or_cancel(&self, req: &ModelRequest, delay: Duration) -> bool {
        let cancel = req.cancellation_token.clone();
        let cancel_fut = async {
            match &cancel {
                Some(t) => t.cancelled().await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            _ = cancel_fut => true,
            _ = tokio::time::sleep(delay) => false,
        }
    }

    /// Read response body in chunks, stopping at `max_bytes`.
    /// Used only for error response bodies (non-SSE).
    async fn read_body_capped(
        response: &mut reqwest::Response,
        max_bytes: usize,
    ) -> Result<Vec<u8>, reqwest::Error> {
        let mut body = Vec::with_capacity(max_bytes.min(64 * 1024));
        loop {
            match response.chunk().await {
                Ok(Some(chunk)) => {
                    let remaining = (max_bytes + 1).saturating_sub(body.len());
                    let to_copy = chunk.len().min(remaining);
                    body.extend_from_slice(&chunk[..to_copy]);
                    if body.len() > max_bytes {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => return Err(e),
            }
        }
        Ok(body)
    }

    fn build_payload(&self, req: &ModelRequest) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": req.model,
            "messages": req.messages.as_ref(),
            "stream": true,
            "max_tokens": req.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            "usage": {"include": true},
        });
        if let Some(t) = req.temperature {
            body["temperature"] = serde_json::json!(t);
        }
        if let Some(p) = req.top_p {
            body["top_p"] = serde_json::json!(p);
        }
        if supports_reasoning_exclude(&req.model) {
            // Hide hidden-reasoning tokens; only the final answer streams.
            body["reasoning"] = serde_json::json!({"exclude": true});
        }
        body
    }

    async fn emit_timeout(&self, req: &ModelRequest, events: &mpsc::Sender<StreamEvent>) {
        let _ = events
            .send(StreamEvent::Error {
                model: req.model.clone(),
                error: ModelFailure::new(FailureKind::Timeout, "model timeout"),
            })
            .await;
    }

    async fn attempt(
        &self,
        req: &ModelRequest,
        events: &mpsc::Sender<StreamEvent>,
        start: Instant,
    ) -> Attempt {
        let now = Instant::now();
        if now >= req.deadline {
            self.emit_timeout(req, events).await;
            return Attempt::Done;
        }

        let payload = self.build_payload(req);
        let send_future = self
            .client
            .post(&self.api_url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&payload)
            .send();

        // Scoped timeout around send() — covers the gap between connection
        // and first response header.
        let remaining = req.deadline - now;
        let headers_timeout = remaining.min(HEADERS_TIMEOUT);
        let response = match tokio::time::timeout(headers_timeout, send_future).await {
            Ok(Ok(resp)) => resp,
            Ok(Err(e)) => {
                return Attempt::Retry {
                    rate_limited: false,
                    reason: format!("transport error: {e}"),
                };
            }
            Err(_) => {
                if Instant::now() >= req.deadline {
                    self.emit_timeout(req, events).await;
                    return Attempt::Done;
                }
                return Attempt::Retry {
                    rate_limited: false,
                    reason: "no response headers".to_string(),
                };
            }
        };

        let status = response.status();

        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Attempt::Retry {
                rate_limited: true,
                reason: "429 rate limited".to_string(),
            };
        }

        if status.is_server_error() {
            self.breakers.record_failure(&req.model).await;
            return Attempt::Retry {
                rate_limited: false,
                reason: format!("upstream status {status}"),
            };
        }

        if !status.is_success() {
            // Non-retryable (4xx other than 429). Error bodies are not SSE —
            // read capped so a stalled upstream can't hang the task.
            let mut response = response;
            let body = tokio::time::timeout(
                Duration::from_secs(5),
                Self::read_body_capped(&mut response, MAX_RESPONSE_BYTES),
            )
            .await
            .unwrap_or(Ok(Vec::new()))
            .unwrap_or_default();
            let text = String::from_utf8_lossy(&body);
            let preview: String = text.chars().take(200).collect();
            let _ = events
                .send(StreamEvent::Error {
                    model: req.model.clone(),
                    error: ModelFailure::new(
                        FailureKind::Upstream,
                        format!("status {status}: {preview}"),
                    ),
                })
                .await;
            return Attempt::Done;
        }

        self.read_sse_stream(response, req, events, start).await
    }

    /// Read the SSE stream, forwarding tokens and finishing with exactly one
    /// terminal event. Accumulation is per-attempt: a retried call starts
    /// clean so the terminal content reflects a single coherent response.
    async fn read_sse_stream(
        &self,
        response: reqwest::Response,
        req: &ModelRequest,
        events: &mpsc::Sender<StreamEvent>,
        start: Instant,
    ) -> Attempt {
        let mut stream = response.bytes_stream().eventsource();
        let mut accumulated = String::new();
        let mut usage: Option<Usage> = None;
        let mut ttft_ms: Option<u64> = None;
        let mut truncated = false;

        let cancel = req.cancellation_token.clone();
        let cancel_fut = async {
            match &cancel {
                Some(t) => t.cancelled().await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(cancel_fut);

        let deadline_sleep = tokio::time::sleep_until(req.deadline);
        tokio::pin!(deadline_sleep);

        loop {
            tokio::select! {
                _ = &mut cancel_fut => {
                    // Cancellation observed: abort the HTTP stream, emit nothing.
                    return Attempt::Done;
                }
                _ = &mut deadline_sleep => {
                    self.emit_timeout(req, events).await;
                    return Attempt::Done;
                }
                event = stream.next() => match event {
                    Some(Ok(ev)) => match parse_sse_event(&ev.data) {
                        ParsedChunk::Done => break,
                        ParsedChunk::Text(text) => {
                            if ttft_ms.is_none() {
                                ttft_ms = Some(start.elapsed().as_millis() as u64);
                            }
                            if accumulated.len() + text.len() > MAX_RESPONSE_BYTES {
                                self.breakers.record_failure(&req.model).await;
                                let _ = events.send(StreamEvent::Error {
                                    model: req.model.clone(),
                                    error: ModelFailure::new(
                                        FailureKind::Upstream,
                                        format!("streaming response too large: >{MAX_RESPONSE_BYTES}B"),
                                    ),
                                }).await;
                                return Attempt::Done;
                            }
                            accumulated.push_str(&text);
                            if events.send(StreamEvent::Token {
                                model: req.model.clone(),
                                text,
                            }).await.is_err() {
                                return Attempt::Done; // receiver gone
                            }
                        }
                        ParsedChunk::Truncated => {
                            truncated = true;
                            let _ = events.send(StreamEvent::Truncated {
                                model: req.model.clone(),
                            }).await;
                            break;
                        }
                        ParsedChunk::Usage(chunk) => {
                            usage = Some(Usage {
                                prompt_tokens: chunk.prompt_tokens,
                                completion_tokens: chunk.completion_tokens,
                                total_tokens: chunk.total_tokens,
                                cache_read_input_tokens: chunk.cache_read_input_tokens,
                                cache_creation_input_tokens: chunk.cache_creation_input_tokens,
                                time_to_first_token_ms: ttft_ms,
                                total_latency_ms: start.elapsed().as_millis() as u64,
                            });
                        }
                        ParsedChunk::Error { message, code } => {
                            if is_retryable_error(&message, code) {
                                return Attempt::Retry {
                                    rate_limited: code == Some(429),
                                    reason: message,
                                };
                            }
                            if code.is_some_and(|c| c >= 500) {
                                self.breakers.record_failure(&req.model).await;
                            }
                            let preview: String = message.chars().take(200).collect();
                            let _ = events.send(StreamEvent::Error {
                                model: req.model.clone(),
                                error: ModelFailure::new(FailureKind::Upstream, preview),
                            }).await;
                            return Attempt::Done;
                        }
                        ParsedChunk::Skip => {}
                    },
                    Some(Err(e)) => {
                        return Attempt::Retry {
                            rate_limited: false,
                            reason: format!("SSE stream error: {e}"),
                        };
                    }
                    None => {
                        // Stream ended without [DONE] — incomplete response.
                        return Attempt::Retry {
                            rate_limited: false,
                            reason: "stream ended without [DONE] marker".to_string(),
                        };
                    }
                },
            }
        }

        self.breakers.record_success(&req.model).await;
        if truncated {
            tracing::warn!(model = %req.model, bytes = accumulated.len(), "response truncated at max_tokens");
        }
        if let Some(u) = usage.take() {
            // Usage precedes the terminal so consumers can attach it.
            let _ = events
                .send(StreamEvent::Usage {
                    model: req.model.clone(),
                    usage: u,
                })
                .await;
        }
        let _ = events
            .send(StreamEvent::Complete {
                model: req.model.clone(),
                content: accumulated,
            })
            .await;
        Attempt::Done
    }
}
