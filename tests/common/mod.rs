//! Mock chat-completions SSE servers for integration tests.
//!
//! Raw TCP listeners speaking just enough HTTP/1.1 + SSE for the client:
//! each accepted connection reads the POST request, hands the JSON body to a
//! routing closure, and plays back the scripted behavior.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// Install a test-friendly tracing subscriber (no-op when one exists).
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub const SSE_HEADERS: &[u8] = b"HTTP/1.1 200 OK\r\n\
    Content-Type: text/event-stream\r\n\
    Connection: close\r\n\r\n";

pub fn sse_token(text: &str) -> String {
    format!(
        "data: {}\n\n",
        serde_json::json!({"choices": [{"delta": {"content": text}}]})
    )
}

pub fn sse_usage(prompt_tokens: u64, completion_tokens: u64) -> String {
    format!(
        "data: {}\n\n",
        serde_json::json!({"usage": {
            "prompt_tokens": prompt_tokens,
            "completion_tokens": completion_tokens,
            "total_tokens": prompt_tokens + completion_tokens,
        }})
    )
}

pub fn sse_error_chunk(message: &str, code: u16) -> String {
    format!(
        "data: {}\n\n",
        serde_json::json!({"error": {"message": message, "code": code}})
    )
}

pub fn sse_length_stop() -> String {
    "data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"length\"}]}\n\n".to_string()
}

pub const SSE_DONE: &[u8] = b"data: [DONE]\n\n";

/// Read one HTTP request (headers + content-length body) from the socket.
/// Returns the body as a string.
pub async fn read_request(socket: &mut TcpStream) -> String {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = match socket.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        buf.extend_from_slice(&chunk[..n]);
        if let Some(header_end) = find_subslice(&buf, b"\r\n\r\n") {
            let headers = String::from_utf8_lossy(&buf[..header_end]).to_lowercase();
            let content_length = headers
                .lines()
                .find_map(|l| l.strip_prefix("content-length:"))
                .and_then(|v| v.trim().parse::<usize>().ok())
                .unwrap_or(0);
            let body_start = header_end + 4;
            if buf.len() >= body_start + content_length {
                return String::from_utf8_lossy(&buf[body_start..body_start + content_length])
                    .to_string();
            }
        }
    }
    String::from_utf8_lossy(&buf).to_string()
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// What a mock connection does after reading the request.
#[derive(Clone)]
pub enum Behavior {
    /// Headers, tokens (with an optional inter-token delay), optional usage
    /// chunk, then `[DONE]`.
    Stream {
        tokens: Vec<String>,
        usage: bool,
        token_delay: Duration,
    },
    /// Tokens, then the connection drops without `[DONE]`.
    DropMidStream { tokens: Vec<String> },
    /// Tokens, then a `finish_reason: length` stop, usage, and `[DONE]`.
    Truncate { tokens: Vec<String> },
    /// SSE headers then silence.
    Stall,
    /// Plain HTTP error status with a small body.
    HttpStatus(u16),
    /// SSE stream carrying an error object.
    ErrorChunk { message: String, code: u16 },
}

impl Behavior {
    pub fn stream(tokens: &[&str]) -> Self {
        Behavior::Stream {
            tokens: tokens.iter().map(|t| t.to_string()).collect(),
            usage: true,
            token_delay: Duration::ZERO,
        }
    }

    async fn play(self, mut socket: TcpStream) {
        match self {
            Behavior::Stream {
                tokens,
                usage,
                token_delay,
            } => {
                let _ = socket.write_all(SSE_HEADERS).await;
                for token in &tokens {
                    if !token_delay.is_zero() {
                        tokio::time::sleep(token_delay).await;
                    }
                    let _ = socket.write_all(sse_token(token).as_bytes()).await;
                }
                if usage {
                    let _ = socket.write_all(sse_usage(100, 20).as_bytes()).await;
                }
                let _ = socket.write_all(SSE_DONE).await;
            }
            Behavior::DropMidStream { tokens } => {
                let _ = socket.write_all(SSE_HEADERS).await;
                for token in &tokens {
                    let _ = socket.write_all(sse_token(token).as_bytes()).await;
                }
                // drop without [DONE]
            }
            Behavior::Truncate { tokens } => {
                let _ = socket.write_all(SSE_HEADERS).await;
                for token in &tokens {
                    let _ = socket.write_all(sse_token(token).as_bytes()).await;
                }
                let _ = socket.write_all(sse_length_stop().as_bytes()).await;
                let _ = socket.write_all(sse_usage(100, 20).as_bytes()).await;
                let _ = socket.write_all(SSE_DONE).await;
            }
            Behavior::Stall => {
                let _ = socket.write_all(SSE_HEADERS).await;
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            Behavior::HttpStatus(status) => {
                let body = "mock upstream rejection";
                let response = format!(
                    "HTTP/1.1 {status} Mock\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = socket.write_all(response.as_bytes()).await;
            }
            Behavior::ErrorChunk { message, code } => {
                let _ = socket.write_all(SSE_HEADERS).await;
                let _ = socket
                    .write_all(sse_error_chunk(&message, code).as_bytes())
                    .await;
                let _ = socket.write_all(SSE_DONE).await;
            }
        }
    }
}

/// Spawn a router server: every accepted connection reads the request body
/// and plays the behavior the routing closure picks. Returns the base URL.
pub async fn spawn_router<F>(route: F) -> String
where
    F: Fn(&str) -> Behavior + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let route = Arc::new(route);
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            let route = route.clone();
            tokio::spawn(async move {
                let body = read_request(&mut socket).await;
                route(&body).play(socket).await;
            });
        }
    });
    format!("http://127.0.0.1:{port}/v1/chat/completions")
}

/// Model name extracted from a request body, e.g. `mock/alpha`.
pub fn model_of(body: &str) -> String {
    let value: serde_json::Value = serde_json::from_str(body).unwrap_or_default();
    value["model"].as_str().unwrap_or("").to_string()
}

/// Concatenated message contents from a request body.
pub fn prompt_of(body: &str) -> String {
    let value: serde_json::Value = serde_json::from_str(body).unwrap_or_default();
    value["messages"]
        .as_array()
        .map(|messages| {
            messages
                .iter()
                .filter_map(|m| m["content"].as_str())
                .collect::<Vec<_>>()
                .join("\n")
        })
        .unwrap_or_default()
}
