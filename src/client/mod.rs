pub mod breaker;
pub mod http;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// One streaming model call. The message list is shared across the fan-out
/// via `Arc` so a stage does not clone potentially large prompts per model.
#[derive(Debug, Clone)]
pub struct ModelRequest {
    pub model: String,
    pub messages: Arc<[Message]>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u64>,
    pub top_p: Option<f64>,
    /// Absolute deadline for this call; the client emits a timeout error
    /// and stops when it passes.
    pub deadline: Instant,
    /// Cooperative cancellation. When cancelled, the HTTP stream is aborted
    /// and no further events are emitted.
    pub cancellation_token: Option<CancellationToken>,
}
