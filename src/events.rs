use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Token usage metrics captured from the provider's streaming usage chunk,
/// plus request timing measured locally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    #[serde(default)]
    pub cache_read_input_tokens: u64,
    #[serde(default)]
    pub cache_creation_input_tokens: u64,
    /// Time from request start to first content token.
    pub time_to_first_token_ms: Option<u64>,
    pub total_latency_ms: u64,
}

/// Why a model call failed. Used for telemetry and retry accounting;
/// the stage surfaces only the sanitized message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Timeout,
    Unavailable,
    RateLimited,
    Upstream,
    Other,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl ModelFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Per-model streaming events emitted by the model client.
///
/// A call emits zero or more `Token`s, at most one `Usage` (immediately
/// before the terminal), then exactly one terminal (`Complete` or `Error`).
/// Nothing is emitted after cancellation is observed.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Token { model: String, text: String },
    /// The model hit `max_tokens`; accumulated content is partial.
    Truncated { model: String },
    Usage { model: String, usage: Usage },
    Error { model: String, error: ModelFailure },
    Complete { model: String, content: String },
}

impl StreamEvent {
    pub fn model(&self) -> &str {
        match self {
            Self::Token { model, .. }
            | Self::Truncated { model }
            | Self::Usage { model, .. }
            | Self::Error { model, .. }
            | Self::Complete { model, .. } => model,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Error { .. } | Self::Complete { .. })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage1Result {
    pub model: String,
    pub response: String,
    pub usage: Option<Usage>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Stage2Result {
    pub model: String,
    /// Full ranking text as produced by the reviewer.
    pub ranking: String,
    /// Labels in ranked order, best first (e.g. `["Response B", "Response A"]`).
    pub parsed_ranking: Vec<String>,
    pub usage: Option<Usage>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AggregateRanking {
    pub model: String,
    pub average_rank: f64,
    pub rankings_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SecurityValidation {
    pub is_safe: bool,
    pub risk_level: String,
    pub issue_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct Stage3Result {
    pub model: String,
    pub response: String,
    pub usage: Option<Usage>,
    pub security_validation: SecurityValidation,
}

/// The transport-facing event stream for a council run.
///
/// Serializes with the wire tags callers forward over SSE, e.g.
/// `{"type":"stage1_token","model":"...","content":"..."}`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CouncilEvent {
    Stage1Token {
        model: String,
        content: String,
    },
    Stage1ModelComplete {
        model: String,
        response: String,
        usage: Option<Usage>,
    },
    Stage1ModelError {
        model: String,
        error: String,
    },
    Stage1Timeout {
        elapsed: f64,
        timeout: f64,
        completed: usize,
        successful: usize,
        total: usize,
    },
    Stage1Insufficient {
        received: usize,
        required: usize,
        total: usize,
        data: Vec<Stage1Result>,
    },
    Stage1AllComplete {
        data: Vec<Stage1Result>,
    },

    Stage2Token {
        model: String,
        content: String,
    },
    Stage2ModelComplete {
        model: String,
        ranking: String,
        usage: Option<Usage>,
    },
    Stage2ModelError {
        model: String,
        error: String,
    },
    Stage2Timeout {
        elapsed: f64,
        timeout: f64,
        completed: usize,
        successful: usize,
        total: usize,
    },
    Stage2Insufficient {
        received: usize,
        required: usize,
        total: usize,
        data: Vec<Stage2Result>,
        label_to_model: BTreeMap<String, String>,
    },
    Stage2AllComplete {
        data: Vec<Stage2Result>,
        label_to_model: BTreeMap<String, String>,
        aggregate_rankings: Vec<AggregateRanking>,
        manipulation_warning: bool,
    },

    Stage3Token {
        model: String,
        content: String,
    },
    Stage3Truncated {
        model: String,
    },
    Stage3Fallback {
        failed_model: String,
        next_model: String,
    },
    Stage3Error {
        model: String,
        error: String,
    },
    Stage3Timeout {
        elapsed: f64,
        timeout: f64,
        attempted_models: usize,
    },
    Stage3Complete {
        data: Stage3Result,
    },

    ChatToken {
        model: String,
        content: String,
    },
    ChatError {
        model: String,
        error: String,
    },
    ChatComplete {
        model: String,
        content: String,
        usage: Option<Usage>,
    },
}
