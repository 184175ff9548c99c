use thiserror::Error;

#[derive(Debug, Error)]
pub enum CouncilError {
    #[error("query too long: {chars} chars exceeds limit of {limit}")]
    QueryTooLong { chars: usize, limit: usize },

    #[error("model not found: {0}")]
    ModelNotFound(String),

    #[error("timeout after {0}ms")]
    Timeout(u64),

    #[error("rate limited by upstream for {model}")]
    RateLimited { model: String },

    #[error("circuit open for {model}: retry in {retry_in_secs}s")]
    CircuitOpen { model: String, retry_in_secs: u64 },

    #[error("upstream error from {model}: {message}")]
    Upstream {
        model: String,
        message: String,
        status: Option<u16>,
    },

    #[error("cancelled after {0}ms")]
    Cancelled(u64),

    #[error("insufficient responses for {stage}: got {received}/{total}, need at least {required}")]
    InsufficientCouncil {
        stage: &'static str,
        received: usize,
        required: usize,
        total: usize,
    },

    #[error("all chairman models failed")]
    AllChairmenFailed,

    #[error("request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("{0}")]
    Other(String),
}

impl CouncilError {
    /// Produce a sanitized error message safe for returning to end users.
    /// Does not leak internal URLs, connection details, or upstream error bodies.
    pub fn user_message(&self) -> String {
        match self {
            Self::QueryTooLong { chars, limit } => {
                format!("query too long: {chars} chars exceeds limit of {limit}")
            }
            Self::ModelNotFound(model) => format!("model not found: {model}"),
            Self::Timeout(ms) => format!("request timed out after {ms}ms"),
            Self::RateLimited { .. } => "rate limited by upstream — try again shortly".to_string(),
            Self::CircuitOpen { retry_in_secs, .. } => {
                format!("model temporarily unavailable — retry in {retry_in_secs}s")
            }
            Self::Upstream { .. } => "upstream model error".to_string(),
            Self::Cancelled(ms) => format!("cancelled after {ms}ms"),
            Self::InsufficientCouncil {
                received, required, ..
            } => {
                format!("too few council responses: got {received}, need {required}")
            }
            Self::AllChairmenFailed => "all chairman models failed".to_string(),
            Self::Request(_) => "request to provider failed".to_string(),
            Self::Other(_) => "an error occurred".to_string(),
        }
    }
}
