//! Safety telemetry sink.
//!
//! The core reports structured security and degradation signals here instead
//! of logging inline, so deployments can fan them out to their own pipeline.
//! Implementations must not block: `record` is called from hot orchestration
//! paths.

use std::sync::Arc;

/// Structured events the core emits for security monitoring.
#[derive(Debug, Clone)]
pub enum SafetyEvent {
    SuspiciousQuery {
        risk: &'static str,
        patterns: Vec<String>,
    },
    MultiTurnAttack {
        risk: &'static str,
        patterns: Vec<String>,
    },
    OutputValidationIssue {
        model: String,
        risk: &'static str,
        issue_count: usize,
    },
    RankingParseFailure {
        model: String,
        reason: &'static str,
    },
    RankingManipulation {
        patterns: Vec<String>,
    },
    ModelTimeout {
        stage: &'static str,
        model: String,
        elapsed_secs: f64,
    },
    CircuitOpen {
        model: String,
    },
    StageTimeout {
        stage: &'static str,
        elapsed_secs: f64,
        completed: usize,
        total: usize,
    },
    StageInsufficient {
        stage: &'static str,
        received: usize,
        required: usize,
    },
}

pub trait TelemetrySink: Send + Sync {
    /// Record one event. Must return promptly; buffer or drop internally.
    fn record(&self, event: SafetyEvent);
}

/// Default sink: structured `tracing` records at warn level.
pub struct TracingSink;

impl TelemetrySink for TracingSink {
    fn record(&self, event: SafetyEvent) {
        match event {
            SafetyEvent::SuspiciousQuery { risk, patterns } => {
                tracing::warn!(risk, ?patterns, "suspicious query detected");
            }
            SafetyEvent::MultiTurnAttack { risk, patterns } => {
                tracing::warn!(risk, ?patterns, "multi-turn attack pattern detected");
            }
            SafetyEvent::OutputValidationIssue {
                model,
                risk,
                issue_count,
            } => {
                tracing::warn!(model = %model, risk, issue_count, "output validation issues");
            }
            SafetyEvent::RankingParseFailure { model, reason } => {
                tracing::warn!(model = %model, reason, "ranking parse failure");
            }
            SafetyEvent::RankingManipulation { patterns } => {
                tracing::warn!(?patterns, "ranking manipulation detected");
            }
            SafetyEvent::ModelTimeout {
                stage,
                model,
                elapsed_secs,
            } => {
                tracing::warn!(stage, model = %model, elapsed_secs, "model timeout");
            }
            SafetyEvent::CircuitOpen { model } => {
                tracing::warn!(model = %model, "circuit open — rejecting call");
            }
            SafetyEvent::StageTimeout {
                stage,
                elapsed_secs,
                completed,
                total,
            } => {
                tracing::error!(stage, elapsed_secs, completed, total, "stage timeout");
            }
            SafetyEvent::StageInsufficient {
                stage,
                received,
                required,
            } => {
                tracing::warn!(stage, received, required, "insufficient viable responses");
            }
        }
    }
}

pub type SharedSink = Arc<dyn TelemetrySink>;
