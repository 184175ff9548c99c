//! Stage 1: fan the question out to the council members.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::client::Message;
use crate::error::CouncilError;
use crate::events::{CouncilEvent, FailureKind, Stage1Result};
use crate::mux::{run_stage, ModelOutput, MuxEvent, StagePlan};
use crate::presets::StageId;
use crate::registry::ModelRole;
use crate::safety::{
    detect_multi_turn_attack, detect_suspicious_query, validate_query_length, wrap_user_query,
};
use crate::telemetry::{SafetyEvent, SharedSink};

use super::{Council, CouncilOptions};

#[derive(Debug, Clone, Default)]
pub struct Stage1Request {
    pub query: String,
    /// Prior conversation turns included for follow-up context.
    pub history: Vec<Message>,
    pub options: CouncilOptions,
}

pub(crate) fn outputs_to_results(outputs: Vec<ModelOutput>) -> Vec<Stage1Result> {
    outputs
        .into_iter()
        .map(|o| Stage1Result {
            model: o.model,
            response: o.content,
            usage: o.usage,
        })
        .collect()
}

fn record_model_failure(telemetry: &SharedSink, stage: &'static str, model: &str, kind: FailureKind) {
    match kind {
        FailureKind::Timeout => telemetry.record(SafetyEvent::ModelTimeout {
            stage,
            model: model.to_string(),
            elapsed_secs: 0.0,
        }),
        FailureKind::Unavailable => telemetry.record(SafetyEvent::CircuitOpen {
            model: model.to_string(),
        }),
        _ => {}
    }
}

impl Council {
    /// Run Stage 1, returning its event stream.
    ///
    /// Fails fast (before any event) when the query exceeds the length
    /// limit. Suspicious-query and multi-turn signals are logged, never
    /// blocking.
    pub async fn stage1_stream(
        &self,
        req: Stage1Request,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<CouncilEvent>, CouncilError> {
        let length = validate_query_length(&req.query, self.config.max_query_chars);
        if !length.valid {
            return Err(CouncilError::QueryTooLong {
                chars: length.chars,
                limit: length.limit,
            });
        }

        let suspicion = detect_suspicious_query(&req.query);
        if suspicion.suspicious {
            self.telemetry.record(SafetyEvent::SuspiciousQuery {
                risk: suspicion.risk.as_str(),
                patterns: suspicion.patterns,
            });
        }
        if !req.history.is_empty() {
            let multi_turn = detect_multi_turn_attack(&req.history, &req.query);
            if multi_turn.suspicious {
                self.telemetry.record(SafetyEvent::MultiTurnAttack {
                    risk: multi_turn.risk.as_str(),
                    patterns: multi_turn.patterns,
                });
            }
        }

        let models = self.registry.get_models(ModelRole::CouncilMember).await;
        let stage_config = self
            .resolve_stage_config(&req.options, StageId::Stage1)
            .await;

        let mut messages = Vec::with_capacity(req.history.len() + 2);
        if let Some(context) = self
            .system_prompt(&req.options, stage_config.max_tokens)
            .await
        {
            messages.push(Message::system(context.system_prompt));
        }
        messages.extend(req.history);
        messages.push(Message::user(wrap_user_query(&req.query)));

        let plan = StagePlan {
            models,
            temperature: Some(stage_config.temperature),
            max_tokens: Some(stage_config.max_tokens),
            top_p: stage_config.top_p,
            stage_deadline: self.config.stage1_timeout,
            per_model_deadline: self.config.per_model_timeout,
            min_required: self.config.min_stage1_responses,
            stagger: self.config.stage1_stagger,
        };

        let mut mux_rx = run_stage(
            self.client.clone(),
            plan,
            Arc::from(messages),
            self.config.merge_queue_cap,
            cancel,
        );

        let (tx, rx) = mpsc::channel(self.config.merge_queue_cap);
        let telemetry = self.telemetry.clone();
        tokio::spawn(async move {
            while let Some(ev) = mux_rx.recv().await {
                let mapped = match ev {
                    MuxEvent::ModelStarted { model } => {
                        tracing::debug!(model = %model, "stage1 model started");
                        continue;
                    }
                    MuxEvent::Token { model, text } => CouncilEvent::Stage1Token {
                        model,
                        content: text,
                    },
                    MuxEvent::Truncated { model } => {
                        tracing::warn!(model = %model, "stage1 response truncated");
                        continue;
                    }
                    MuxEvent::ModelComplete {
                        model,
                        content,
                        usage,
                    } => CouncilEvent::Stage1ModelComplete {
                        model,
                        response: content,
                        usage,
                    },
                    MuxEvent::ModelError { model, error } => {
                        record_model_failure(&telemetry, "stage1", &model, error.kind);
                        CouncilEvent::Stage1ModelError {
                            model,
                            error: error.message,
                        }
                    }
                    MuxEvent::StageTimeout {
                        elapsed,
                        timeout,
                        completed,
                        successful,
                        total,
                    } => {
                        telemetry.record(SafetyEvent::StageTimeout {
                            stage: "stage1",
                            elapsed_secs: elapsed.as_secs_f64(),
                            completed,
                            total,
                        });
                        CouncilEvent::Stage1Timeout {
                            elapsed: elapsed.as_secs_f64(),
                            timeout: timeout.as_secs_f64(),
                            completed,
                            successful,
                            total,
                        }
                    }
                    MuxEvent::StageInsufficient {
                        received,
                        required,
                        total,
                        results,
                    } => {
                        telemetry.record(SafetyEvent::StageInsufficient {
                            stage: "stage1",
                            received,
                            required,
                        });
                        CouncilEvent::Stage1Insufficient {
                            received,
                            required,
                            total,
                            data: outputs_to_results(results),
                        }
                    }
                    MuxEvent::StageAllComplete { results } => CouncilEvent::Stage1AllComplete {
                        data: outputs_to_results(results),
                    },
                };
                if tx.send(mapped).await.is_err() {
                    return;
                }
            }
        });

        Ok(rx)
    }

    /// Drive Stage 1 to completion, discarding token events.
    pub async fn stage1_collect(
        &self,
        req: Stage1Request,
        cancel: CancellationToken,
    ) -> Result<Vec<Stage1Result>, CouncilError> {
        let mut rx = self.stage1_stream(req, cancel).await?;
        while let Some(ev) = rx.recv().await {
            match ev {
                CouncilEvent::Stage1AllComplete { data } => return Ok(data),
                CouncilEvent::Stage1Insufficient {
                    received,
                    required,
                    total,
                    ..
                } => {
                    return Err(CouncilError::InsufficientCouncil {
                        stage: "stage1",
                        received,
                        required,
                        total,
                    });
                }
                CouncilEvent::Stage1Timeout { elapsed, .. } => {
                    return Err(CouncilError::Timeout((elapsed * 1000.0) as u64));
                }
                _ => {}
            }
        }
        Err(CouncilError::Cancelled(0))
    }
}
