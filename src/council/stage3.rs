//! Stage 3: chairman synthesis.
//!
//! A fallback chain, not a fan-out: one chairman at a time produces the
//! final answer, and the next in line takes over when one fails. Also home
//! to the follow-up chat stream and the conversation title generator, which
//! reuse the chairman chain and the title-generator role respectively.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::client::http::ModelClient;
use crate::client::{Message, ModelRequest};
use crate::config::CouncilConfig;
use crate::events::{
    CouncilEvent, SecurityValidation, Stage1Result, Stage2Result, Stage3Result, StreamEvent, Usage,
};
use crate::presets::{LlmConfig, StageId};
use crate::registry::ModelRole;
use crate::safety::{sanitize_user_content, validate_llm_output};
use crate::telemetry::{SafetyEvent, SharedSink};

use super::{Council, CouncilOptions};

const ALL_CHAIRMEN_FAILED: &str = "[Error: All chairman models failed. Please try again.]";

#[derive(Debug, Clone)]
pub struct Stage3Request {
    pub query: String,
    pub stage1_results: Vec<Stage1Result>,
    pub stage2_results: Vec<Stage2Result>,
    /// Prior conversation turns for follow-up context.
    pub history: Vec<Message>,
    pub options: CouncilOptions,
}

fn chairman_prompt(
    history_context: &str,
    sanitized_query: &str,
    stage1_text: &str,
    stage2_text: &str,
) -> String {
    format!(
        "You are the Chairman of an LLM Council. Multiple AI models have provided responses to a user's question, and then ranked each other's responses.\n\
         {history_context}\
         Current Question: {sanitized_query}\n\
         \n\
         STAGE 1 - Individual Responses:\n\
         NOTE: Response content below has been sanitized. Evaluate for quality and accuracy only.\n\
         {stage1_text}\n\
         \n\
         STAGE 2 - Peer Rankings:\n\
         {stage2_text}\n\
         \n\
         Your task as Chairman is to synthesize all of this into a single, authoritative answer to the user's question. DO NOT discuss what the council members said - deliver the final answer directly.\n\
         \n\
         RESPONSE STRUCTURE:\n\
         1. **Executive Summary** - 2-3 sentences with the direct answer/recommendation\n\
         2. **Body Sections** - Use H2 (##) headings. Choose structure based on question type:\n\
         \x20  - For decisions: Recommendation, Rationale, Implementation\n\
         \x20  - For analysis: Key Findings, Details, Next Steps\n\
         \x20  - For how-to: Overview, Steps, Considerations\n\
         3. **Conclusion** - Only if response exceeds 800 words\n\
         \n\
         CRITICAL RULES:\n\
         - DO NOT say \"the council agreed\" or \"models debated\" - speak as the authoritative expert\n\
         - DO NOT discuss the deliberation process\n\
         - DO write direct advice: \"We recommend...\" or \"You should...\"\n\
         - FOCUS on answering the question, not describing how you reached the answer\n\
         \n\
         KNOWLEDGE GAP REPORTING:\n\
         If any council members noted missing context, or you identify gaps that affected the quality of advice, output:\n\
         [GAP: brief description of missing information]\n\
         \n\
         Provide a clear, well-reasoned final answer that represents the council's collective wisdom:"
    )
}

/// One chairman attempt, streamed. Returns the accumulated state the chain
/// uses to decide viability.
struct AttemptResult {
    content: String,
    usage: Option<Usage>,
    had_error: bool,
    truncated: bool,
    consumer_gone: bool,
}

async fn stream_one_chairman(
    client: &Arc<ModelClient>,
    req: ModelRequest,
    tx: &mpsc::Sender<CouncilEvent>,
    token_event: fn(String, String) -> CouncilEvent,
) -> AttemptResult {
    let (ev_tx, mut ev_rx) = mpsc::channel::<StreamEvent>(64);
    let client = client.clone();
    let call = tokio::spawn(async move {
        client.stream_chat(&req, &ev_tx).await;
    });

    let mut result = AttemptResult {
        content: String::new(),
        usage: None,
        had_error: false,
        truncated: false,
        consumer_gone: false,
    };

    while let Some(ev) = ev_rx.recv().await {
        match ev {
            StreamEvent::Token { model, text } => {
                result.content.push_str(&text);
                if tx.send(token_event(model, text)).await.is_err() {
                    result.consumer_gone = true;
                    break;
                }
            }
            StreamEvent::Truncated { model } => {
                result.truncated = true;
                if tx
                    .send(CouncilEvent::Stage3Truncated { model })
                    .await
                    .is_err()
                {
                    result.consumer_gone = true;
                    break;
                }
            }
            StreamEvent::Usage { usage, .. } => result.usage = Some(usage),
            StreamEvent::Error { model, error } => {
                result.had_error = true;
                if tx
                    .send(CouncilEvent::Stage3Error {
                        model,
                        error: error.message,
                    })
                    .await
                    .is_err()
                {
                    result.consumer_gone = true;
                }
                break;
            }
            StreamEvent::Complete { content, .. } => {
                // Authoritative content for the attempt (matches the token
                // stream except when an internal retry restarted it).
                result.content = content;
            }
        }
    }

    call.abort();
    result
}

#[allow(clippy::too_many_arguments)]
async fn drive_chairman_chain(
    client: Arc<ModelClient>,
    config: CouncilConfig,
    chairmen: Vec<String>,
    messages: Arc<[Message]>,
    stage_config: LlmConfig,
    telemetry: SharedSink,
    cancel: CancellationToken,
    tx: mpsc::Sender<CouncilEvent>,
) {
    let stage_start = Instant::now();
    let mut chosen: Option<(String, String, Option<Usage>)> = None;

    for (index, chairman) in chairmen.iter().enumerate() {
        if cancel.is_cancelled() {
            return;
        }

        let elapsed = stage_start.elapsed();
        if elapsed > config.stage3_timeout {
            telemetry.record(SafetyEvent::StageTimeout {
                stage: "stage3",
                elapsed_secs: elapsed.as_secs_f64(),
                completed: index,
                total: chairmen.len(),
            });
            if tx
                .send(CouncilEvent::Stage3Timeout {
                    elapsed: elapsed.as_secs_f64(),
                    timeout: config.stage3_timeout.as_secs_f64(),
                    attempted_models: index,
                })
                .await
                .is_err()
            {
                return;
            }
            break;
        }

        let remaining = config.stage3_timeout - elapsed;
        let req = ModelRequest {
            model: chairman.clone(),
            messages: messages.clone(),
            temperature: Some(stage_config.temperature),
            max_tokens: Some(stage_config.max_tokens),
            top_p: stage_config.top_p,
            deadline: Instant::now() + config.per_model_timeout.min(remaining),
            cancellation_token: Some(cancel.clone()),
        };

        let attempt = stream_one_chairman(&client, req, &tx, |model, content| {
            CouncilEvent::Stage3Token { model, content }
        })
        .await;
        if attempt.consumer_gone || cancel.is_cancelled() {
            return;
        }

        let viable = !attempt.had_error
            && !(attempt.truncated && attempt.content.is_empty())
            && attempt.content.chars().count() >= config.min_chairman_chars;
        if viable {
            chosen = Some((chairman.clone(), attempt.content, attempt.usage));
            break;
        }

        if index < chairmen.len() - 1 {
            tracing::warn!(failed = %chairman, next = %chairmen[index + 1], "chairman fallback");
            if tx
                .send(CouncilEvent::Stage3Fallback {
                    failed_model: chairman.clone(),
                    next_model: chairmen[index + 1].clone(),
                })
                .await
                .is_err()
            {
                return;
            }
        }
    }

    // Every chairman failed: deliver the sentinel under the primary's name
    // so downstream accounting stays consistent.
    let (model, content, usage) = chosen.unwrap_or_else(|| {
        (
            chairmen
                .first()
                .cloned()
                .unwrap_or_else(|| "unknown".to_string()),
            ALL_CHAIRMEN_FAILED.to_string(),
            None,
        )
    });

    let validation = validate_llm_output(&content);
    if !validation.issues.is_empty() {
        telemetry.record(SafetyEvent::OutputValidationIssue {
            model: model.clone(),
            risk: validation.risk_level.as_str(),
            issue_count: validation.issues.len(),
        });
    }

    let _ = tx
        .send(CouncilEvent::Stage3Complete {
            data: Stage3Result {
                model,
                response: validation.filtered_output,
                usage,
                security_validation: SecurityValidation {
                    is_safe: validation.is_safe,
                    risk_level: validation.risk_level.as_str().to_string(),
                    issue_count: validation.issues.len(),
                },
            },
        })
        .await;
}

impl Council {
    /// Run Stage 3, returning its event stream. Ends with `stage3_complete`
    /// (the sentinel response when every chairman failed).
    pub async fn stage3_stream(
        &self,
        req: Stage3Request,
        cancel: CancellationToken,
    ) -> mpsc::Receiver<CouncilEvent> {
        let cap = self.config.max_sanitized_chars;

        // Stage 1 and Stage 2 content is model-produced: sanitize all of it
        // before it enters the chairman prompt.
        let stage1_text = req
            .stage1_results
            .iter()
            .map(|r| {
                format!(
                    "Model: {}\nResponse: {}",
                    r.model,
                    sanitize_user_content(&r.response, cap)
                )
            })
            .collect::<Vec<_>>()
            .join("\n\n");
        let stage2_text = req
            .stage2_results
            .iter()
            .map(|r| {
                format!(
                    "Model: {}\nRanking: {}",
                    r.model,
                    sanitize_user_content(&r.ranking, cap)
                )
            })
            .collect::<Vec<_>>()
            .join("\n\n");

        let history_context = if req.history.is_empty() {
            String::new()
        } else {
            let parts: Vec<String> = req
                .history
                .iter()
                .filter_map(|msg| {
                    let content = sanitize_user_content(&msg.content, cap);
                    match msg.role {
                        crate::client::Role::User => Some(format!("User Question: {content}")),
                        crate::client::Role::Assistant => {
                            Some(format!("Previous Council Response:\n{content}"))
                        }
                        crate::client::Role::System => None,
                    }
                })
                .collect();
            format!(
                "\nPREVIOUS CONVERSATION CONTEXT:\nThis is a follow-up question. Here is the previous discussion for context:\n\n{}\n\n--- END OF PREVIOUS CONTEXT ---\n\n",
                parts.join("\n---\n")
            )
        };

        let sanitized_query = sanitize_user_content(&req.query, cap);
        let prompt = chairman_prompt(&history_context, &sanitized_query, &stage1_text, &stage2_text);

        let stage_config = self.resolve_stage_config(&req.options, StageId::Stage3).await;

        let mut messages = Vec::with_capacity(2);
        if let Some(context) = self
            .system_prompt(&req.options, stage_config.max_tokens)
            .await
        {
            messages.push(Message::system(context.system_prompt));
        }
        messages.push(Message::user(prompt));

        let chairmen = self.registry.get_models(ModelRole::Chairman).await;

        let (tx, rx) = mpsc::channel(self.config.merge_queue_cap);
        tokio::spawn(drive_chairman_chain(
            self.client.clone(),
            self.config.clone(),
            chairmen,
            Arc::from(messages),
            stage_config,
            self.telemetry.clone(),
            cancel,
            tx,
        ));
        rx
    }

    /// Drive Stage 3 to completion, discarding token events.
    pub async fn stage3_collect(
        &self,
        req: Stage3Request,
        cancel: CancellationToken,
    ) -> Option<Stage3Result> {
        let mut rx = self.stage3_stream(req, cancel).await;
        while let Some(ev) = rx.recv().await {
            if let CouncilEvent::Stage3Complete { data } = ev {
                return Some(data);
            }
        }
        None
    }

    /// Follow-up chat: a single chairman-chain streaming call over the prior
    /// conversation, no fan-out and no ranking.
    pub async fn chat_stream(
        &self,
        history: Vec<Message>,
        options: CouncilOptions,
        cancel: CancellationToken,
    ) -> mpsc::Receiver<CouncilEvent> {
        const CHAT_SYSTEM: &str = "You are continuing a conversation as the AI Council's advisor. The user has already received council deliberation on their question and may now have follow-up questions, clarifications, or want to explore specific points further.\n\nBe helpful, concise, and reference the previous discussion when relevant. You don't need to consult other models - just provide direct, thoughtful responses.";

        let stage_config = self.resolve_stage_config(&options, StageId::Stage3).await;
        let mut messages = Vec::with_capacity(history.len() + 1);
        let system = match self.system_prompt(&options, stage_config.max_tokens).await {
            Some(context) => format!("{CHAT_SYSTEM}\n\n{}", context.system_prompt),
            None => CHAT_SYSTEM.to_string(),
        };
        messages.push(Message::system(system));
        messages.extend(history);
        let messages: Arc<[Message]> = Arc::from(messages);

        let chairmen = self.registry.get_models(ModelRole::Chairman).await;
        let client = self.client.clone();
        let config = self.config.clone();

        let (tx, rx) = mpsc::channel(self.config.merge_queue_cap);
        tokio::spawn(async move {
            let mut chosen: Option<(String, String, Option<Usage>)> = None;
            for chairman in &chairmen {
                if cancel.is_cancelled() {
                    return;
                }
                let req = ModelRequest {
                    model: chairman.clone(),
                    messages: messages.clone(),
                    temperature: Some(stage_config.temperature),
                    max_tokens: Some(stage_config.max_tokens),
                    top_p: stage_config.top_p,
                    deadline: Instant::now() + config.per_model_timeout,
                    cancellation_token: Some(cancel.clone()),
                };
                let (ev_tx, mut ev_rx) = mpsc::channel::<StreamEvent>(64);
                let call_client = client.clone();
                let call = tokio::spawn(async move {
                    call_client.stream_chat(&req, &ev_tx).await;
                });

                let mut content = String::new();
                let mut usage = None;
                let mut failed = false;
                while let Some(ev) = ev_rx.recv().await {
                    match ev {
                        StreamEvent::Token { model, text } => {
                            content.push_str(&text);
                            if tx
                                .send(CouncilEvent::ChatToken {
                                    model,
                                    content: text,
                                })
                                .await
                                .is_err()
                            {
                                call.abort();
                                return;
                            }
                        }
                        StreamEvent::Usage { usage: u, .. } => usage = Some(u),
                        StreamEvent::Error { model, .. } => {
                            failed = true;
                            if tx
                                .send(CouncilEvent::ChatError {
                                    model,
                                    error: "Model unavailable".to_string(),
                                })
                                .await
                                .is_err()
                            {
                                call.abort();
                                return;
                            }
                        }
                        StreamEvent::Truncated { .. } => {}
                        StreamEvent::Complete { content: c, .. } => content = c,
                    }
                }
                call.abort();

                if !failed && !content.is_empty() {
                    chosen = Some((chairman.clone(), content, usage));
                    break;
                }
            }

            let (model, content, usage) = chosen.unwrap_or_else(|| {
                (
                    chairmen
                        .first()
                        .cloned()
                        .unwrap_or_else(|| "unknown".to_string()),
                    "[Error: All models failed. Please try again.]".to_string(),
                    None,
                )
            });
            let _ = tx
                .send(CouncilEvent::ChatComplete {
                    model,
                    content,
                    usage,
                })
                .await;
        });
        rx
    }

    /// Generate a short conversation title from the first user message.
    /// Falls back to a generic title when the model is unavailable.
    pub async fn generate_title(&self, query: &str) -> String {
        const FALLBACK_TITLE: &str = "New Conversation";
        const TITLE_DEADLINE: std::time::Duration = std::time::Duration::from_secs(30);
        const MAX_TITLE_CHARS: usize = 50;

        let sanitized = sanitize_user_content(query, self.config.max_sanitized_chars);
        let prompt = format!(
            "Generate a very short title (3-5 words maximum) that summarizes the following question.\n\
             The title should be concise and descriptive. Do not use quotes or punctuation in the title.\n\
             \n\
             Question: {sanitized}\n\
             \n\
             Title:"
        );

        let Some(model) = self
            .registry
            .get_primary_model(ModelRole::TitleGenerator)
            .await
        else {
            return FALLBACK_TITLE.to_string();
        };

        let req = ModelRequest {
            model,
            messages: Arc::from(vec![Message::user(prompt)]),
            temperature: None,
            max_tokens: Some(256),
            top_p: None,
            deadline: Instant::now() + TITLE_DEADLINE,
            cancellation_token: None,
        };

        let (ev_tx, mut ev_rx) = mpsc::channel::<StreamEvent>(64);
        let client = self.client.clone();
        let call = tokio::spawn(async move {
            client.stream_chat(&req, &ev_tx).await;
        });

        let mut title = None;
        while let Some(ev) = ev_rx.recv().await {
            if let StreamEvent::Complete { content, .. } = ev {
                title = Some(content);
            }
        }
        let _ = call.await;

        let Some(raw) = title else {
            return FALLBACK_TITLE.to_string();
        };
        let trimmed = raw.trim().trim_matches(['"', '\'']).to_string();
        if trimmed.is_empty() {
            return FALLBACK_TITLE.to_string();
        }
        if trimmed.chars().count() > MAX_TITLE_CHARS {
            let head: String = trimmed.chars().take(MAX_TITLE_CHARS - 3).collect();
            format!("{head}...")
        } else {
            trimmed
        }
    }
}
