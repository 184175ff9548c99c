//! Stage fan-out/fan-in.
//!
//! Launches one model client per planned model, merges their token streams
//! onto a single bounded queue, and drives one consumer that enforces the
//! stage deadline and the minimum-viable threshold. Workers backpressure on
//! the queue; nothing is dropped.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendError;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::client::http::ModelClient;
use crate::client::{Message, ModelRequest};
use crate::events::{ModelFailure, StreamEvent, Usage};

/// Resolved execution plan for one stage invocation.
#[derive(Debug, Clone)]
pub struct StagePlan {
    pub models: Vec<String>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u64>,
    pub top_p: Option<f64>,
    pub stage_deadline: Duration,
    pub per_model_deadline: Duration,
    /// Successful responses below this count fail the stage.
    pub min_required: usize,
    /// Delay between consecutive model starts (model i waits `stagger · i`).
    pub stagger: Duration,
}

#[derive(Debug, Clone)]
pub struct ModelOutput {
    pub model: String,
    pub content: String,
    pub usage: Option<Usage>,
}

/// Merged event stream for one stage. Exactly one of the three stage-terminal
/// variants ends a run — unless the caller cancels, in which case the stream
/// just ends.
#[derive(Debug)]
pub enum MuxEvent {
    ModelStarted {
        model: String,
    },
    Token {
        model: String,
        text: String,
    },
    Truncated {
        model: String,
    },
    ModelComplete {
        model: String,
        content: String,
        usage: Option<Usage>,
    },
    ModelError {
        model: String,
        error: ModelFailure,
    },
    StageTimeout {
        elapsed: Duration,
        timeout: Duration,
        completed: usize,
        successful: usize,
        total: usize,
    },
    StageInsufficient {
        received: usize,
        required: usize,
        total: usize,
        results: Vec<ModelOutput>,
    },
    StageAllComplete {
        results: Vec<ModelOutput>,
    },
}

/// Launch a stage and return its merged event stream.
///
/// Dropping the receiver, or cancelling `cancel`, stops all model tasks; the
/// stream then ends without a stage-terminal event.
pub fn run_stage(
    client: Arc<ModelClient>,
    plan: StagePlan,
    messages: Arc<[Message]>,
    queue_cap: usize,
    cancel: CancellationToken,
) -> mpsc::Receiver<MuxEvent> {
    let (tx_out, rx_out) = mpsc::channel(queue_cap.max(1));
    tokio::spawn(drive_stage(client, plan, messages, queue_cap, cancel, tx_out));
    rx_out
}

#[derive(Default)]
struct Merge {
    started: HashSet<String>,
    pending_usage: HashMap<String, Usage>,
    results: Vec<ModelOutput>,
    completed: usize,
    successful: usize,
}

impl Merge {
    /// Map one client event onto the output channel, tracking terminals.
    /// A `ModelStarted` is emitted before the first event of each model.
    async fn forward(
        &mut self,
        tx_out: &mpsc::Sender<MuxEvent>,
        ev: StreamEvent,
    ) -> Result<(), SendError<MuxEvent>> {
        let model = ev.model().to_string();
        if self.started.insert(model.clone()) {
            tx_out.send(MuxEvent::ModelStarted { model }).await?;
        }
        match ev {
            StreamEvent::Token { model, text } => {
                tx_out.send(MuxEvent::Token { model, text }).await?;
            }
            StreamEvent::Truncated { model } => {
                tx_out.send(MuxEvent::Truncated { model }).await?;
            }
            StreamEvent::Usage { model, usage } => {
                // Buffered so the usage rides on the completion event.
                self.pending_usage.insert(model, usage);
            }
            StreamEvent::Complete { model, content } => {
                self.completed += 1;
                let usage = self.pending_usage.remove(&model);
                if !content.is_empty() {
                    self.successful += 1;
                    self.results.push(ModelOutput {
                        model: model.clone(),
                        content: content.clone(),
                        usage: usage.clone(),
                    });
                }
                tx_out
                    .send(MuxEvent::ModelComplete {
                        model,
                        content,
                        usage,
                    })
                    .await?;
            }
            StreamEvent::Error { model, error } => {
                self.completed += 1;
                tx_out.send(MuxEvent::ModelError { model, error }).await?;
            }
        }
        Ok(())
    }
}

async fn drive_stage(
    client: Arc<ModelClient>,
    plan: StagePlan,
    messages: Arc<[Message]>,
    queue_cap: usize,
    cancel: CancellationToken,
    tx_out: mpsc::Sender<MuxEvent>,
) {
    let stage_start = Instant::now();
    let total = plan.models.len();

    // Bounded merge queue: workers suspend on put when the consumer is slow.
    let (tx_merge, mut rx_merge) = mpsc::channel::<StreamEvent>(queue_cap.max(1));
    let child = cancel.child_token();
    let mut workers = JoinSet::new();

    for (i, model) in plan.models.iter().enumerate() {
        let client = client.clone();
        let tx = tx_merge.clone();
        let token = child.clone();
        let delay = plan.stagger * (i as u32);
        let per_model = plan.per_model_deadline;
        let req = ModelRequest {
            model: model.clone(),
            messages: messages.clone(),
            temperature: plan.temperature,
            max_tokens: plan.max_tokens,
            top_p: plan.top_p,
            deadline: Instant::now() + per_model, // reset at actual start below
            cancellation_token: Some(token.clone()),
        };
        workers.spawn(async move {
            if !delay.is_zero() {
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            let mut req = req;
            // The per-model clock starts at first work, not at spawn.
            req.deadline = Instant::now() + per_model;
            client.stream_chat(&req, &tx).await;
        });
    }
    drop(tx_merge);

    let mut merge = Merge::default();
    let stage_sleep = tokio::time::sleep_until(stage_start + plan.stage_deadline);
    tokio::pin!(stage_sleep);

    let mut timed_out = false;
    let mut consumer_gone = false;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                consumer_gone = true;
                break;
            }
            _ = &mut stage_sleep => {
                timed_out = true;
                break;
            }
            ev = rx_merge.recv() => match ev {
                Some(ev) => {
                    if merge.forward(&tx_out, ev).await.is_err() {
                        consumer_gone = true;
                        break;
                    }
                }
                None => break, // every worker finished and dropped its sender
            }
        }
    }

    if consumer_gone {
        child.cancel();
        // Drain what was already queued, then stop. No stage terminal.
        while let Ok(ev) = rx_merge.try_recv() {
            if merge.forward(&tx_out, ev).await.is_err() {
                break;
            }
        }
        // Closing the merge queue unblocks any worker suspended on a full
        // queue; its send fails and the client winds down.
        drop(rx_merge);
        while workers.join_next().await.is_some() {}
        return;
    }

    if timed_out {
        child.cancel();
        // Queued events still reach the caller before the terminal, so the
        // trailing run is coherent.
        let mut caller_gone = false;
        while let Ok(ev) = rx_merge.try_recv() {
            if merge.forward(&tx_out, ev).await.is_err() {
                caller_gone = true;
                break;
            }
        }
        drop(rx_merge);
        while workers.join_next().await.is_some() {}
        if caller_gone {
            return;
        }
        let elapsed = stage_start.elapsed();
        tracing::error!(
            elapsed_secs = elapsed.as_secs_f64(),
            completed = merge.completed,
            successful = merge.successful,
            total,
            "stage timeout"
        );
        let _ = tx_out
            .send(MuxEvent::StageTimeout {
                elapsed,
                timeout: plan.stage_deadline,
                completed: merge.completed,
                successful: merge.successful,
                total,
            })
            .await;
        return;
    }

    while workers.join_next().await.is_some() {}

    // A run that finished after the deadline still reports as a timeout.
    let elapsed = stage_start.elapsed();
    if elapsed > plan.stage_deadline {
        let _ = tx_out
            .send(MuxEvent::StageTimeout {
                elapsed,
                timeout: plan.stage_deadline,
                completed: merge.completed,
                successful: merge.successful,
                total,
            })
            .await;
        return;
    }

    if merge.successful < plan.min_required {
        tracing::warn!(
            received = merge.successful,
            required = plan.min_required,
            total,
            "insufficient viable responses"
        );
        let _ = tx_out
            .send(MuxEvent::StageInsufficient {
                received: merge.successful,
                required: plan.min_required,
                total,
                results: merge.results,
            })
            .await;
        return;
    }

    let _ = tx_out
        .send(MuxEvent::StageAllComplete {
            results: merge.results,
        })
        .await;
}
