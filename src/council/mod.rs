//! Three-stage council orchestration.
//!
//! Stage 1 fans the user's question out to the council members, Stage 2 has
//! reviewers rank the anonymized answers, Stage 3 lets a chairman chain
//! synthesize the final response. Each stage is a lazy event stream the
//! caller consumes; dropping the receiver or cancelling the token stops the
//! underlying model tasks.

pub mod stage1;
pub mod stage2;
pub mod stage3;

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::client::breaker::{BreakerConfig, BreakerRegistry};
use crate::client::http::ModelClient;
use crate::compose::{ComposedContext, ContextComposer, ContextRequest, ContextSource};
use crate::config::CouncilConfig;
use crate::error::CouncilError;
use crate::events::{AggregateRanking, Stage1Result, Stage2Result, Stage3Result};
use crate::presets::{ConfigResolver, ConversationModifier, Preset, PresetStore, StageId};
use crate::registry::{ModelRegistry, RoleStore};
use crate::telemetry::{SharedSink, TracingSink};

use self::stage1::Stage1Request;
use self::stage2::Stage2Request;
use self::stage3::Stage3Request;

/// Per-request options shared across the stages of one council run.
#[derive(Debug, Clone, Default)]
pub struct CouncilOptions {
    pub context: ContextRequest,
    pub conversation_modifier: Option<ConversationModifier>,
    /// Overrides the department's preset for this message.
    pub preset_override: Option<Preset>,
}

/// The council core. Holds the injected client, breakers, registry, resolver,
/// composer, and telemetry sink; all per-stage state is created per
/// invocation and discarded on terminal emit.
pub struct Council {
    pub(crate) config: CouncilConfig,
    pub(crate) client: Arc<ModelClient>,
    pub(crate) registry: Arc<ModelRegistry>,
    pub(crate) resolver: ConfigResolver,
    pub(crate) composer: Option<ContextComposer>,
    pub(crate) telemetry: SharedSink,
}

impl Council {
    /// Council with fallback model lists, default presets, no context source,
    /// and tracing telemetry. Backing stores attach via the `with_*` methods.
    pub fn new(config: CouncilConfig) -> Self {
        let breakers = Arc::new(BreakerRegistry::new(BreakerConfig {
            failure_threshold: config.breaker_failures,
            window: config.breaker_window,
            cooldown: config.breaker_cooldown,
        }));
        let client = Arc::new(ModelClient::new(&config, breakers));
        Self {
            client,
            registry: Arc::new(ModelRegistry::with_fallbacks()),
            resolver: ConfigResolver::new(None),
            composer: None,
            telemetry: Arc::new(TracingSink),
            config,
        }
    }

    pub fn with_role_store(mut self, store: Arc<dyn RoleStore>) -> Self {
        self.registry = Arc::new(ModelRegistry::new(Some(store)));
        self
    }

    pub fn with_preset_store(mut self, store: Arc<dyn PresetStore>) -> Self {
        self.resolver = ConfigResolver::new(Some(store));
        self
    }

    pub fn with_context_source(mut self, source: Arc<dyn ContextSource>) -> Self {
        self.composer = Some(ContextComposer::new(source));
        self
    }

    pub fn with_telemetry(mut self, sink: SharedSink) -> Self {
        self.telemetry = sink;
        self
    }

    pub fn config(&self) -> &CouncilConfig {
        &self.config
    }

    /// Per-model circuit breakers, exposed for operational introspection.
    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        self.client.breakers()
    }

    pub(crate) fn first_department(options: &CouncilOptions) -> Option<&str> {
        options.context.departments.first().map(String::as_str)
    }

    /// Compose the system prompt for this request, if a context source is
    /// attached and the request selects a company.
    pub(crate) async fn system_prompt(
        &self,
        options: &CouncilOptions,
        max_tokens: u64,
    ) -> Option<ComposedContext> {
        let composer = self.composer.as_ref()?;
        let mut req = options.context.clone();
        req.max_tokens = Some(max_tokens);
        composer.compose(&req).await
    }

    pub(crate) async fn resolve_stage_config(
        &self,
        options: &CouncilOptions,
        stage: StageId,
    ) -> crate::presets::LlmConfig {
        // The conversation modifier applies to Stage 1 only; reviews and
        // synthesis keep their stage presets.
        let modifier = match stage {
            StageId::Stage1 => options.conversation_modifier,
            _ => None,
        };
        self.resolver
            .resolve(
                Self::first_department(options),
                stage,
                modifier,
                options.preset_override,
            )
            .await
    }
}

/// Outcome of a complete three-stage run.
#[derive(Debug, Clone)]
pub struct FullCouncilOutcome {
    pub stage1: Vec<Stage1Result>,
    pub stage2: Vec<Stage2Result>,
    pub stage3: Stage3Result,
    pub label_to_model: BTreeMap<String, String>,
    pub aggregate_rankings: Vec<AggregateRanking>,
    pub manipulation_warning: bool,
}

impl Council {
    /// Run all three stages, collecting results. A failed Stage 1 or Stage 2
    /// (timeout or insufficient responses) stops the run — downstream stages
    /// never see a failed stage's output.
    pub async fn run_full_council(
        &self,
        req: Stage1Request,
        cancel: CancellationToken,
    ) -> Result<FullCouncilOutcome, CouncilError> {
        let query = req.query.clone();
        let history = req.history.clone();
        let options = req.options.clone();

        let stage1 = self.stage1_collect(req, cancel.child_token()).await?;

        let stage2 = self
            .stage2_collect(
                Stage2Request {
                    query: query.clone(),
                    stage1_results: stage1.clone(),
                    options: options.clone(),
                },
                cancel.child_token(),
            )
            .await?;

        let stage3 = self
            .stage3_collect(
                Stage3Request {
                    query,
                    stage1_results: stage1.clone(),
                    stage2_results: stage2.results.clone(),
                    history,
                    options,
                },
                cancel,
            )
            .await
            .ok_or(CouncilError::Cancelled(0))?;

        Ok(FullCouncilOutcome {
            stage1,
            stage2: stage2.results,
            stage3,
            label_to_model: stage2.label_to_model,
            aggregate_rankings: stage2.aggregate_rankings,
            manipulation_warning: stage2.manipulation_warning,
        })
    }
}

/// Spreadsheet-style label for a zero-based index: A..Z, then AA, AB, ….
/// Never repeats, so every result keeps a distinct anonymized label no
/// matter how large the council is.
fn column_label(index: usize) -> String {
    let mut i = index;
    let mut label = String::new();
    loop {
        label.insert(0, (b'A' + (i % 26) as u8) as char);
        i /= 26;
        if i == 0 {
            break;
        }
        i -= 1;
    }
    label
}

/// Anonymized labels for Stage 1 results in arrival order, plus the private
/// label→model table. The table never enters model context.
pub(crate) fn make_labels(results: &[Stage1Result]) -> (Vec<String>, BTreeMap<String, String>) {
    let labels: Vec<String> = (0..results.len()).map(column_label).collect();
    let label_to_model = labels
        .iter()
        .zip(results)
        .map(|(label, result)| (format!("Response {label}"), result.model.clone()))
        .collect();
    (labels, label_to_model)
}
