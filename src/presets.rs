//! Per-stage LLM parameter resolution.
//!
//! Effective `{temperature, max_tokens, top_p}` comes from, in priority
//! order: an explicit preset override from the caller, the department's
//! preset in the backing store, then hardcoded defaults. A per-conversation
//! modifier applies a bounded adjustment last, and everything is clamped to
//! safe ranges on the way out.

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageId {
    Stage1,
    Stage2,
    Stage3,
}

impl StageId {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageId::Stage1 => "stage1",
            StageId::Stage2 => "stage2",
            StageId::Stage3 => "stage3",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Preset {
    Conservative,
    Balanced,
    Creative,
}

impl FromStr for Preset {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "conservative" => Ok(Preset::Conservative),
            "balanced" => Ok(Preset::Balanced),
            "creative" => Ok(Preset::Creative),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationModifier {
    Creative,
    Cautious,
    Concise,
    Detailed,
}

impl FromStr for ConversationModifier {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "creative" => Ok(Self::Creative),
            "cautious" => Ok(Self::Cautious),
            "concise" => Ok(Self::Concise),
            "detailed" => Ok(Self::Detailed),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LlmConfig {
    pub temperature: f64,
    pub max_tokens: u64,
    pub top_p: Option<f64>,
}

/// Used when neither an override nor a store entry matches.
const DEFAULT_STAGE_CONFIG: LlmConfig = LlmConfig {
    temperature: 0.5,
    max_tokens: 1536,
    top_p: None,
};

const MODIFIER_DELTA: f64 = 0.15;
const MODIFIER_MIN_TEMP: f64 = 0.1;
const MODIFIER_MAX_TEMP: f64 = 1.0;

fn preset_config(preset: Preset, stage: StageId) -> LlmConfig {
    let (temperature, max_tokens) = match (preset, stage) {
        (Preset::Conservative, StageId::Stage1) => (0.2, 8192),
        (Preset::Conservative, StageId::Stage2) => (0.15, 2048),
        (Preset::Conservative, StageId::Stage3) => (0.25, 8192),
        (Preset::Balanced, StageId::Stage1) => (0.5, 8192),
        (Preset::Balanced, StageId::Stage2) => (0.3, 2048),
        (Preset::Balanced, StageId::Stage3) => (0.4, 8192),
        (Preset::Creative, StageId::Stage1) => (0.8, 8192),
        (Preset::Creative, StageId::Stage2) => (0.5, 2048),
        (Preset::Creative, StageId::Stage3) => (0.7, 8192),
    };
    LlmConfig {
        temperature,
        max_tokens,
        top_p: None,
    }
}

fn apply_modifier(mut config: LlmConfig, modifier: ConversationModifier) -> LlmConfig {
    match modifier {
        ConversationModifier::Creative => {
            config.temperature = (config.temperature + MODIFIER_DELTA).min(MODIFIER_MAX_TEMP);
        }
        ConversationModifier::Cautious => {
            config.temperature = (config.temperature - MODIFIER_DELTA).max(MODIFIER_MIN_TEMP);
        }
        ConversationModifier::Concise => {
            config.max_tokens = (config.max_tokens / 2).max(512);
        }
        ConversationModifier::Detailed => {
            config.max_tokens = ((config.max_tokens as f64 * 1.5) as u64).min(4096);
        }
    }
    config
}

/// Clamp to the ranges the provider accepts.
pub fn clamp_config(mut config: LlmConfig) -> LlmConfig {
    config.temperature = config.temperature.clamp(0.0, 1.2);
    config.max_tokens = config.max_tokens.clamp(256, 16384);
    config.top_p = config.top_p.map(|p| p.clamp(0.0, 1.0));
    config
}

/// Backing store for department presets (database, file, etc.).
#[async_trait]
pub trait PresetStore: Send + Sync {
    /// Effective config for `(department, stage)`, if the store knows one.
    async fn stage_config(&self, department: &str, stage: StageId) -> Option<LlmConfig>;
}

pub struct ConfigResolver {
    store: Option<Arc<dyn PresetStore>>,
}

impl ConfigResolver {
    pub fn new(store: Option<Arc<dyn PresetStore>>) -> Self {
        Self { store }
    }

    pub async fn resolve(
        &self,
        department: Option<&str>,
        stage: StageId,
        modifier: Option<ConversationModifier>,
        preset_override: Option<Preset>,
    ) -> LlmConfig {
        let mut config = DEFAULT_STAGE_CONFIG;

        if let Some(preset) = preset_override {
            config = preset_config(preset, stage);
        } else if let Some(dept) = department
            && let Some(store) = &self.store
        {
            match store.stage_config(dept, stage).await {
                Some(stored) => config = stored,
                None => {
                    tracing::debug!(department = dept, stage = stage.as_str(), "no stored config — using defaults");
                }
            }
        }

        if let Some(m) = modifier {
            config = apply_modifier(config, m);
        }

        clamp_config(config)
    }
}
