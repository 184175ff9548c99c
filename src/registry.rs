//! Role-based model registry.
//!
//! Resolves the ordered model list for each council role from a backing
//! store, with hardcoded fallbacks when the store is unreachable. Reads are
//! served from a copy-on-write cache so a store outage mid-request degrades
//! to the last known good list.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelRole {
    CouncilMember,
    Stage2Reviewer,
    Chairman,
    TitleGenerator,
}

impl ModelRole {
    pub const ALL: [ModelRole; 4] = [
        ModelRole::CouncilMember,
        ModelRole::Stage2Reviewer,
        ModelRole::Chairman,
        ModelRole::TitleGenerator,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ModelRole::CouncilMember => "council_member",
            ModelRole::Stage2Reviewer => "stage2_reviewer",
            ModelRole::Chairman => "chairman",
            ModelRole::TitleGenerator => "title_generator",
        }
    }
}

/// Backing store keyed by role. Implementation-defined (database, file, …);
/// must be read-optimized.
#[async_trait]
pub trait RoleStore: Send + Sync {
    /// Ordered model list for a role. `None` means the store is unreachable
    /// or has no entry; the registry falls back.
    async fn models_for_role(&self, role: ModelRole) -> Option<Vec<String>>;
}

pub struct ModelRegistry {
    store: Option<Arc<dyn RoleStore>>,
    cache: RwLock<HashMap<ModelRole, Arc<Vec<String>>>>,
}

impl ModelRegistry {
    pub fn new(store: Option<Arc<dyn RoleStore>>) -> Self {
        Self {
            store,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Registry with hardcoded lists only.
    pub fn with_fallbacks() -> Self {
        Self::new(None)
    }

    fn cached(&self, role: ModelRole) -> Option<Vec<String>> {
        self.cache
            .read()
            .expect("registry cache poisoned")
            .get(&role)
            .map(|models| (**models).clone())
    }

    fn update_cache(&self, role: ModelRole, models: &[String]) {
        self.cache
            .write()
            .expect("registry cache poisoned")
            .insert(role, Arc::new(models.to_vec()));
    }

    /// Ordered model list for a role: store, then cache, then fallback.
    /// Never empty for the roles the council uses.
    pub async fn get_models(&self, role: ModelRole) -> Vec<String> {
        if let Some(store) = &self.store {
            if let Some(models) = store.models_for_role(role).await
                && !models.is_empty()
            {
                self.update_cache(role, &models);
                return models;
            }
            if let Some(cached) = self.cached(role) {
                tracing::warn!(role = role.as_str(), "role store unreachable — using cached models");
                return cached;
            }
            tracing::warn!(role = role.as_str(), "role store unreachable — using fallback models");
        }
        fallback_models(role)
    }

    pub async fn get_primary_model(&self, role: ModelRole) -> Option<String> {
        self.get_models(role).await.into_iter().next()
    }

    /// Re-read every role from the store, refreshing the cache.
    pub async fn refresh(&self) {
        let Some(store) = &self.store else { return };
        for role in ModelRole::ALL {
            if let Some(models) = store.models_for_role(role).await
                && !models.is_empty()
            {
                self.update_cache(role, &models);
            }
        }
    }
}

fn fallback_models(role: ModelRole) -> Vec<String> {
    let models: &[&str] = match role {
        ModelRole::CouncilMember | ModelRole::Stage2Reviewer => &[
            "anthropic/claude-opus-4.5",
            "google/gemini-3-pro-preview",
            "openai/gpt-5.1",
            "x-ai/grok-4",
        ],
        ModelRole::Chairman => &[
            "anthropic/claude-opus-4.5",
            "google/gemini-3-pro-preview",
            "openai/gpt-5.1",
        ],
        ModelRole::TitleGenerator => &["google/gemini-2.5-flash"],
    };
    models.iter().map(|m| (*m).to_string()).collect()
}
