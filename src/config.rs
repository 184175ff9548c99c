use std::env;
use std::time::Duration;

/// Process-level configuration for the council core.
///
/// Every knob has a default; `from_env` overrides from the environment so
/// deployments can tune without a rebuild. Timeouts are whole seconds except
/// the stagger delays, which accept fractional values.
#[derive(Debug, Clone)]
pub struct CouncilConfig {
    /// Chat-completions endpoint (single URL; the model travels in the body).
    pub api_url: String,
    pub api_key: String,

    pub stage1_timeout: Duration,
    pub stage2_timeout: Duration,
    pub stage3_timeout: Duration,
    pub per_model_timeout: Duration,

    /// Minimum successful Stage 1 responses for a viable council.
    pub min_stage1_responses: usize,
    /// Minimum successful Stage 2 rankings for a viable review.
    pub min_stage2_rankings: usize,

    pub max_query_chars: usize,
    pub max_retries: u32,

    pub breaker_failures: usize,
    pub breaker_window: Duration,
    pub breaker_cooldown: Duration,

    /// Capacity of the merge queue between model tasks and the consumer.
    pub merge_queue_cap: usize,

    pub stage1_stagger: Duration,
    pub stage2_stagger: Duration,

    /// Minimum content length for a chairman response to count as viable.
    pub min_chairman_chars: usize,
    /// Per-section cap applied by `sanitize_user_content`.
    pub max_sanitized_chars: usize,
}

impl Default for CouncilConfig {
    fn default() -> Self {
        Self {
            api_url: "https://openrouter.ai/api/v1/chat/completions".to_string(),
            api_key: String::new(),
            stage1_timeout: Duration::from_secs(600),
            stage2_timeout: Duration::from_secs(600),
            stage3_timeout: Duration::from_secs(180),
            per_model_timeout: Duration::from_secs(300),
            min_stage1_responses: 2,
            min_stage2_rankings: 2,
            max_query_chars: 50_000,
            max_retries: 3,
            breaker_failures: 5,
            breaker_window: Duration::from_secs(60),
            breaker_cooldown: Duration::from_secs(30),
            merge_queue_cap: 1000,
            stage1_stagger: Duration::ZERO,
            stage2_stagger: Duration::from_millis(500),
            min_chairman_chars: 50,
            max_sanitized_chars: 8000,
        }
    }
}

impl CouncilConfig {
    pub fn from_env() -> Self {
        // Pick up a .env file if present (ignored when missing).
        dotenvy::dotenv().ok();

        let mut cfg = Self::default();

        if let Ok(url) = env::var("COUNCIL_API_URL") {
            cfg.api_url = url;
        }
        if let Ok(key) = env::var("OPENROUTER_API_KEY") {
            cfg.api_key = key;
        } else {
            tracing::warn!("OPENROUTER_API_KEY not set — model calls will be unauthenticated");
        }

        cfg.stage1_timeout = env_secs("STAGE1_TIMEOUT", cfg.stage1_timeout);
        cfg.stage2_timeout = env_secs("STAGE2_TIMEOUT", cfg.stage2_timeout);
        cfg.stage3_timeout = env_secs("STAGE3_TIMEOUT", cfg.stage3_timeout);
        cfg.per_model_timeout = env_secs("PER_MODEL_TIMEOUT", cfg.per_model_timeout);

        cfg.min_stage1_responses = env_usize("MIN_STAGE1_RESPONSES", cfg.min_stage1_responses);
        cfg.min_stage2_rankings = env_usize("MIN_STAGE2_RANKINGS", cfg.min_stage2_rankings);
        cfg.max_query_chars = env_usize("MAX_QUERY_CHARS", cfg.max_query_chars);
        cfg.max_retries = env_usize("MAX_RETRIES", cfg.max_retries as usize) as u32;

        cfg.breaker_failures = env_usize("BREAKER_FAILURES", cfg.breaker_failures);
        cfg.breaker_window = env_secs("BREAKER_WINDOW", cfg.breaker_window);
        cfg.breaker_cooldown = env_secs("BREAKER_COOLDOWN", cfg.breaker_cooldown);

        cfg.merge_queue_cap = env_usize("MERGE_QUEUE_CAP", cfg.merge_queue_cap).max(1);

        cfg.stage1_stagger = env_secs_f64("STAGE1_STAGGER", cfg.stage1_stagger);
        cfg.stage2_stagger = env_secs_f64("STAGE2_STAGGER", cfg.stage2_stagger);

        cfg.min_chairman_chars = env_usize("MIN_CHAIRMAN_CHARS", cfg.min_chairman_chars);
        cfg.max_sanitized_chars = env_usize("MAX_SANITIZED_CHARS", cfg.max_sanitized_chars);

        cfg
    }
}

fn env_secs(key: &str, default: Duration) -> Duration {
    match env::var(key).ok().and_then(|v| v.parse::<u64>().ok()) {
        Some(secs) => Duration::from_secs(secs),
        None => default,
    }
}

fn env_secs_f64(key: &str, default: Duration) -> Duration {
    match env::var(key).ok().and_then(|v| v.parse::<f64>().ok()) {
        Some(secs) if secs.is_finite() && secs >= 0.0 => Duration::from_secs_f64(secs),
        _ => default,
    }
}

fn env_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(default)
}
