//! Per-model circuit breakers.
//!
//! A model that keeps failing gets a cooldown instead of hammering the
//! upstream: `closed` → `open(until)` after enough failures inside a rolling
//! window, `open` → `half_open` once the cooldown passes, and `half_open`
//! resolves to `closed` or back to `open` on the next outcome.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Failures within `window` that trip the breaker.
    pub failure_threshold: usize,
    pub window: Duration,
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            window: Duration::from_secs(60),
            cooldown: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Closed,
    Open { until: Instant },
    HalfOpen,
}

#[derive(Debug)]
struct ModelBreaker {
    state: State,
    failures: VecDeque<Instant>,
}

#[allow(clippy::new_without_default)]
impl ModelBreaker {
    fn new() -> Self {
        Self {
            state: State::Closed,
            failures: VecDeque::new(),
        }
    }
}

/// Outcome of a `can_execute` query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Execution {
    Allowed,
    Rejected { retry_in: Duration },
}

/// Process-wide registry of per-model breakers.
///
/// The outer map lock is held only to fetch the per-model handle; state
/// transitions serialize on the per-model mutex, so one slow model never
/// blocks breaker decisions for another.
pub struct BreakerRegistry {
    config: BreakerConfig,
    inner: RwLock<HashMap<String, Arc<Mutex<ModelBreaker>>>>,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            inner: RwLock::new(HashMap::new()),
        }
    }

    fn breaker_for(&self, model: &str) -> Arc<Mutex<ModelBreaker>> {
        if let Some(b) = self.inner.read().expect("breaker map poisoned").get(model) {
            return b.clone();
        }
        let mut map = self.inner.write().expect("breaker map poisoned");
        map.entry(model.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(ModelBreaker::new())))
            .clone()
    }

    pub async fn can_execute(&self, model: &str) -> Execution {
        let breaker = self.breaker_for(model);
        let mut b = breaker.lock().await;
        match b.state {
            State::Closed | State::HalfOpen => Execution::Allowed,
            State::Open { until } => {
                let now = Instant::now();
                if now >= until {
                    b.state = State::HalfOpen;
                    Execution::Allowed
                } else {
                    Execution::Rejected {
                        retry_in: until - now,
                    }
                }
            }
        }
    }

    pub async fn record_success(&self, model: &str) {
        let breaker = self.breaker_for(model);
        let mut b = breaker.lock().await;
        b.state = State::Closed;
        b.failures.clear();
    }

    pub async fn record_failure(&self, model: &str) {
        let breaker = self.breaker_for(model);
        let mut b = breaker.lock().await;
        let now = Instant::now();

        if b.state == State::HalfOpen {
            b.state = State::Open {
                until: now + self.config.cooldown,
            };
            b.failures.clear();
            tracing::warn!(model = %model, "breaker re-opened from half-open");
            return;
        }

        b.failures.push_back(now);
        let window = self.config.window;
        while let Some(front) = b.failures.front() {
            if now.duration_since(*front) > window {
                b.failures.pop_front();
            } else {
                break;
            }
        }

        if b.state == State::Closed && b.failures.len() >= self.config.failure_threshold {
            b.state = State::Open {
                until: now + self.config.cooldown,
            };
            b.failures.clear();
            tracing::warn!(
                model = %model,
                threshold = self.config.failure_threshold,
                "breaker opened"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> BreakerConfig {
        BreakerConfig {
            failure_threshold: 3,
            window: Duration::from_secs(60),
            cooldown: Duration::from_secs(30),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn opens_after_threshold_failures() {
        let reg = BreakerRegistry::new(config());
        for _ in 0..2 {
            reg.record_failure("m").await;
        }
        assert_eq!(reg.can_execute("m").await, Execution::Allowed);
        reg.record_failure("m").await;
        assert!(matches!(
            reg.can_execute("m").await,
            Execution::Rejected { .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_after_cooldown_then_closes_on_success() {
        let reg = BreakerRegistry::new(config());
        for _ in 0..3 {
            reg.record_failure("m").await;
        }
        assert!(matches!(
            reg.can_execute("m").await,
            Execution::Rejected { .. }
        ));

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(reg.can_execute("m").await, Execution::Allowed);

        reg.record_success("m").await;
        assert_eq!(reg.can_execute("m").await, Execution::Allowed);
        // A single new failure must not re-open a closed breaker.
        reg.record_failure("m").await;
        assert_eq!(reg.can_execute("m").await, Execution::Allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_failure_reopens() {
        let reg = BreakerRegistry::new(config());
        for _ in 0..3 {
            reg.record_failure("m").await;
        }
        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(reg.can_execute("m").await, Execution::Allowed);

        reg.record_failure("m").await;
        assert!(matches!(
            reg.can_execute("m").await,
            Execution::Rejected { .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn old_failures_age_out_of_window() {
        let reg = BreakerRegistry::new(config());
        reg.record_failure("m").await;
        reg.record_failure("m").await;
        tokio::time::advance(Duration::from_secs(61)).await;
        reg.record_failure("m").await;
        // Only one failure inside the window — still closed.
        assert_eq!(reg.can_execute("m").await, Execution::Allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn breakers_are_per_model() {
        let reg = BreakerRegistry::new(config());
        for _ in 0..3 {
            reg.record_failure("bad").await;
        }
        assert!(matches!(
            reg.can_execute("bad").await,
            Execution::Rejected { .. }
        ));
        assert_eq!(reg.can_execute("good").await, Execution::Allowed);
    }
}
