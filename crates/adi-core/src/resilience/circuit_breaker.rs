//! Per-provider circuit breaker.
//!
//! State lives behind [`BreakerStore`]; the default [`MemoryBreakerStore`]
//! keeps it for the lifetime of the process. A provider opens after
//! `threshold` consecutive failures and stays open for `cooldown` measured
//! from the latest failure. The first call after the cooldown is a probe:
//! success closes the breaker, failure re-opens it with a fresh cooldown.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::clock::{Clock, SystemClock};
use crate::metrics::METRICS;
use crate::obs;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerConfig {
    pub threshold: u32,
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            threshold: 2,
            cooldown: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerState {
    pub failure_count: u32,
    /// Epoch milliseconds of the most recent failure.
    pub last_failure_at: Option<u64>,
    pub is_open: bool,
}

/// Storage for breaker state keyed by provider id.
///
/// `update` must apply the closure atomically with respect to other calls
/// for the same provider.
pub trait BreakerStore: Send + Sync {
    fn update(&self, provider: &str, f: &mut dyn FnMut(&mut BreakerState)) -> BreakerState;
    fn snapshot(&self) -> Vec<(String, BreakerState)>;
    fn clear(&self, provider: Option<&str>);
}

#[derive(Debug, Default)]
pub struct MemoryBreakerStore {
    states: Mutex<HashMap<String, BreakerState>>,
}

impl MemoryBreakerStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BreakerStore for MemoryBreakerStore {
    fn update(&self, provider: &str, f: &mut dyn FnMut(&mut BreakerState)) -> BreakerState {
        // A poisoned map only means another caller panicked mid-update; the
        // state itself is still plain data.
        let mut states = match self.states.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        let state = states.entry(provider.to_string()).or_default();
        f(state);
        state.clone()
    }

    fn snapshot(&self) -> Vec<(String, BreakerState)> {
        let states = match self.states.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut out: Vec<_> = states.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    fn clear(&self, provider: Option<&str>) {
        let mut states = match self.states.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        match provider {
            Some(p) => {
                states.remove(p);
            }
            None => states.clear(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerPhase {
    Closed,
    Open,
    /// Cooldown elapsed; the next call is a probe.
    HalfOpen,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerStatus {
    pub provider: String,
    pub phase: BreakerPhase,
    pub failure_count: u32,
    pub retry_in_ms: u64,
}

#[derive(Clone)]
pub struct CircuitBreaker {
    store: Arc<dyn BreakerStore>,
    clock: Arc<dyn Clock>,
    config: BreakerConfig,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self::with_parts(config, Arc::new(MemoryBreakerStore::new()), Arc::new(SystemClock))
    }

    pub fn with_parts(
        config: BreakerConfig,
        store: Arc<dyn BreakerStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    pub fn config(&self) -> BreakerConfig {
        self.config
    }

    fn cooldown_ms(&self) -> u64 {
        u64::try_from(self.config.cooldown.as_millis()).unwrap_or(u64::MAX)
    }

    /// Whether a call to `provider` may proceed now.
    pub fn allow(&self, provider: &str) -> bool {
        let now = self.clock.now_ms();
        let cooldown = self.cooldown_ms();
        let mut allowed = true;
        self.store.update(provider, &mut |state| {
            if !state.is_open {
                allowed = true;
                return;
            }
            let since = now.saturating_sub(state.last_failure_at.unwrap_or(0));
            if since < cooldown {
                allowed = false;
            } else {
                // Half-open: let one probe through, failure_count stays put
                state.is_open = false;
                allowed = true;
            }
        });
        allowed
    }

    pub fn record_failure(&self, provider: &str) {
        let now = self.clock.now_ms();
        let threshold = self.config.threshold;
        let mut tripped = false;
        let state = self.store.update(provider, &mut |state| {
            state.failure_count = state.failure_count.saturating_add(1);
            state.last_failure_at = Some(now);
            if state.failure_count >= threshold {
                tripped = !state.is_open;
                state.is_open = true;
            }
        });
        if tripped {
            METRICS.inc_breaker_trips();
            obs::emit_breaker_opened(provider, state.failure_count);
        }
    }

    pub fn record_success(&self, provider: &str) {
        self.store.update(provider, &mut |state| {
            state.failure_count = 0;
            state.is_open = false;
        });
    }

    /// Read-only view; never flips an open breaker to half-open.
    pub fn status(&self, provider: &str) -> BreakerStatus {
        let state = self
            .store
            .snapshot()
            .into_iter()
            .find(|(p, _)| p == provider)
            .map(|(_, s)| s)
            .unwrap_or_default();
        self.describe(provider, &state)
    }

    pub fn all_statuses(&self) -> Vec<BreakerStatus> {
        self.store
            .snapshot()
            .iter()
            .map(|(p, s)| self.describe(p, s))
            .collect()
    }

    pub fn reset(&self, provider: &str) {
        self.store.clear(Some(provider));
    }

    pub fn reset_all(&self) {
        self.store.clear(None);
    }

    fn describe(&self, provider: &str, state: &BreakerState) -> BreakerStatus {
        let now = self.clock.now_ms();
        let elapsed = now.saturating_sub(state.last_failure_at.unwrap_or(0));
        let (phase, retry_in_ms) = if state.is_open && elapsed < self.cooldown_ms() {
            (BreakerPhase::Open, self.cooldown_ms() - elapsed)
        } else if state.is_open || state.failure_count >= self.config.threshold {
            (BreakerPhase::HalfOpen, 0)
        } else {
            (BreakerPhase::Closed, 0)
        };
        BreakerStatus {
            provider: provider.to_string(),
            phase,
            failure_count: state.failure_count,
            retry_in_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::clock::ManualClock;

    fn breaker(clock: Arc<ManualClock>) -> CircuitBreaker {
        CircuitBreaker::with_parts(
            BreakerConfig::default(),
            Arc::new(MemoryBreakerStore::new()),
            clock,
        )
    }

    #[test]
    fn test_two_failures_open_the_breaker_until_cooldown() {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let cb = breaker(clock.clone());

        assert!(cb.allow("openai"));
        cb.record_failure("openai");
        assert!(cb.allow("openai"), "one failure is below threshold");
        cb.record_failure("openai");
        assert!(!cb.allow("openai"));
        assert_eq!(cb.status("openai").phase, BreakerPhase::Open);

        clock.advance_ms(59_999);
        assert!(!cb.allow("openai"));

        clock.advance_ms(1);
        assert!(cb.allow("openai"), "probe allowed after cooldown");
    }

    #[test]
    fn test_probe_failure_reopens_with_fresh_cooldown() {
        let clock = Arc::new(ManualClock::new(0));
        let cb = breaker(clock.clone());
        cb.record_failure("anthropic");
        cb.record_failure("anthropic");

        clock.advance_ms(60_000);
        assert!(cb.allow("anthropic"));
        cb.record_failure("anthropic");
        assert!(!cb.allow("anthropic"));

        clock.advance_ms(30_000);
        assert!(!cb.allow("anthropic"), "cooldown restarted at probe failure");
        clock.advance_ms(30_000);
        assert!(cb.allow("anthropic"));
    }

    #[test]
    fn test_probe_success_closes() {
        let clock = Arc::new(ManualClock::new(0));
        let cb = breaker(clock.clone());
        cb.record_failure("google");
        cb.record_failure("google");
        clock.advance_ms(60_000);
        assert!(cb.allow("google"));
        cb.record_success("google");

        let status = cb.status("google");
        assert_eq!(status.phase, BreakerPhase::Closed);
        assert_eq!(status.failure_count, 0);

        cb.record_failure("google");
        assert!(cb.allow("google"), "count restarted from zero");
    }

    #[test]
    fn test_providers_are_independent_and_resettable() {
        let clock = Arc::new(ManualClock::new(0));
        let cb = breaker(clock);
        cb.record_failure("mistral");
        cb.record_failure("mistral");
        assert!(!cb.allow("mistral"));
        assert!(cb.allow("openai"));

        cb.reset("mistral");
        assert!(cb.allow("mistral"));
        assert_eq!(cb.status("mistral").failure_count, 0);
    }

    #[test]
    fn test_status_reports_time_until_retry() {
        let clock = Arc::new(ManualClock::new(10_000));
        let cb = breaker(clock.clone());
        cb.record_failure("openai");
        cb.record_failure("openai");
        clock.advance_ms(15_000);
        let status = cb.status("openai");
        assert_eq!(status.retry_in_ms, 45_000);

        clock.advance_ms(45_000);
        assert_eq!(cb.status("openai").phase, BreakerPhase::HalfOpen);
        assert_eq!(cb.all_statuses().len(), 1);
    }
}
