//! Ordered fallback tiers with first-success-wins semantics.
//!
//! A chain is a list of fallible [`Tier`]s followed by one [`FinalTier`].
//! The final tier is a plain synchronous closure with no error channel, so
//! [`FallbackChain::run`] always yields a completed [`AgentOutput`].
//!
//! Provider tiers consult the [`CircuitBreaker`] first. An open breaker is
//! recorded as a skip and does not count as a failure.
//!
//! A chain may carry a deadline. Tier timeouts are capped by what is left of
//! it, and provider tiers are skipped once it is spent, so the final tier
//! still answers inside the caller's own timeout. Results are validated as
//! they come back: an out-of-range answer is a tier failure.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map};
use tokio::time::Instant;
use tracing::{debug, warn};

use super::circuit_breaker::CircuitBreaker;
use crate::domain::scoring::{clamp_confidence, create_result};
use crate::domain::{validate_results, AgentError, AgentOutput, AgentResult};
use crate::metrics::METRICS;
use crate::obs;

/// What a fallible tier returns. `Ok(None)` and an empty vector both count
/// as a miss.
pub type TierOutcome = Result<Option<Vec<AgentResult>>, AgentError>;

type TierFuture<'a> = Pin<Box<dyn Future<Output = TierOutcome> + Send + 'a>>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "provider")]
pub enum TierKind {
    Cache,
    Provider(String),
    Local,
}

pub struct Tier<'a> {
    name: String,
    kind: TierKind,
    confidence_factor: Option<f64>,
    timeout: Option<Duration>,
    primary: Option<bool>,
    run: Box<dyn FnOnce() -> TierFuture<'a> + Send + 'a>,
}

impl<'a> Tier<'a> {
    pub fn new<F, Fut>(name: impl Into<String>, kind: TierKind, f: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'a,
        Fut: Future<Output = TierOutcome> + Send + 'a,
    {
        Self {
            name: name.into(),
            kind,
            confidence_factor: None,
            timeout: None,
            primary: None,
            run: Box::new(move || Box::pin(f())),
        }
    }

    pub fn cache<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'a,
        Fut: Future<Output = TierOutcome> + Send + 'a,
    {
        Self::new(name, TierKind::Cache, f)
    }

    pub fn provider<F, Fut>(provider: impl Into<String>, f: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'a,
        Fut: Future<Output = TierOutcome> + Send + 'a,
    {
        let provider = provider.into();
        Self::new(format!("provider:{provider}"), TierKind::Provider(provider), f)
    }

    pub fn local<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'a,
        Fut: Future<Output = TierOutcome> + Send + 'a,
    {
        Self::new(name, TierKind::Local, f)
    }

    /// Multiply result confidence by `factor` when this tier serves.
    pub fn with_confidence_factor(mut self, factor: f64) -> Self {
        self.confidence_factor = Some(factor);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Mark whether an answer from this tier counts as a full-quality
    /// result. By default only the first tier does.
    pub fn primary(mut self, primary: bool) -> Self {
        self.primary = Some(primary);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Last-resort tier: pure computation, no I/O, no error channel.
pub struct FinalTier<'a> {
    name: String,
    synthesize: Box<dyn FnOnce() -> Vec<AgentResult> + Send + 'a>,
}

impl<'a> FinalTier<'a> {
    pub fn new<F>(name: impl Into<String>, f: F) -> Self
    where
        F: FnOnce() -> Vec<AgentResult> + Send + 'a,
    {
        Self {
            name: name.into(),
            synthesize: Box::new(f),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome", content = "detail")]
pub enum AttemptOutcome {
    Served,
    Empty,
    Failed(String),
    SkippedCircuitOpen,
    SkippedDeadline,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TierAttempt {
    pub tier: String,
    pub outcome: AttemptOutcome,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FallbackOutcome {
    pub output: AgentOutput,
    pub tier_index: usize,
    pub tier_name: String,
    /// `None` when the final tier served.
    pub served_by: Option<TierKind>,
    pub degraded: bool,
    pub attempts: Vec<TierAttempt>,
}

impl FallbackOutcome {
    pub fn is_degraded(&self) -> bool {
        self.degraded
    }
}

/// Default confidence multiplier for the tier at `index`.
fn default_factor(index: usize) -> f64 {
    (1.0 - 0.15 * index as f64).max(0.1)
}

pub struct FallbackChain<'a> {
    agent: String,
    breaker: Option<Arc<CircuitBreaker>>,
    deadline: Option<Duration>,
    tiers: Vec<Tier<'a>>,
    final_tier: FinalTier<'a>,
}

impl<'a> FallbackChain<'a> {
    pub fn new(agent: impl Into<String>, final_tier: FinalTier<'a>) -> Self {
        Self {
            agent: agent.into(),
            breaker: None,
            deadline: None,
            tiers: Vec::new(),
            final_tier,
        }
    }

    pub fn with_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = Some(breaker);
        self
    }

    /// Budget for the whole chain, measured from the start of [`run`](Self::run).
    pub fn with_deadline(mut self, budget: Duration) -> Self {
        self.deadline = Some(budget);
        self
    }

    pub fn tier(mut self, tier: Tier<'a>) -> Self {
        self.tiers.push(tier);
        self
    }

    pub fn tiers(mut self, tiers: impl IntoIterator<Item = Tier<'a>>) -> Self {
        self.tiers.extend(tiers);
        self
    }

    /// Run tiers in order and return the first non-empty success.
    pub async fn run(self) -> FallbackOutcome {
        let FallbackChain {
            agent,
            breaker,
            deadline,
            tiers,
            final_tier,
        } = self;
        let started = Instant::now();
        let mut attempts = Vec::with_capacity(tiers.len() + 1);

        for (index, tier) in tiers.into_iter().enumerate() {
            let Tier {
                name,
                kind,
                confidence_factor,
                timeout,
                primary,
                run,
            } = tier;
            let primary = primary.unwrap_or(index == 0);

            let provider = match &kind {
                TierKind::Provider(p) => Some(p.clone()),
                _ => None,
            };

            let remaining = deadline.map(|d| d.saturating_sub(started.elapsed()));
            if provider.is_some() && remaining == Some(Duration::ZERO) {
                debug!(agent = %agent, tier = %name, "chain deadline spent, skipping tier");
                attempts.push(TierAttempt {
                    tier: name,
                    outcome: AttemptOutcome::SkippedDeadline,
                });
                continue;
            }

            if let (Some(p), Some(breaker)) = (&provider, &breaker) {
                if !breaker.allow(p) {
                    debug!(agent = %agent, tier = %name, "circuit open, skipping tier");
                    attempts.push(TierAttempt {
                        tier: name,
                        outcome: AttemptOutcome::SkippedCircuitOpen,
                    });
                    continue;
                }
            }

            // A capped timeout is the chain running out, not the tier failing
            let (limit, capped) = match (timeout, remaining) {
                (Some(own), Some(left)) if left < own => (Some(left), true),
                (None, Some(left)) => (Some(left), true),
                (own, _) => (own, false),
            };

            let fut = run();
            let outcome = match limit {
                Some(limit) => match tokio::time::timeout(limit, fut).await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(AgentError::Timeout {
                        agent: name.clone(),
                        timeout_ms: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
                    }),
                },
                None => fut.await,
            };
            let outcome = match outcome {
                Ok(Some(results)) => match validate_results(&results) {
                    Ok(()) => Ok(Some(results)),
                    Err(reason) => Err(AgentError::Validation {
                        agent: agent.clone(),
                        reason,
                    }),
                },
                other => other,
            };

            match outcome {
                Ok(Some(results)) if !results.is_empty() => {
                    if let (Some(p), Some(breaker)) = (&provider, &breaker) {
                        breaker.record_success(p);
                    }
                    attempts.push(TierAttempt {
                        tier: name.clone(),
                        outcome: AttemptOutcome::Served,
                    });
                    let factor = confidence_factor.unwrap_or_else(|| {
                        if primary {
                            1.0
                        } else {
                            default_factor(index)
                        }
                    });
                    let results = results
                        .into_iter()
                        .map(|mut r| {
                            r.confidence_level = clamp_confidence(r.confidence_level * factor);
                            r
                        })
                        .collect();
                    let served = Served {
                        index,
                        name,
                        kind: Some(kind),
                        degraded: !primary,
                    };
                    return finish(&agent, results, served, attempts, started);
                }
                Ok(_) => {
                    attempts.push(TierAttempt {
                        tier: name,
                        outcome: AttemptOutcome::Empty,
                    });
                }
                Err(err) => {
                    if let (Some(p), Some(breaker)) = (&provider, &breaker) {
                        let counts = match &err {
                            AgentError::Timeout { .. } => !capped,
                            AgentError::Validation { .. } => true,
                            other => other.is_provider_failure(),
                        };
                        if counts {
                            breaker.record_failure(p);
                        }
                    }
                    warn!(agent = %agent, tier = %name, error = %err, "fallback tier failed");
                    attempts.push(TierAttempt {
                        tier: name,
                        outcome: AttemptOutcome::Failed(err.to_string()),
                    });
                }
            }
        }

        let index = attempts.len();
        let FinalTier { name, synthesize } = final_tier;
        let mut results = synthesize();
        if results.is_empty() {
            results.push(emergency_result(&agent));
        }
        attempts.push(TierAttempt {
            tier: name.clone(),
            outcome: AttemptOutcome::Served,
        });
        let served = Served {
            index,
            name,
            kind: None,
            degraded: true,
        };
        finish(&agent, results, served, attempts, started)
    }
}

struct Served {
    index: usize,
    name: String,
    kind: Option<TierKind>,
    degraded: bool,
}

fn finish(
    agent: &str,
    results: Vec<AgentResult>,
    served: Served,
    attempts: Vec<TierAttempt>,
    started: Instant,
) -> FallbackOutcome {
    let Served {
        index,
        name,
        kind,
        degraded,
    } = served;
    if degraded {
        METRICS.inc_degraded();
    }
    obs::emit_tier_served(agent, &name, index, degraded);

    let elapsed = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
    let output = AgentOutput::completed(agent, results)
        .with_execution_time(elapsed)
        .with_metadata("tier", name.clone())
        .with_metadata("tierIndex", index)
        .with_metadata("degraded", degraded)
        .with_metadata(
            "fallbackAttempts",
            serde_json::to_value(&attempts).unwrap_or_else(|_| json!([])),
        );

    FallbackOutcome {
        output,
        tier_index: index,
        tier_name: name,
        served_by: kind,
        degraded,
        attempts,
    }
}

/// Placeholder used when even the final tier has nothing to say.
pub fn emergency_result(agent: &str) -> AgentResult {
    let mut evidence = Map::new();
    evidence.insert("fallback".to_string(), json!("emergency"));
    create_result(format!("{agent}_emergency"), 0.0, 25.0, 0.1, evidence)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::AgentStatus;
    use crate::resilience::circuit_breaker::{BreakerConfig, MemoryBreakerStore};
    use crate::resilience::clock::ManualClock;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn result(score: f64) -> AgentResult {
        create_result("signal", score, score, 0.8, Map::new())
    }

    fn breaker() -> Arc<CircuitBreaker> {
        Arc::new(CircuitBreaker::with_parts(
            BreakerConfig::default(),
            Arc::new(MemoryBreakerStore::new()),
            Arc::new(ManualClock::new(0)),
        ))
    }

    fn provider_error(p: &str) -> AgentError {
        AgentError::Provider {
            provider: p.to_string(),
            message: "503".to_string(),
        }
    }

    #[tokio::test]
    async fn test_first_success_wins() {
        let calls = AtomicU32::new(0);
        let calls = &calls;
        let outcome = FallbackChain::new("sentiment_agent", FinalTier::new("emergency", Vec::new))
            .tier(Tier::cache("cache", || async { Ok(None) }))
            .tier(Tier::provider("openai", || async { Ok(Some(vec![result(70.0)])) }))
            .tier(Tier::local("static_analysis", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(Some(vec![result(10.0)]))
            }))
            .run()
            .await;

        assert_eq!(outcome.tier_index, 1);
        assert_eq!(outcome.tier_name, "provider:openai");
        assert_eq!(outcome.output.results[0].normalized_score, 70.0);
        assert_eq!(calls.load(Ordering::SeqCst), 0, "later tiers never run");
        assert!(outcome.is_degraded());
        assert_eq!(outcome.output.metadata["tierIndex"], 1);
    }

    #[tokio::test]
    async fn test_all_fallible_tiers_fail_final_tier_completes() {
        let outcome = FallbackChain::new("citation_agent", FinalTier::new("emergency", Vec::new))
            .with_breaker(breaker())
            .tier(Tier::cache("cache", || async { Ok(Some(Vec::new())) }))
            .tier(Tier::provider("openai", || async { Err(provider_error("openai")) }))
            .tier(Tier::local("static_analysis", || async {
                Err(AgentError::Unknown("no content".into()))
            }))
            .run()
            .await;

        assert_eq!(outcome.output.status, AgentStatus::Completed);
        assert_eq!(outcome.tier_name, "emergency");
        assert_eq!(outcome.tier_index, 3);
        assert!(outcome.served_by.is_none());
        assert_eq!(outcome.output.metadata["tier"], "emergency");
        assert_eq!(outcome.output.results.len(), 1);
        assert_eq!(outcome.output.results[0].normalized_score, 25.0);
        assert_eq!(outcome.attempts.len(), 4);
    }

    #[tokio::test]
    async fn test_open_breaker_skips_without_recording_failure() {
        let cb = breaker();
        cb.record_failure("openai");
        cb.record_failure("openai");
        let before = cb.status("openai").failure_count;

        let invoked = AtomicU32::new(0);
        let invoked = &invoked;
        let outcome = FallbackChain::new("llm_test_agent", FinalTier::new("emergency", Vec::new))
            .with_breaker(cb.clone())
            .tier(Tier::provider("openai", move || async move {
                invoked.fetch_add(1, Ordering::SeqCst);
                Ok(Some(vec![result(90.0)]))
            }))
            .tier(Tier::provider("anthropic", || async { Ok(Some(vec![result(60.0)])) }))
            .run()
            .await;

        assert_eq!(invoked.load(Ordering::SeqCst), 0);
        assert_eq!(outcome.tier_name, "provider:anthropic");
        assert_eq!(outcome.attempts[0].outcome, AttemptOutcome::SkippedCircuitOpen);
        assert_eq!(cb.status("openai").failure_count, before);
    }

    #[tokio::test]
    async fn test_provider_errors_trip_the_breaker() {
        let cb = breaker();
        for _ in 0..2 {
            FallbackChain::new("commerce_agent", FinalTier::new("emergency", Vec::new))
                .with_breaker(cb.clone())
                .tier(Tier::provider("mistral", || async { Err(provider_error("mistral")) }))
                .run()
                .await;
        }
        assert!(!cb.allow("mistral"));
    }

    #[tokio::test]
    async fn test_primary_tiers_are_not_degraded() {
        let outcome = FallbackChain::new("llm_test_agent", FinalTier::new("emergency", Vec::new))
            .tier(Tier::cache("cache", || async { Ok(None) }))
            .tier(Tier::provider("openai", || async { Ok(Some(vec![result(70.0)])) }).primary(true))
            .run()
            .await;
        assert!(!outcome.is_degraded());
        assert_eq!(outcome.output.metadata["degraded"], false);
        assert!((outcome.output.results[0].confidence_level - 0.8).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_confidence_reduced_by_tier() {
        let outcome = FallbackChain::new("geo_visibility_agent", FinalTier::new("emergency", Vec::new))
            .tier(Tier::cache("cache", || async { Ok(None) }))
            .tier(Tier::local("heuristic", || async { Ok(Some(vec![result(50.0)])) }).with_confidence_factor(0.5))
            .run()
            .await;
        assert!((outcome.output.results[0].confidence_level - 0.4).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_tier_times_out_and_counts_as_provider_failure() {
        let cb = breaker();
        let outcome = FallbackChain::new("sentiment_agent", FinalTier::new("emergency", Vec::new))
            .with_breaker(cb.clone())
            .tier(
                Tier::provider("google", || async {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok(Some(vec![result(99.0)]))
                })
                .with_timeout(Duration::from_secs(5)),
            )
            .run()
            .await;
        assert_eq!(outcome.tier_name, "emergency");
        assert_eq!(cb.status("google").failure_count, 1);
        assert!(matches!(outcome.attempts[0].outcome, AttemptOutcome::Failed(ref m) if m.contains("timed out after 5000ms")));
    }

    #[tokio::test]
    async fn test_out_of_range_answer_falls_through() {
        let cb = breaker();
        let outcome = FallbackChain::new("sentiment_agent", FinalTier::new("emergency", Vec::new))
            .with_breaker(cb.clone())
            .tier(Tier::cache("cache", || async { Ok(Some(vec![result(140.0)])) }))
            .tier(Tier::provider("openai", || async {
                let mut bad = result(60.0);
                bad.confidence_level = 3.0;
                Ok(Some(vec![bad]))
            }))
            .tier(Tier::local("static_analysis", || async { Ok(Some(vec![result(40.0)])) }))
            .run()
            .await;

        assert_eq!(outcome.tier_name, "static_analysis");
        assert_eq!(outcome.output.results[0].normalized_score, 40.0);
        assert!(matches!(outcome.attempts[0].outcome, AttemptOutcome::Failed(ref m) if m.contains("outside 0..=100")));
        assert!(matches!(outcome.attempts[1].outcome, AttemptOutcome::Failed(_)));
        assert_eq!(cb.status("openai").failure_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_caps_and_skips_provider_tiers() {
        let cb = breaker();
        let slow = || async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok::<_, AgentError>(Some(vec![result(99.0)]))
        };
        let started = tokio::time::Instant::now();
        let outcome = FallbackChain::new("sentiment_agent", FinalTier::new("emergency", Vec::new))
            .with_breaker(cb.clone())
            .with_deadline(Duration::from_secs(20))
            .tier(Tier::provider("openai", slow).with_timeout(Duration::from_secs(15)))
            .tier(Tier::provider("anthropic", slow).with_timeout(Duration::from_secs(15)))
            .tier(Tier::provider("google", slow).with_timeout(Duration::from_secs(15)))
            .tier(Tier::local("static_analysis", || async { Ok(Some(vec![result(30.0)])) }))
            .run()
            .await;

        assert!(started.elapsed() <= Duration::from_secs(20));
        assert_eq!(outcome.tier_name, "static_analysis");
        assert_eq!(outcome.attempts[2].outcome, AttemptOutcome::SkippedDeadline);
        // Only the tier that hit its own limit is blamed
        assert_eq!(cb.status("openai").failure_count, 1);
        assert_eq!(cb.status("anthropic").failure_count, 0);
        assert_eq!(cb.status("google").failure_count, 0);
    }
}
