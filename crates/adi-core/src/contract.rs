//! Agent execution contract: timeout, bounded retry, output validation.
//!
//! [`ExecutionContract::run`] never returns an error. Exhausted retries are
//! folded into an [`AgentOutput`] with `status = failed`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{debug, instrument, warn};

use crate::domain::{validate_output, AgentConfig, AgentError, AgentInput, AgentOutput};
use crate::metrics::METRICS;
use crate::obs;

/// One analysis unit.
#[async_trait]
pub trait Agent: Send + Sync {
    fn config(&self) -> &AgentConfig;

    async fn execute(&self, input: &AgentInput) -> Result<AgentOutput, AgentError>;
}

/// Capped exponential backoff: `min(base * 2^(attempt-1), max)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(1_000),
            max: Duration::from_millis(30_000),
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        let factor = 1u32 << exp;
        self.base.saturating_mul(factor).min(self.max)
    }
}

/// Cooperative cancellation flag checked between attempts.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExecutionContract {
    backoff: BackoffPolicy,
}

impl ExecutionContract {
    pub fn new(backoff: BackoffPolicy) -> Self {
        Self { backoff }
    }

    pub fn backoff(&self) -> BackoffPolicy {
        self.backoff
    }

    /// Race `agent.execute` against its configured timeout and validate the
    /// output. The timer is dropped with the race on either branch.
    pub async fn execute_with_timeout(
        &self,
        agent: &dyn Agent,
        input: &AgentInput,
    ) -> Result<AgentOutput, AgentError> {
        let config = agent.config();
        let budget = Duration::from_millis(config.timeout_ms);
        let started = Instant::now();

        let mut output = match tokio::time::timeout(budget, agent.execute(input)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(AgentError::Timeout {
                    agent: config.name.to_string(),
                    timeout_ms: config.timeout_ms,
                })
            }
        };

        validate_output(config, &output).map_err(|reason| AgentError::Validation {
            agent: config.name.to_string(),
            reason,
        })?;

        if output.execution_time == 0 {
            output.execution_time = elapsed_ms(started);
        }
        Ok(output)
    }

    /// Retry from `attempt` (1-based) up to the agent's `retry_limit`,
    /// sleeping the backoff delay before each try.
    pub async fn retry(
        &self,
        agent: &dyn Agent,
        input: &AgentInput,
        attempt: u32,
        cancel: Option<&CancelToken>,
        mut last_error: AgentError,
    ) -> Result<AgentOutput, AgentError> {
        let config = agent.config();
        let mut attempt = attempt.max(1);

        while attempt <= config.retry_limit {
            if cancel.is_some_and(CancelToken::is_cancelled) {
                return Err(AgentError::Cancelled {
                    agent: config.name.to_string(),
                });
            }

            let delay = self.backoff.delay_for(attempt);
            debug!(agent = config.name, attempt, delay_ms = delay.as_millis() as u64, "retrying agent");
            tokio::time::sleep(delay).await;

            match self.execute_with_timeout(agent, input).await {
                Ok(output) => return Ok(output),
                Err(err) => {
                    warn!(agent = config.name, attempt, error = %err, "agent retry failed");
                    last_error = err;
                }
            }
            attempt += 1;
        }

        if config.retry_limit == 0 {
            return Err(last_error);
        }
        Err(AgentError::RetriesExhausted {
            agent: config.name.to_string(),
            retries: config.retry_limit,
            source: Box::new(last_error),
        })
    }

    /// First attempt followed by up to `retry_limit` retries.
    pub async fn execute_with_retry(
        &self,
        agent: &dyn Agent,
        input: &AgentInput,
        cancel: Option<&CancelToken>,
    ) -> Result<AgentOutput, AgentError> {
        match self.execute_with_timeout(agent, input).await {
            Ok(output) => Ok(output),
            Err(err) => self.retry(agent, input, 1, cancel, err).await,
        }
    }

    /// Execute under the full contract. Failures become `status = failed`.
    #[instrument(skip(self, agent, input, cancel), fields(agent = agent.config().name))]
    pub async fn run(
        &self,
        agent: &dyn Agent,
        input: &AgentInput,
        cancel: Option<&CancelToken>,
    ) -> AgentOutput {
        let started = Instant::now();
        let name = agent.config().name;
        let output = match self.execute_with_retry(agent, input, cancel).await {
            Ok(output) => output,
            Err(err) => {
                METRICS.inc_agents_failed();
                AgentOutput::failed(name, err.to_string())
                    .with_execution_time(elapsed_ms(started))
                    .with_metadata(
                        "errorClass",
                        serde_json::to_value(err.class()).unwrap_or_default(),
                    )
            }
        };
        METRICS.inc_agents_executed();
        obs::emit_agent_finished(name, output.status.as_str(), output.execution_time, output.tier());
        output
    }
}

pub(crate) fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_then_caps() {
        let b = BackoffPolicy::default();
        assert_eq!(b.delay_for(1), Duration::from_millis(1_000));
        assert_eq!(b.delay_for(2), Duration::from_millis(2_000));
        assert_eq!(b.delay_for(3), Duration::from_millis(4_000));
        assert_eq!(b.delay_for(5), Duration::from_millis(16_000));
        assert_eq!(b.delay_for(6), Duration::from_millis(30_000));
        assert_eq!(b.delay_for(40), Duration::from_millis(30_000));
    }

    #[test]
    fn test_cancel_token_is_shared() {
        let token = CancelToken::new();
        let clone = token.clone();
        clone.cancel();
        assert!(token.is_cancelled());
    }
}
