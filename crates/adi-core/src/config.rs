//! Engine configuration read from the environment.
//!
//! Reads:
//! - `ADI_MAX_CONCURRENT` (default 3): slow-agent jobs running at once
//! - `ADI_MAX_QUEUE_SIZE` (default 50): queued jobs before enqueue is rejected
//! - `ADI_FAST_PHASE_BUDGET_MS` (default 7000)
//! - `ADI_BREAKER_THRESHOLD` (default 2), `ADI_BREAKER_COOLDOWN_MS` (default 60000)
//! - `ADI_CACHE_TTL_MS` (default 600000)
//! - `ADI_VERIFY_ATTEMPTS` (default 3), `ADI_VERIFY_DELAY_MS` (default 500)
//! - `ADI_WORKER_URL` (optional): dispatch slow agents over HTTP instead of
//!   the in-process queue
//! - `ADI_PROVIDERS` (optional): comma-separated provider ids, each described
//!   by `ADI_PROVIDER_<ID>_URL` (required), `_KEY`, `_MODEL` and `_TIMEOUT_MS`

use std::str::FromStr;
use std::time::Duration;

use crate::agents::ProviderSpec;
use crate::resilience::BreakerConfig;
use crate::tracker::VerifyPolicy;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: String, value: String },

    #[error("{key} must be set for provider {provider}")]
    Missing { provider: String, key: String },
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorConfig {
    pub max_concurrent: usize,
    pub max_queue_size: usize,
    pub fast_phase_budget: Duration,
    pub breaker: BreakerConfig,
    pub cache_ttl: Duration,
    pub verify: VerifyPolicy,
    /// How long a job blocked on dependencies waits before the queue looks again.
    pub dependency_poll: Duration,
    pub worker_url: Option<String>,
    pub providers: Vec<ProviderSpec>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            max_queue_size: 50,
            fast_phase_budget: Duration::from_millis(7_000),
            breaker: BreakerConfig::default(),
            cache_ttl: Duration::from_millis(600_000),
            verify: VerifyPolicy::default(),
            dependency_poll: Duration::from_millis(250),
            worker_url: None,
            providers: Vec::new(),
        }
    }
}

impl OrchestratorConfig {
    pub fn from_env() -> ConfigResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; `from_env` passes `std::env::var`.
    pub fn from_lookup<F>(lookup: F) -> ConfigResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let d = Self::default();
        let ms = |key: &str, default: Duration| -> ConfigResult<Duration> {
            Ok(parse(&lookup, key)?.map(Duration::from_millis).unwrap_or(default))
        };

        let max_concurrent = parse(&lookup, "ADI_MAX_CONCURRENT")?.unwrap_or(d.max_concurrent);
        if max_concurrent == 0 {
            return Err(ConfigError::Invalid {
                key: "ADI_MAX_CONCURRENT".into(),
                value: "0".into(),
            });
        }

        Ok(Self {
            max_concurrent,
            max_queue_size: parse(&lookup, "ADI_MAX_QUEUE_SIZE")?.unwrap_or(d.max_queue_size),
            fast_phase_budget: ms("ADI_FAST_PHASE_BUDGET_MS", d.fast_phase_budget)?,
            breaker: BreakerConfig {
                threshold: parse(&lookup, "ADI_BREAKER_THRESHOLD")?.unwrap_or(d.breaker.threshold),
                cooldown: ms("ADI_BREAKER_COOLDOWN_MS", d.breaker.cooldown)?,
            },
            cache_ttl: ms("ADI_CACHE_TTL_MS", d.cache_ttl)?,
            verify: VerifyPolicy {
                attempts: parse(&lookup, "ADI_VERIFY_ATTEMPTS")?.unwrap_or(d.verify.attempts),
                delay: ms("ADI_VERIFY_DELAY_MS", d.verify.delay)?,
            },
            dependency_poll: d.dependency_poll,
            worker_url: lookup("ADI_WORKER_URL").filter(|u| !u.trim().is_empty()),
            providers: providers(&lookup)?,
        })
    }
}

fn parse<T, F>(lookup: &F, key: &str) -> ConfigResult<Option<T>>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw.trim().parse().map(Some).map_err(|_| ConfigError::Invalid {
            key: key.to_string(),
            value: raw,
        }),
    }
}

fn providers<F>(lookup: &F) -> ConfigResult<Vec<ProviderSpec>>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(ids) = lookup("ADI_PROVIDERS") else {
        return Ok(Vec::new());
    };

    let mut specs = Vec::new();
    for id in ids.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let prefix = format!("ADI_PROVIDER_{}", id.to_uppercase().replace('-', "_"));
        let url_key = format!("{prefix}_URL");
        let endpoint = lookup(&url_key).ok_or_else(|| ConfigError::Missing {
            provider: id.to_string(),
            key: url_key.clone(),
        })?;
        let timeout_ms = parse(lookup, &format!("{prefix}_TIMEOUT_MS"))?.unwrap_or(15_000u64);
        specs.push(ProviderSpec {
            id: id.to_string(),
            endpoint,
            model: lookup(&format!("{prefix}_MODEL")).unwrap_or_else(|| "default".to_string()),
            api_key: lookup(&format!("{prefix}_KEY")),
            timeout: Duration::from_millis(timeout_ms),
        });
    }
    Ok(specs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_unset() {
        let cfg = OrchestratorConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(cfg, OrchestratorConfig::default());
        assert_eq!(cfg.max_concurrent, 3);
        assert_eq!(cfg.breaker.threshold, 2);
        assert!(cfg.worker_url.is_none());
    }

    #[test]
    fn test_overrides_are_parsed() {
        let cfg = OrchestratorConfig::from_lookup(lookup(&[
            ("ADI_MAX_CONCURRENT", "5"),
            ("ADI_BREAKER_COOLDOWN_MS", "1000"),
            ("ADI_VERIFY_ATTEMPTS", "4"),
            ("ADI_WORKER_URL", "http://worker:8080"),
        ]))
        .unwrap();
        assert_eq!(cfg.max_concurrent, 5);
        assert_eq!(cfg.breaker.cooldown, Duration::from_secs(1));
        assert_eq!(cfg.verify.attempts, 4);
        assert_eq!(cfg.worker_url.as_deref(), Some("http://worker:8080"));
    }

    #[test]
    fn test_invalid_number_names_the_key() {
        let err = OrchestratorConfig::from_lookup(lookup(&[("ADI_MAX_QUEUE_SIZE", "lots")]))
            .unwrap_err();
        assert_eq!(
            err,
            ConfigError::Invalid {
                key: "ADI_MAX_QUEUE_SIZE".into(),
                value: "lots".into()
            }
        );
        assert!(OrchestratorConfig::from_lookup(lookup(&[("ADI_MAX_CONCURRENT", "0")])).is_err());
    }

    #[test]
    fn test_providers_from_env() {
        let cfg = OrchestratorConfig::from_lookup(lookup(&[
            ("ADI_PROVIDERS", "openai, anthropic"),
            ("ADI_PROVIDER_OPENAI_URL", "https://llm.example/openai"),
            ("ADI_PROVIDER_OPENAI_KEY", "sk-test"),
            ("ADI_PROVIDER_ANTHROPIC_URL", "https://llm.example/anthropic"),
            ("ADI_PROVIDER_ANTHROPIC_TIMEOUT_MS", "2000"),
        ]))
        .unwrap();
        assert_eq!(cfg.providers.len(), 2);
        assert_eq!(cfg.providers[0].api_key.as_deref(), Some("sk-test"));
        assert_eq!(cfg.providers[1].timeout, Duration::from_secs(2));

        let err = OrchestratorConfig::from_lookup(lookup(&[("ADI_PROVIDERS", "mistral")])).unwrap_err();
        assert!(matches!(err, ConfigError::Missing { ref provider, .. } if provider == "mistral"));
    }
}
