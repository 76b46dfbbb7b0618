//! LLM providers as interchangeable text sources.
//!
//! The engine only cares whether a call succeeded and what text came back;
//! each provider sits behind its own circuit-breaker key.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::domain::AgentError;

#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Circuit-breaker key, e.g. `openai`.
    fn id(&self) -> &str;

    /// Per-call budget enforced by the fallback tier.
    fn timeout(&self) -> Duration;

    async fn complete(&self, prompt: &str) -> Result<String, AgentError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderSpec {
    pub id: String,
    pub endpoint: String,
    pub model: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
}

#[derive(Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    prompt: &'a str,
}

#[derive(Deserialize)]
struct CompletionResponse {
    text: String,
}

/// JSON-over-HTTP provider: `POST {endpoint}` with `{model, prompt}`,
/// expecting `{text}` back.
#[derive(Debug, Clone)]
pub struct HttpProvider {
    spec: ProviderSpec,
    client: reqwest::Client,
}

impl HttpProvider {
    pub fn new(spec: ProviderSpec) -> Self {
        Self {
            spec,
            client: reqwest::Client::new(),
        }
    }

    pub fn with_client(spec: ProviderSpec, client: reqwest::Client) -> Self {
        Self { spec, client }
    }

    fn provider_error(&self, message: impl Into<String>) -> AgentError {
        AgentError::Provider {
            provider: self.spec.id.clone(),
            message: message.into(),
        }
    }
}

#[async_trait]
impl LlmProvider for HttpProvider {
    fn id(&self) -> &str {
        &self.spec.id
    }

    fn timeout(&self) -> Duration {
        self.spec.timeout
    }

    async fn complete(&self, prompt: &str) -> Result<String, AgentError> {
        let mut request = self
            .client
            .post(&self.spec.endpoint)
            .timeout(self.spec.timeout)
            .json(&CompletionRequest {
                model: &self.spec.model,
                prompt,
            });
        if let Some(key) = &self.spec.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| self.provider_error(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(self.provider_error(format!("HTTP {status}")));
        }

        let body: CompletionResponse = response
            .json()
            .await
            .map_err(|e| self.provider_error(format!("malformed body: {e}")))?;
        debug!(provider = %self.spec.id, chars = body.text.len(), "provider responded");
        if body.text.trim().is_empty() {
            return Err(self.provider_error("empty completion"));
        }
        Ok(body.text)
    }
}

/// Provider that replays a fixed script of replies, then repeats a default.
///
/// Used for offline runs and tests.
#[derive(Debug)]
pub struct ScriptedProvider {
    id: String,
    script: Mutex<VecDeque<Result<String, String>>>,
    fallback: Result<String, String>,
    delay: Duration,
    timeout: Duration,
    calls: AtomicU32,
}

impl ScriptedProvider {
    /// Always answers with `text`.
    pub fn answering(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(id, Ok(text.into()))
    }

    /// Always fails with `message`.
    pub fn failing(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(id, Err(message.into()))
    }

    fn new(id: impl Into<String>, fallback: Result<String, String>) -> Self {
        Self {
            id: id.into(),
            script: Mutex::new(VecDeque::new()),
            fallback,
            delay: Duration::ZERO,
            timeout: Duration::from_secs(10),
            calls: AtomicU32::new(0),
        }
    }

    /// Queue replies served before the default.
    pub fn then(self, reply: Result<&str, &str>) -> Self {
        if let Ok(mut script) = self.script.lock() {
            script.push_back(reply.map(str::to_string).map_err(str::to_string));
        }
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn complete(&self, _prompt: &str) -> Result<String, AgentError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let next = self
            .script
            .lock()
            .ok()
            .and_then(|mut script| script.pop_front())
            .unwrap_or_else(|| self.fallback.clone());
        next.map_err(|message| AgentError::Provider {
            provider: self.id.clone(),
            message,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_provider_replays_then_defaults() {
        let p = ScriptedProvider::answering("openai", "steady")
            .then(Err("503"))
            .then(Ok("first"));
        assert!(p.complete("q").await.is_err());
        assert_eq!(p.complete("q").await.unwrap(), "first");
        assert_eq!(p.complete("q").await.unwrap(), "steady");
        assert_eq!(p.calls(), 3);
    }

    #[tokio::test]
    async fn test_failing_provider_reports_its_id() {
        let p = ScriptedProvider::failing("mistral", "auth");
        let err = p.complete("q").await.unwrap_err();
        assert!(matches!(err, AgentError::Provider { ref provider, .. } if provider == "mistral"));
        assert!(err.is_provider_failure());
    }
}
