//! Provider-backed agents that always complete.
//!
//! Tier order: cache, each provider in turn, a cached answer for the same
//! brand, a static estimate from crawled content, and finally an emergency
//! placeholder.

use std::convert::Infallible;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, instrument};

use super::probes::{emergency_estimate, prompt_for, score_response, static_estimate};
use super::{AgentDeps, AgentKind};
use crate::contract::Agent;
use crate::domain::{AgentConfig, AgentError, AgentInput, AgentOutput, AgentResult};
use crate::resilience::cache::new_entry;
use crate::resilience::{cache_key, similarity_tag, FallbackChain, FinalTier, Tier, TierKind};

/// Time kept back from the agent timeout for the local tiers and the
/// tracker write that follows.
const DEADLINE_RESERVE: Duration = Duration::from_millis(1_000);

pub struct BulletproofAgent {
    kind: AgentKind,
    deps: AgentDeps,
}

impl BulletproofAgent {
    pub fn new(kind: AgentKind, deps: AgentDeps) -> Self {
        Self { kind, deps }
    }

    pub fn kind(&self) -> AgentKind {
        self.kind
    }

    /// Run the fallback chain. The error type is uninhabited.
    #[instrument(skip(self, input), fields(agent = self.kind.name(), evaluation_id = %input.context.evaluation_id))]
    pub async fn run(&self, input: &AgentInput) -> Result<AgentOutput, Infallible> {
        let name = self.kind.name();
        let ctx = &input.context;
        let key = cache_key(name, &ctx.website_url, &ctx.brand_name);
        let tag = similarity_tag(name, &ctx.brand_name);
        let prompt = prompt_for(self.kind, ctx);
        let kind = self.kind;
        let cache = &self.deps.cache;
        let (key_ref, tag_ref, prompt_ref) = (key.as_str(), tag.as_str(), prompt.as_str());

        let budget = Duration::from_millis(self.kind.config().timeout_ms).saturating_sub(DEADLINE_RESERVE);

        let mut chain = FallbackChain::new(name, FinalTier::new("emergency", move || emergency_estimate(kind)))
            .with_breaker(self.deps.breaker.clone())
            .with_deadline(budget)
            .tier(
                Tier::cache("cache", move || async move {
                    Ok(cache.get(key_ref).and_then(|e| decode_results(e.data)))
                })
                .primary(true),
            );

        for (i, provider) in self.deps.providers.iter().enumerate() {
            chain = chain.tier(
                Tier::provider(provider.id(), move || async move {
                    let text = provider.complete(prompt_ref).await?;
                    Ok(Some(score_response(kind, ctx, provider.id(), &text)))
                })
                .with_timeout(provider.timeout())
                .primary(i == 0),
            );
        }

        let outcome = chain
            .tier(
                Tier::cache("cached_similar", move || async move {
                    Ok(cache.find_similar(tag_ref, key_ref).and_then(|e| decode_results(e.data)))
                })
                .with_confidence_factor(0.6),
            )
            .tier(
                Tier::local("static_analysis", move || async move { Ok(static_estimate(kind, input)) })
                    .with_confidence_factor(0.75),
            )
            .run()
            .await;

        if matches!(outcome.served_by, Some(TierKind::Provider(_))) {
            match serde_json::to_value(&outcome.output.results) {
                Ok(data) => {
                    cache.put(new_entry(
                        self.deps.clock.as_ref(),
                        key.clone(),
                        tag.clone(),
                        data,
                        self.deps.cache_ttl,
                    ));
                    debug!(agent = name, "provider answer cached");
                }
                Err(err) => debug!(agent = name, error = %err, "could not cache results"),
            }
        }

        Ok(outcome.output)
    }
}

fn decode_results(data: serde_json::Value) -> Option<Vec<AgentResult>> {
    serde_json::from_value::<Vec<AgentResult>>(data)
        .ok()
        .filter(|r| !r.is_empty())
}

#[async_trait]
impl Agent for BulletproofAgent {
    fn config(&self) -> &AgentConfig {
        self.kind.config()
    }

    async fn execute(&self, input: &AgentInput) -> Result<AgentOutput, AgentError> {
        match self.run(input).await {
            Ok(output) => Ok(output),
            Err(never) => match never {},
        }
    }
}
