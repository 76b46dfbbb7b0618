//! Closed catalogue of agent kinds and the factory that builds them.

pub mod bulletproof;
pub mod heuristics;
pub mod probes;
pub mod provider;

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::contract::Agent;
use crate::domain::{AgentConfig, AgentError, Latency, PriorityClass};
use crate::resilience::{CacheStore, CircuitBreaker, Clock, MemoryCacheStore, SystemClock};

pub use bulletproof::BulletproofAgent;
pub use heuristics::HeuristicAgent;
pub use provider::{HttpProvider, LlmProvider, ProviderSpec, ScriptedProvider};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AgentKind {
    #[serde(rename = "crawl_agent")]
    Crawl,
    #[serde(rename = "schema_agent")]
    Schema,
    #[serde(rename = "semantic_agent")]
    Semantic,
    #[serde(rename = "conversational_copy_agent")]
    ConversationalCopy,
    #[serde(rename = "knowledge_graph_agent")]
    KnowledgeGraph,
    #[serde(rename = "brand_heritage_agent")]
    BrandHeritage,
    #[serde(rename = "score_aggregator")]
    ScoreAggregator,
    #[serde(rename = "llm_test_agent")]
    LlmTest,
    #[serde(rename = "sentiment_agent")]
    Sentiment,
    #[serde(rename = "citation_agent")]
    Citation,
    #[serde(rename = "geo_visibility_agent")]
    GeoVisibility,
    #[serde(rename = "commerce_agent")]
    Commerce,
}

const fn config(
    name: &'static str,
    timeout_ms: u64,
    retry_limit: u32,
    dependencies: &'static [&'static str],
    priority: PriorityClass,
    latency: Latency,
) -> AgentConfig {
    AgentConfig {
        name,
        timeout_ms,
        retry_limit,
        dependencies,
        parallelizable: true,
        priority,
        latency,
    }
}

const CRAWL: AgentConfig = AgentConfig {
    parallelizable: false,
    ..config("crawl_agent", 5_000, 1, &[], PriorityClass::Critical, Latency::Fast)
};
const SCHEMA: AgentConfig = config("schema_agent", 3_000, 1, &["crawl_agent"], PriorityClass::High, Latency::Fast);
const SEMANTIC: AgentConfig = config("semantic_agent", 3_000, 1, &["crawl_agent"], PriorityClass::High, Latency::Fast);
const CONVERSATIONAL_COPY: AgentConfig = config(
    "conversational_copy_agent",
    3_000,
    1,
    &["crawl_agent"],
    PriorityClass::Medium,
    Latency::Fast,
);
const KNOWLEDGE_GRAPH: AgentConfig = config(
    "knowledge_graph_agent",
    3_000,
    1,
    &["crawl_agent"],
    PriorityClass::Medium,
    Latency::Fast,
);
const BRAND_HERITAGE: AgentConfig = config(
    "brand_heritage_agent",
    3_000,
    1,
    &["crawl_agent"],
    PriorityClass::Medium,
    Latency::Fast,
);
const SCORE_AGGREGATOR: AgentConfig = AgentConfig {
    parallelizable: false,
    ..config(
        "score_aggregator",
        2_000,
        0,
        &[
            "crawl_agent",
            "schema_agent",
            "semantic_agent",
            "conversational_copy_agent",
            "knowledge_graph_agent",
            "brand_heritage_agent",
        ],
        PriorityClass::Medium,
        Latency::Fast,
    )
};
// Fallback chains absorb provider failures, so slow agents never retry
const LLM_TEST: AgentConfig = config("llm_test_agent", 45_000, 0, &["crawl_agent"], PriorityClass::High, Latency::Slow);
const SENTIMENT: AgentConfig = config("sentiment_agent", 30_000, 0, &[], PriorityClass::Medium, Latency::Slow);
const CITATION: AgentConfig = config("citation_agent", 30_000, 0, &[], PriorityClass::Medium, Latency::Slow);
const GEO_VISIBILITY: AgentConfig = config(
    "geo_visibility_agent",
    30_000,
    0,
    &["crawl_agent"],
    PriorityClass::Low,
    Latency::Slow,
);
const COMMERCE: AgentConfig = config(
    "commerce_agent",
    35_000,
    0,
    &["crawl_agent", "llm_test_agent"],
    PriorityClass::Medium,
    Latency::Slow,
);

impl AgentKind {
    pub const ALL: [AgentKind; 12] = [
        AgentKind::Crawl,
        AgentKind::Schema,
        AgentKind::Semantic,
        AgentKind::ConversationalCopy,
        AgentKind::KnowledgeGraph,
        AgentKind::BrandHeritage,
        AgentKind::ScoreAggregator,
        AgentKind::LlmTest,
        AgentKind::Sentiment,
        AgentKind::Citation,
        AgentKind::GeoVisibility,
        AgentKind::Commerce,
    ];

    pub fn config(self) -> &'static AgentConfig {
        match self {
            AgentKind::Crawl => &CRAWL,
            AgentKind::Schema => &SCHEMA,
            AgentKind::Semantic => &SEMANTIC,
            AgentKind::ConversationalCopy => &CONVERSATIONAL_COPY,
            AgentKind::KnowledgeGraph => &KNOWLEDGE_GRAPH,
            AgentKind::BrandHeritage => &BRAND_HERITAGE,
            AgentKind::ScoreAggregator => &SCORE_AGGREGATOR,
            AgentKind::LlmTest => &LLM_TEST,
            AgentKind::Sentiment => &SENTIMENT,
            AgentKind::Citation => &CITATION,
            AgentKind::GeoVisibility => &GEO_VISIBILITY,
            AgentKind::Commerce => &COMMERCE,
        }
    }

    pub fn name(self) -> &'static str {
        self.config().name
    }

    pub fn latency(self) -> Latency {
        self.config().latency
    }

    pub fn from_name(name: &str) -> Result<Self, AgentError> {
        Self::ALL
            .into_iter()
            .find(|k| k.name() == name)
            .ok_or_else(|| AgentError::UnknownAgent(name.to_string()))
    }

    pub fn fast() -> impl Iterator<Item = AgentKind> {
        Self::ALL.into_iter().filter(|k| k.latency() == Latency::Fast)
    }

    pub fn slow() -> impl Iterator<Item = AgentKind> {
        Self::ALL.into_iter().filter(|k| k.latency() == Latency::Slow)
    }
}

impl std::fmt::Display for AgentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Shared collaborators injected into agents.
#[derive(Clone)]
pub struct AgentDeps {
    pub providers: Vec<Arc<dyn LlmProvider>>,
    pub breaker: Arc<CircuitBreaker>,
    pub cache: Arc<dyn CacheStore>,
    pub clock: Arc<dyn Clock>,
    pub cache_ttl: Duration,
}

impl AgentDeps {
    /// Process-local breaker and cache.
    pub fn in_memory(
        providers: Vec<Arc<dyn LlmProvider>>,
        breaker: crate::resilience::BreakerConfig,
        cache_ttl: Duration,
    ) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        Self {
            providers,
            breaker: Arc::new(CircuitBreaker::with_parts(
                breaker,
                Arc::new(crate::resilience::MemoryBreakerStore::new()),
                clock.clone(),
            )),
            cache: Arc::new(MemoryCacheStore::new(clock.clone())),
            clock,
            cache_ttl,
        }
    }

    /// HTTP providers from `config.providers`, in declaration order.
    pub fn from_config(config: &crate::config::OrchestratorConfig) -> Self {
        let providers = config
            .providers
            .iter()
            .cloned()
            .map(|spec| Arc::new(HttpProvider::new(spec)) as Arc<dyn LlmProvider>)
            .collect();
        Self::in_memory(providers, config.breaker, config.cache_ttl)
    }
}

/// An agent together with the capability its kind guarantees.
#[derive(Clone)]
pub enum AgentHandle {
    /// Local heuristic; may fail and is retried by the contract.
    Fast(Arc<HeuristicAgent>),
    /// Fallback chain; always completes.
    Bulletproof(Arc<BulletproofAgent>),
}

impl AgentHandle {
    pub fn as_agent(&self) -> Arc<dyn Agent> {
        match self {
            AgentHandle::Fast(a) => a.clone(),
            AgentHandle::Bulletproof(a) => a.clone(),
        }
    }

    pub fn kind(&self) -> AgentKind {
        match self {
            AgentHandle::Fast(a) => a.kind(),
            AgentHandle::Bulletproof(a) => a.kind(),
        }
    }
}

pub fn create_agent(kind: AgentKind, deps: &AgentDeps) -> AgentHandle {
    match kind.latency() {
        Latency::Fast => AgentHandle::Fast(Arc::new(HeuristicAgent::new(kind))),
        Latency::Slow => AgentHandle::Bulletproof(Arc::new(BulletproofAgent::new(kind, deps.clone()))),
    }
}

/// Build an agent from its wire name.
pub fn create_agent_by_name(name: &str, deps: &AgentDeps) -> Result<AgentHandle, AgentError> {
    AgentKind::from_name(name).map(|kind| create_agent(kind, deps))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalogue_split() {
        let fast: Vec<_> = AgentKind::fast().map(AgentKind::name).collect();
        let slow: Vec<_> = AgentKind::slow().map(AgentKind::name).collect();
        assert_eq!(fast.len(), 7);
        assert_eq!(
            slow,
            vec![
                "llm_test_agent",
                "sentiment_agent",
                "citation_agent",
                "geo_visibility_agent",
                "commerce_agent"
            ]
        );
    }

    #[test]
    fn test_names_round_trip_and_unknown_is_an_error() {
        for kind in AgentKind::ALL {
            assert_eq!(AgentKind::from_name(kind.name()).unwrap(), kind);
            let wire = serde_json::to_value(kind).unwrap();
            assert_eq!(wire, kind.name());
        }
        assert_eq!(
            AgentKind::from_name("astrology_agent"),
            Err(AgentError::UnknownAgent("astrology_agent".to_string()))
        );
    }

    #[test]
    fn test_dependencies_name_known_agents() {
        for kind in AgentKind::ALL {
            for dep in kind.config().dependencies {
                assert!(AgentKind::from_name(dep).is_ok(), "{kind} depends on unknown {dep}");
            }
        }
    }

    #[test]
    fn test_factory_returns_capability_by_latency() {
        let deps = AgentDeps::in_memory(Vec::new(), Default::default(), Duration::from_secs(600));
        assert!(matches!(create_agent(AgentKind::Schema, &deps), AgentHandle::Fast(_)));
        assert!(matches!(create_agent(AgentKind::Citation, &deps), AgentHandle::Bulletproof(_)));
        assert_eq!(create_agent(AgentKind::Commerce, &deps).kind(), AgentKind::Commerce);
        assert!(create_agent_by_name("nope", &deps).is_err());
    }
}
