//! Agent configuration, input and output types.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Scheduling priority of a unit of work. Lower rank runs first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PriorityClass {
    Critical,
    High,
    Medium,
    Low,
}

impl PriorityClass {
    pub fn rank(self) -> u8 {
        match self {
            PriorityClass::Critical => 1,
            PriorityClass::High => 2,
            PriorityClass::Medium => 3,
            PriorityClass::Low => 4,
        }
    }

    pub fn raised(self) -> Self {
        match self {
            PriorityClass::Critical | PriorityClass::High => PriorityClass::Critical,
            PriorityClass::Medium => PriorityClass::High,
            PriorityClass::Low => PriorityClass::Medium,
        }
    }

    pub fn lowered(self) -> Self {
        match self {
            PriorityClass::Critical => PriorityClass::High,
            PriorityClass::High => PriorityClass::Medium,
            PriorityClass::Medium | PriorityClass::Low => PriorityClass::Low,
        }
    }

    /// Priority used when dispatching an agent for an evaluation.
    ///
    /// Urgent evaluations always go first; otherwise the agent's own class is
    /// shifted one step by the evaluation tier.
    pub fn for_dispatch(agent: PriorityClass, tier: EvaluationTier, urgent: bool) -> Self {
        if urgent {
            return PriorityClass::Critical;
        }
        match tier {
            EvaluationTier::Enterprise => agent.raised(),
            EvaluationTier::Professional => agent,
            EvaluationTier::Free => agent.lowered(),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PriorityClass::Critical => "critical",
            PriorityClass::High => "high",
            PriorityClass::Medium => "medium",
            PriorityClass::Low => "low",
        }
    }
}

/// Expected latency profile, fixed per agent type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Latency {
    Fast,
    Slow,
}

/// Static configuration of an agent type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentConfig {
    pub name: &'static str,
    pub timeout_ms: u64,
    pub retry_limit: u32,
    pub dependencies: &'static [&'static str],
    pub parallelizable: bool,
    pub priority: PriorityClass,
    pub latency: Latency,
}

/// One scored finding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentResult {
    pub result_type: String,
    pub raw_value: f64,
    pub normalized_score: f64,
    pub confidence_level: f64,
    #[serde(default)]
    pub evidence: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Completed,
    Failed,
    Skipped,
}

impl AgentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AgentStatus::Completed => "completed",
            AgentStatus::Failed => "failed",
            AgentStatus::Skipped => "skipped",
        }
    }
}

/// What one agent run produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentOutput {
    pub agent_name: String,
    pub status: AgentStatus,
    #[serde(default)]
    pub results: Vec<AgentResult>,
    /// Milliseconds.
    #[serde(default)]
    pub execution_time: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl AgentOutput {
    pub fn completed(agent_name: impl Into<String>, results: Vec<AgentResult>) -> Self {
        Self {
            agent_name: agent_name.into(),
            status: AgentStatus::Completed,
            results,
            execution_time: 0,
            error_message: None,
            metadata: Map::new(),
        }
    }

    pub fn failed(agent_name: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            agent_name: agent_name.into(),
            status: AgentStatus::Failed,
            results: Vec::new(),
            execution_time: 0,
            error_message: Some(error.into()),
            metadata: Map::new(),
        }
    }

    pub fn skipped(agent_name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            agent_name: agent_name.into(),
            status: AgentStatus::Skipped,
            results: Vec::new(),
            execution_time: 0,
            error_message: Some(reason.into()),
            metadata: Map::new(),
        }
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    pub fn with_execution_time(mut self, ms: u64) -> Self {
        self.execution_time = ms;
        self
    }

    pub fn is_completed(&self) -> bool {
        self.status == AgentStatus::Completed
    }

    /// True when a non-primary fallback tier produced this output.
    pub fn is_degraded(&self) -> bool {
        self.metadata
            .get("degraded")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub fn tier(&self) -> Option<&str> {
        self.metadata.get("tier").and_then(Value::as_str)
    }
}

/// Commercial tier of the evaluation, used to derive dispatch priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvaluationTier {
    Free,
    #[default]
    Professional,
    Enterprise,
}

/// Target identity and collaborator-provided data for one evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationContext {
    pub evaluation_id: String,
    pub website_url: String,
    pub brand_name: String,
    #[serde(default)]
    pub tier: EvaluationTier,
    #[serde(default)]
    pub urgent: bool,
    /// Raw page text from the content-fetch service.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crawl_content: Option<String>,
    #[serde(default)]
    pub queries: Vec<String>,
}

impl EvaluationContext {
    pub fn new(
        evaluation_id: impl Into<String>,
        website_url: impl Into<String>,
        brand_name: impl Into<String>,
    ) -> Self {
        Self {
            evaluation_id: evaluation_id.into(),
            website_url: website_url.into(),
            brand_name: brand_name.into(),
            tier: EvaluationTier::default(),
            urgent: false,
            crawl_content: None,
            queries: Vec::new(),
        }
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.crawl_content = Some(content.into());
        self
    }

    pub fn with_tier(mut self, tier: EvaluationTier) -> Self {
        self.tier = tier;
        self
    }
}

/// Input handed to `Agent::execute`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentInput {
    pub context: EvaluationContext,
    /// Outputs of earlier agents keyed by agent name.
    #[serde(default)]
    pub previous_results: BTreeMap<String, AgentOutput>,
    #[serde(default)]
    pub config: Map<String, Value>,
}

impl AgentInput {
    pub fn new(context: EvaluationContext) -> Self {
        Self {
            context,
            previous_results: BTreeMap::new(),
            config: Map::new(),
        }
    }

    pub fn with_previous(mut self, previous: BTreeMap<String, AgentOutput>) -> Self {
        self.previous_results = previous;
        self
    }
}
