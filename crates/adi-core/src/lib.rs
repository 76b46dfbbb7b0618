//! ADI Core Library
//!
//! Execution and resilience core of the AI Discoverability Index engine:
//! agents run under a timeout/retry/validation contract, provider calls sit
//! behind per-provider circuit breakers and tiered fallback, every slow-agent
//! run is tracked in a verified execution record, and a hybrid orchestrator
//! splits evaluations into a synchronous fast phase and a queued slow phase.

pub mod agents;
pub mod config;
pub mod contract;
pub mod domain;
pub mod metrics;
pub mod obs;
pub mod orchestrator;
pub mod resilience;
pub mod telemetry;
pub mod tracker;
pub mod worker;

pub use agents::{
    create_agent, create_agent_by_name, AgentDeps, AgentHandle, AgentKind, BulletproofAgent,
    HeuristicAgent, HttpProvider, LlmProvider, ProviderSpec, ScriptedProvider,
};

pub use config::{ConfigError, ConfigResult, OrchestratorConfig};

pub use contract::{Agent, BackoffPolicy, CancelToken, ExecutionContract};

pub use domain::{
    aggregate_scores, AgentConfig, AgentError, AgentInput, AgentOutput, AgentResult, AgentStatus,
    AggregateScore, ErrorClass, EvaluationContext, EvaluationTier, Latency, PriorityClass,
    ValidationError,
};

pub use orchestrator::{
    CancelSummary, EvaluationPhase, EvaluationStatus, FinalResults, HttpDispatcher,
    HybridOrchestrator, JobRunner, OrchestratorError, OrchestratorResult, OverallStatus,
    PartialResults, QueueConfig, QueueDispatcher, QueueMetrics, SlowAgentDispatcher, WorkQueue,
};

pub use resilience::{
    BreakerConfig, CacheStore, CircuitBreaker, Clock, FallbackChain, ManualClock,
    MemoryBreakerStore, MemoryCacheStore, SystemClock,
};

pub use tracker::{ExecutionTracker, TrackerError, VerifyPolicy, CANCELLED, UNHANDLED_EXIT};

pub use worker::{DispatchRequest, DispatchResponse, WorkerError, WorkerRuntime};

pub use metrics::METRICS;
pub use telemetry::init_tracing;
