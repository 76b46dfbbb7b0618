//! Provider resilience: circuit breaking, caching and tiered fallback.

pub mod cache;
pub mod circuit_breaker;
pub mod clock;
pub mod fallback;

pub use cache::{cache_key, similarity_tag, CacheEntry, CacheStore, MemoryCacheStore};
pub use circuit_breaker::{
    BreakerConfig, BreakerPhase, BreakerState, BreakerStatus, BreakerStore, CircuitBreaker,
    MemoryBreakerStore,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use fallback::{
    AttemptOutcome, FallbackChain, FallbackOutcome, FinalTier, Tier, TierAttempt, TierKind,
    TierOutcome,
};
