//! Resource governance for metered third-party APIs
//!
//! Keeps a news aggregator inside its providers' free tiers: a persisted
//! daily/hourly quota tracker, a fingerprinted response cache, a credential
//! pool with cooldown-aware rotation, a classifying retry loop, and a
//! cooperative pacer. `Governor` composes them in a fixed order so callers
//! see exactly three outcomes per request: a payload, a structured refusal,
//! or an error.
//!
//! Request lifecycle under `Governor::governed_call`:
//! 1. Cache lookup → hit returns immediately, no quota consumed
//! 2. Quota admission → over budget returns `FetchOutcome::Refused`
//! 3. Pacer spaces the call start from the previous one
//! 4. Retrier places the call, rotating credentials on rate limits
//! 5. Success is recorded against the quota and written to the cache

pub mod cache;
pub mod credentials;
pub mod error;
pub mod governor;
pub mod metrics;
pub mod pacing;
mod persist;
pub mod quota;
pub mod retry;
pub mod topics;

pub use cache::{CacheStats, ResponseCache};
pub use credentials::{Credential, CredentialPool};
pub use error::{CallError, Error, Result};
pub use governor::{FetchOutcome, Governor, GovernorConfig};
pub use pacing::Pacer;
pub use quota::{Admission, QuotaStatus, QuotaTracker};
pub use retry::{ErrorClass, Retrier, RetryPolicy, classify, parse_retry_delay};
pub use topics::{TopicRotation, allocate};
