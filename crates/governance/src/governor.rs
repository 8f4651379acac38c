//! The governance context: one object per governed upstream
//!
//! A `Governor` owns the quota tracker, response cache, credential pool,
//! pacer, and retrier for a single provider, and runs every upstream call
//! through them in a fixed order: cache first (a hit consumes no quota),
//! then quota admission, then pacing, then the retry loop. Only calls
//! that actually ran are recorded and cached.
//!
//! There is deliberately no global instance; embedders build one Governor
//! per provider and share it across workers behind an `Arc`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use common::ApiKey;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::cache::{CacheStats, ResponseCache};
use crate::credentials::{Credential, CredentialPool};
use crate::error::{CallError, Result};
use crate::pacing::Pacer;
use crate::quota::{Admission, QuotaStatus, QuotaTracker};
use crate::retry::{Retrier, RetryPolicy};

/// Everything a Governor needs to know about one provider.
#[derive(Debug, Clone)]
pub struct GovernorConfig {
    pub quota_state_path: PathBuf,
    pub cache_dir: PathBuf,
    pub daily_quota: u32,
    pub quota_safety_buffer: f64,
    pub cache_ttl_seconds: u64,
    pub cache_enabled: bool,
    pub min_request_interval: Duration,
    pub retry: RetryPolicy,
}

/// What a governed call produced.
#[derive(Debug)]
pub enum FetchOutcome<T> {
    /// Articles fetched from the provider on this call.
    Fresh(Vec<T>),
    /// Articles served from the cache; no quota consumed.
    Cached(Vec<T>),
    /// The quota layer declined to place the call.
    Refused { reason: String },
}

impl<T> FetchOutcome<T> {
    pub fn articles(&self) -> Option<&[T]> {
        match self {
            FetchOutcome::Fresh(a) | FetchOutcome::Cached(a) => Some(a),
            FetchOutcome::Refused { .. } => None,
        }
    }

    pub fn into_articles(self) -> Option<Vec<T>> {
        match self {
            FetchOutcome::Fresh(a) | FetchOutcome::Cached(a) => Some(a),
            FetchOutcome::Refused { .. } => None,
        }
    }

    pub fn is_refused(&self) -> bool {
        matches!(self, FetchOutcome::Refused { .. })
    }
}

/// Resource governance for one upstream provider.
pub struct Governor {
    quota: QuotaTracker,
    cache: ResponseCache,
    pool: Arc<CredentialPool>,
    pacer: Pacer,
    retrier: Retrier,
}

impl Governor {
    /// Build a governor without shutdown wiring.
    pub async fn new(config: GovernorConfig, keys: Vec<ApiKey>) -> Result<Self> {
        let pool = Arc::new(CredentialPool::new(keys)?);
        let retrier = Retrier::new(config.retry.clone(), Arc::clone(&pool));
        Self::assemble(config, pool, retrier).await
    }

    /// Build a governor whose retry waits abort when the watch fires.
    pub async fn with_shutdown(
        config: GovernorConfig,
        keys: Vec<ApiKey>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self> {
        let pool = Arc::new(CredentialPool::new(keys)?);
        let retrier = Retrier::with_shutdown(config.retry.clone(), Arc::clone(&pool), shutdown);
        Self::assemble(config, pool, retrier).await
    }

    async fn assemble(
        config: GovernorConfig,
        pool: Arc<CredentialPool>,
        retrier: Retrier,
    ) -> Result<Self> {
        let quota = QuotaTracker::load(
            config.quota_state_path,
            config.daily_quota,
            config.quota_safety_buffer,
        )
        .await?;
        let cache = ResponseCache::open(
            config.cache_dir,
            config.cache_ttl_seconds,
            config.cache_enabled,
        )
        .await?;
        info!(
            daily_limit = quota.daily_limit(),
            credentials = pool.len(),
            "governor ready"
        );
        Ok(Self {
            quota,
            cache,
            pool,
            pacer: Pacer::new(config.min_request_interval),
            retrier,
        })
    }

    /// Run one upstream call under full governance.
    ///
    /// `topic`, `endpoint`, and `params` identify the request for caching
    /// and bookkeeping; `op` places the actual call and is handed the
    /// active credential on each attempt.
    pub async fn governed_call<T, F, Fut>(
        &self,
        topic: &str,
        endpoint: &str,
        params: &HashMap<String, String>,
        op: F,
    ) -> Result<FetchOutcome<T>>
    where
        T: Serialize + DeserializeOwned,
        F: FnMut(Credential) -> Fut,
        Fut: Future<Output = std::result::Result<Vec<T>, CallError>>,
    {
        if let Some(articles) = self.cache.get(topic, endpoint, params).await {
            return Ok(FetchOutcome::Cached(articles));
        }

        if let Admission::Refused { reason } = self.quota.admit().await {
            warn!(topic, endpoint, reason = %reason, "refusing upstream call");
            return Ok(FetchOutcome::Refused { reason });
        }

        self.pacer.acquire().await;
        let articles = self.retrier.run(op).await?;

        self.quota.record(Some(topic)).await;
        self.cache.put(topic, endpoint, params, &articles).await;
        info!(topic, endpoint, articles = articles.len(), "fetched fresh response");
        Ok(FetchOutcome::Fresh(articles))
    }

    /// Current budget position.
    pub async fn quota_status(&self) -> QuotaStatus {
        self.quota.status().await
    }

    /// Cache directory summary.
    pub async fn cache_stats(&self) -> CacheStats {
        self.cache.stats().await
    }

    /// Remove every cache entry. Returns how many were removed.
    pub async fn clear_cache(&self) -> usize {
        self.cache.clear_all().await
    }

    /// Remove expired cache entries. Returns how many were removed.
    pub async fn clear_expired_cache(&self) -> usize {
        self.cache.clear_expired().await
    }

    /// Administrative quota reset; see [`QuotaTracker::reset`].
    pub async fn reset_quota(&self, force: bool) -> bool {
        self.quota.reset(force).await
    }

    /// The credential pool backing this governor.
    pub fn pool(&self) -> &Arc<CredentialPool> {
        &self.pool
    }
}
