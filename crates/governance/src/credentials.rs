//! Credential pool with per-key cooldown
//!
//! Holds the ordered API keys for one upstream provider. One key is active
//! at a time; when the provider rate-limits it, the key is put on cooldown
//! and the pool rotates to the next key whose cooldown has lapsed. Cooldown
//! expiry is lazy: expired entries are cleared when rotation next looks at
//! them, there is no background task.
//!
//! Active index and cooldown map live behind a single Mutex so a rotation
//! and a cooldown mark can never interleave.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use common::ApiKey;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::metrics;

/// A borrowed view of the active credential, cheap to clone into request
/// futures.
#[derive(Debug, Clone)]
pub struct Credential {
    pub index: usize,
    pub key: Arc<ApiKey>,
}

#[derive(Debug)]
struct PoolState {
    active: usize,
    cooldown_until: HashMap<usize, Instant>,
}

/// Ordered credential pool for one upstream provider.
#[derive(Debug)]
pub struct CredentialPool {
    keys: Vec<Arc<ApiKey>>,
    state: Mutex<PoolState>,
}

impl CredentialPool {
    /// Build a pool from configured keys, in configuration order.
    pub fn new(keys: Vec<ApiKey>) -> Result<Self> {
        if keys.is_empty() {
            return Err(common::Error::Config("at least one API key is required".into()).into());
        }
        info!(credentials = keys.len(), "credential pool initialized");
        Ok(Self {
            keys: keys.into_iter().map(Arc::new).collect(),
            state: Mutex::new(PoolState {
                active: 0,
                cooldown_until: HashMap::new(),
            }),
        })
    }

    /// Number of keys in the pool.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// The currently active credential.
    ///
    /// The active key is returned even while it is cooling down; rotation
    /// is what moves off a limited key, and when every key is cooling the
    /// caller falls back to waiting rather than going keyless.
    pub async fn current(&self) -> Credential {
        let state = self.state.lock().await;
        Credential {
            index: state.active,
            key: Arc::clone(&self.keys[state.active]),
        }
    }

    /// Put the active key on cooldown for `duration`.
    pub async fn mark_cooldown(&self, duration: Duration) {
        let mut state = self.state.lock().await;
        let index = state.active;
        state
            .cooldown_until
            .insert(index, Instant::now() + duration);
        warn!(
            index,
            key = self.keys[index].last4(),
            cooldown_secs = duration.as_secs(),
            "credential placed on cooldown"
        );
    }

    /// Switch to the next key, in order, whose cooldown has lapsed.
    ///
    /// Scans every key except the active one. Returns `false` when no
    /// other key is usable; the active index is left unchanged in that
    /// case.
    pub async fn rotate(&self) -> bool {
        let mut state = self.state.lock().await;
        let n = self.keys.len();
        let now = Instant::now();

        for offset in 1..n {
            let candidate = (state.active + offset) % n;
            let usable = match state.cooldown_until.get(&candidate) {
                Some(until) if now < *until => {
                    debug!(
                        index = candidate,
                        remaining_secs = (*until - now).as_secs(),
                        "skipping cooling credential"
                    );
                    false
                }
                Some(_) => {
                    info!(index = candidate, "cooldown expired, credential available again");
                    state.cooldown_until.remove(&candidate);
                    true
                }
                None => true,
            };
            if usable {
                state.active = candidate;
                info!(
                    index = candidate,
                    key = self.keys[candidate].last4(),
                    "rotated to credential"
                );
                metrics::record_rotation();
                return true;
            }
        }

        debug!("no credential available to rotate to");
        false
    }

    /// How many keys are currently usable (not cooling down).
    pub async fn available_count(&self) -> usize {
        let state = self.state.lock().await;
        let now = Instant::now();
        (0..self.keys.len())
            .filter(|i| state.cooldown_until.get(i).is_none_or(|until| now >= *until))
            .count()
    }
}
