//! Daily request budget tracking with persisted state
//!
//! Tracks upstream requests against a buffered daily limit and a fixed
//! per-hour ceiling. State lives in a JSON file so the budget survives
//! restarts; the day window rolls over lazily when any operation notices
//! the stored date is no longer the current day. A tokio Mutex serializes
//! every read-modify-write-persist sequence.
//!
//! The daily check always runs before the hourly check, so when both
//! windows are exhausted the refusal names the daily limit. Callers
//! depend on that ordering.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::metrics;
use crate::persist;

/// Fixed per-hour ceiling, independent of the configured daily budget.
pub const HOURLY_CEILING: u32 = 10;

/// On-disk day state. Field names are the persisted wire format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaState {
    pub date: String,
    pub requests_made: u32,
    pub requests_by_hour: HashMap<String, u32>,
    pub topics_processed: Vec<String>,
    pub last_reset: f64,
}

impl QuotaState {
    fn fresh(date: &str) -> Self {
        Self {
            date: date.to_string(),
            requests_made: 0,
            requests_by_hour: HashMap::new(),
            topics_processed: Vec::new(),
            last_reset: epoch_secs(),
        }
    }
}

/// Outcome of an admission check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Granted,
    Refused { reason: String },
}

impl Admission {
    pub fn allowed(&self) -> bool {
        matches!(self, Admission::Granted)
    }

    /// Refusal reason, or `"OK"` when granted.
    pub fn reason(&self) -> &str {
        match self {
            Admission::Granted => "OK",
            Admission::Refused { reason } => reason,
        }
    }
}

/// Snapshot of the current budget position.
#[derive(Debug, Clone, Serialize)]
pub struct QuotaStatus {
    pub date: String,
    pub requests_made: u32,
    pub daily_limit: u32,
    pub remaining: u32,
    pub percentage_used: f64,
    pub topics_processed: Vec<String>,
    pub can_make_requests: bool,
    pub last_reset: f64,
}

/// Persisted daily budget tracker.
///
/// The effective limit is `floor(daily_quota * safety_buffer)`, leaving
/// headroom under the provider's hard quota for manual runs and drift.
pub struct QuotaTracker {
    path: PathBuf,
    daily_limit: u32,
    state: Mutex<QuotaState>,
}

impl QuotaTracker {
    /// Load tracker state from the given file path.
    ///
    /// A missing file starts a fresh day and writes it out immediately.
    /// An unreadable or unparsable file is replaced with fresh state
    /// rather than refusing to start; losing a day of bookkeeping is
    /// cheaper than losing the pipeline.
    pub async fn load(path: PathBuf, daily_quota: u32, safety_buffer: f64) -> Result<Self> {
        let daily_limit = (daily_quota as f64 * safety_buffer) as u32;

        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(common::Error::from)?;
        }

        let today = day_key(&Local::now());
        let state = if path.exists() {
            match persist::read_json::<QuotaState>(&path).await {
                Ok(state) if state.date == today => {
                    info!(
                        path = %path.display(),
                        requests_made = state.requests_made,
                        daily_limit,
                        "loaded quota state"
                    );
                    state
                }
                Ok(state) => {
                    info!(previous = %state.date, current = %today, "new day, starting fresh quota state");
                    QuotaState::fresh(&today)
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "quota state unreadable, starting fresh");
                    let state = QuotaState::fresh(&today);
                    persist::write_json(&path, &state).await?;
                    state
                }
            }
        } else {
            info!(path = %path.display(), daily_limit, "no quota state file, starting fresh");
            let state = QuotaState::fresh(&today);
            persist::write_json(&path, &state).await?;
            state
        };

        Ok(Self {
            path,
            daily_limit,
            state: Mutex::new(state),
        })
    }

    /// Effective daily limit after the safety buffer.
    pub fn daily_limit(&self) -> u32 {
        self.daily_limit
    }

    /// Check whether another upstream request may start.
    ///
    /// Does not reserve anything; pair with [`record`](Self::record)
    /// after the request actually runs.
    pub async fn admit(&self) -> Admission {
        let now = Local::now();
        self.admit_at(&day_key(&now), &hour_key(&now)).await
    }

    async fn admit_at(&self, day: &str, hour: &str) -> Admission {
        let mut state = self.state.lock().await;
        self.rollover_if_stale(&mut state, day).await;

        if state.requests_made >= self.daily_limit {
            let reason = format!(
                "Daily quota exceeded ({}/{})",
                state.requests_made, self.daily_limit
            );
            debug!(reason = %reason, "admission refused");
            metrics::record_quota_refusal("daily");
            return Admission::Refused { reason };
        }

        let hour_count = state.requests_by_hour.get(hour).copied().unwrap_or(0);
        if hour_count >= HOURLY_CEILING {
            let reason = format!("Hourly rate limit reached ({hour_count}/{HOURLY_CEILING})");
            debug!(reason = %reason, "admission refused");
            metrics::record_quota_refusal("hourly");
            return Admission::Refused { reason };
        }

        Admission::Granted
    }

    /// Record one completed upstream request, optionally tagged with the
    /// topic it served. Persists the updated state; a failed write keeps
    /// the in-memory count and logs a warning.
    pub async fn record(&self, topic: Option<&str>) {
        let now = Local::now();
        self.record_at(&day_key(&now), &hour_key(&now), topic).await
    }

    async fn record_at(&self, day: &str, hour: &str, topic: Option<&str>) {
        let mut state = self.state.lock().await;
        self.rollover_if_stale(&mut state, day).await;

        state.requests_made += 1;
        *state.requests_by_hour.entry(hour.to_string()).or_insert(0) += 1;
        if let Some(topic) = topic {
            if !state.topics_processed.iter().any(|t| t == topic) {
                state.topics_processed.push(topic.to_string());
            }
        }
        metrics::record_admitted_request();
        debug!(
            requests_made = state.requests_made,
            daily_limit = self.daily_limit,
            "recorded upstream request"
        );
        self.save(&state).await;
    }

    /// Current budget position.
    pub async fn status(&self) -> QuotaStatus {
        self.status_at(&day_key(&Local::now())).await
    }

    async fn status_at(&self, day: &str) -> QuotaStatus {
        let mut state = self.state.lock().await;
        self.rollover_if_stale(&mut state, day).await;

        let remaining = self.daily_limit.saturating_sub(state.requests_made);
        let percentage_used = if self.daily_limit > 0 {
            (state.requests_made as f64 / self.daily_limit as f64 * 1000.0).round() / 10.0
        } else {
            0.0
        };
        QuotaStatus {
            date: state.date.clone(),
            requests_made: state.requests_made,
            daily_limit: self.daily_limit,
            remaining,
            percentage_used,
            topics_processed: state.topics_processed.clone(),
            can_make_requests: remaining > 0,
            last_reset: state.last_reset,
        }
    }

    /// Administrative reset.
    ///
    /// Without `force`, state belonging to the current day is left alone
    /// and `false` is returned; stale state is cleared either way.
    pub async fn reset(&self, force: bool) -> bool {
        let today = day_key(&Local::now());
        let mut state = self.state.lock().await;
        if state.date == today && !force {
            return false;
        }
        info!(force, previous_requests = state.requests_made, "quota state reset");
        *state = QuotaState::fresh(&today);
        self.save(&state).await;
        true
    }

    async fn rollover_if_stale(&self, state: &mut QuotaState, today: &str) {
        if state.date != today {
            info!(previous = %state.date, current = %today, "new day, resetting quota state");
            *state = QuotaState::fresh(today);
            self.save(state).await;
        }
    }

    async fn save(&self, state: &QuotaState) {
        if let Err(e) = persist::write_json(&self.path, state).await {
            warn!(path = %self.path.display(), error = %e, "failed to persist quota state");
        }
    }
}

fn day_key(now: &DateTime<Local>) -> String {
    now.format("%Y-%m-%d").to_string()
}

fn hour_key(now: &DateTime<Local>) -> String {
    now.format("%Y-%m-%d-%H").to_string()
}

fn epoch_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}
