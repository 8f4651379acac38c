//! Topic selection: budget allocation and day-spreading rotation
//!
//! Two pieces that decide which topics a cycle actually fetches. The
//! allocator is a pure function mapping the remaining request budget onto
//! an ordered topic list, priority topics first. The rotation state is a
//! persisted map of when each topic was last processed, used to spread
//! topics across the day instead of hammering the same ones every cycle.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::persist;

/// Order topics within a request budget.
///
/// Priority topics that are actually available come first, in priority
/// order; the rest follow in availability order. The result is capped by
/// how many topics the budget affords (`remaining_budget / cost_per_topic`)
/// and by `max_topics` when given. A zero budget yields an empty batch.
pub fn allocate(
    available: &[String],
    priority: &[String],
    remaining_budget: u32,
    cost_per_topic: u32,
    max_topics: Option<usize>,
) -> Vec<String> {
    let cost = cost_per_topic.max(1);
    let budget_cap = (remaining_budget / cost) as usize;
    let cap = match max_topics {
        Some(m) => budget_cap.min(m),
        None => budget_cap,
    };

    let mut picked: Vec<String> = Vec::new();
    for topic in priority {
        if picked.len() >= cap {
            break;
        }
        if available.contains(topic) && !picked.contains(topic) {
            picked.push(topic.clone());
        }
    }
    for topic in available {
        if picked.len() >= cap {
            break;
        }
        if !picked.contains(topic) {
            picked.push(topic.clone());
        }
    }
    picked
}

/// Persisted map of topic to last-processed time (epoch seconds).
pub struct TopicRotation {
    path: PathBuf,
    state: Mutex<HashMap<String, f64>>,
}

impl TopicRotation {
    /// Load rotation state. A missing or unreadable file starts empty,
    /// which makes every topic eligible.
    pub async fn load(path: PathBuf) -> Result<Self> {
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(common::Error::from)?;
        }
        let state = if path.exists() {
            match persist::read_json::<HashMap<String, f64>>(&path).await {
                Ok(state) => {
                    debug!(path = %path.display(), topics = state.len(), "loaded rotation state");
                    state
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "rotation state unreadable, starting empty");
                    HashMap::new()
                }
            }
        } else {
            HashMap::new()
        };
        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    /// Pick the next batch of topics whose cooldown has lapsed.
    ///
    /// Topics that were never processed come first, then the least
    /// recently processed; ties keep the order of `available`. Returns at
    /// most `max_topics` entries, or all eligible ones when `None`.
    pub async fn next_batch(
        &self,
        available: &[String],
        max_topics: Option<usize>,
        cooldown: Duration,
    ) -> Vec<String> {
        self.next_batch_at(available, max_topics, cooldown, epoch_secs())
            .await
    }

    async fn next_batch_at(
        &self,
        available: &[String],
        max_topics: Option<usize>,
        cooldown: Duration,
        now: f64,
    ) -> Vec<String> {
        if available.is_empty() {
            return Vec::new();
        }
        let cap = max_topics.unwrap_or(available.len());
        let state = self.state.lock().await;

        let mut eligible: Vec<(f64, &String)> = available
            .iter()
            .filter_map(|topic| {
                let last = state.get(topic).copied().unwrap_or(0.0);
                if last == 0.0 || now - last >= cooldown.as_secs_f64() {
                    Some((last, topic))
                } else {
                    None
                }
            })
            .collect();
        eligible.sort_by(|a, b| a.0.total_cmp(&b.0));

        let batch: Vec<String> = eligible
            .into_iter()
            .take(cap)
            .map(|(_, topic)| topic.clone())
            .collect();
        debug!(
            eligible = batch.len(),
            available = available.len(),
            "rotation batch selected"
        );
        batch
    }

    /// Stamp these topics as processed now and persist.
    pub async fn mark_processed(&self, topics: &[String]) {
        self.mark_processed_at(topics, epoch_secs()).await
    }

    async fn mark_processed_at(&self, topics: &[String], now: f64) {
        if topics.is_empty() {
            return;
        }
        let mut state = self.state.lock().await;
        for topic in topics {
            state.insert(topic.clone(), now);
        }
        info!(topics = topics.len(), "marked topics processed");
        if let Err(e) = persist::write_json(&self.path, &*state).await {
            warn!(path = %self.path.display(), error = %e, "failed to persist rotation state");
        }
    }
}

fn epoch_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn topics(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn allocate_priority_first_then_availability_order() {
        let picked = allocate(
            &topics(&["A", "B", "C", "D"]),
            &topics(&["A", "B"]),
            3,
            1,
            None,
        );
        assert_eq!(picked, topics(&["A", "B", "C"]));
    }

    #[test]
    fn allocate_priority_order_wins_over_availability_order() {
        let picked = allocate(
            &topics(&["A", "B", "C", "D"]),
            &topics(&["C", "A"]),
            3,
            1,
            None,
        );
        assert_eq!(picked, topics(&["C", "A", "B"]));
    }

    #[test]
    fn allocate_skips_unavailable_priority_topics() {
        let picked = allocate(&topics(&["A", "B"]), &topics(&["X", "B"]), 10, 1, None);
        assert_eq!(picked, topics(&["B", "A"]));
    }

    #[test]
    fn allocate_empty_on_zero_budget() {
        let picked = allocate(&topics(&["A", "B"]), &topics(&["A"]), 0, 1, None);
        assert!(picked.is_empty());
    }

    #[test]
    fn allocate_divides_budget_by_cost() {
        let picked = allocate(&topics(&["A", "B", "C", "D"]), &[], 5, 2, None);
        assert_eq!(picked, topics(&["A", "B"]));
    }

    #[test]
    fn allocate_honors_caller_ceiling() {
        let picked = allocate(&topics(&["A", "B", "C", "D"]), &[], 10, 1, Some(2));
        assert_eq!(picked, topics(&["A", "B"]));
    }

    #[test]
    fn allocate_deduplicates_priority_entries() {
        let picked = allocate(&topics(&["A", "B"]), &topics(&["A", "A"]), 10, 1, None);
        assert_eq!(picked, topics(&["A", "B"]));
    }

    async fn rotation(dir: &tempfile::TempDir) -> TopicRotation {
        TopicRotation::load(dir.path().join("rotation.json"))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn never_processed_topics_come_first() {
        let dir = tempfile::tempdir().unwrap();
        let r = rotation(&dir).await;

        r.mark_processed_at(&topics(&["old"]), 1_000.0).await;
        r.mark_processed_at(&topics(&["older"]), 500.0).await;

        let batch = r
            .next_batch_at(
                &topics(&["old", "older", "new"]),
                None,
                Duration::from_secs(0),
                2_000.0,
            )
            .await;
        assert_eq!(batch, topics(&["new", "older", "old"]));
    }

    #[tokio::test]
    async fn cooldown_filters_recent_topics() {
        let dir = tempfile::tempdir().unwrap();
        let r = rotation(&dir).await;

        r.mark_processed_at(&topics(&["recent"]), 1_900.0).await;
        r.mark_processed_at(&topics(&["stale"]), 1_000.0).await;

        // Cooldown 600s at t=2000: "recent" (100s ago) is still cooling.
        let batch = r
            .next_batch_at(
                &topics(&["recent", "stale"]),
                None,
                Duration::from_secs(600),
                2_000.0,
            )
            .await;
        assert_eq!(batch, topics(&["stale"]));
    }

    #[tokio::test]
    async fn all_cooling_yields_empty_batch() {
        let dir = tempfile::tempdir().unwrap();
        let r = rotation(&dir).await;

        r.mark_processed_at(&topics(&["a", "b"]), 1_990.0).await;
        let batch = r
            .next_batch_at(&topics(&["a", "b"]), None, Duration::from_secs(600), 2_000.0)
            .await;
        assert!(batch.is_empty());
    }

    #[tokio::test]
    async fn batch_truncates_to_max_topics() {
        let dir = tempfile::tempdir().unwrap();
        let r = rotation(&dir).await;

        let batch = r
            .next_batch_at(
                &topics(&["a", "b", "c", "d"]),
                Some(2),
                Duration::from_secs(0),
                2_000.0,
            )
            .await;
        assert_eq!(batch, topics(&["a", "b"]));
    }

    #[tokio::test]
    async fn state_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rotation.json");

        let r = TopicRotation::load(path.clone()).await.unwrap();
        r.mark_processed_at(&topics(&["nba"]), 1_234.0).await;
        drop(r);

        let r = TopicRotation::load(path).await.unwrap();
        let batch = r
            .next_batch_at(&topics(&["nba", "nhl"]), None, Duration::from_secs(600), 1_300.0)
            .await;
        // "nba" was processed 66s ago and is still cooling; "nhl" never was.
        assert_eq!(batch, topics(&["nhl"]));
    }

    #[tokio::test]
    async fn corrupt_state_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rotation.json");
        tokio::fs::write(&path, "][").await.unwrap();

        let r = TopicRotation::load(path).await.unwrap();
        let batch = r
            .next_batch_at(&topics(&["a"]), None, Duration::from_secs(3600), 2_000.0)
            .await;
        assert_eq!(batch, topics(&["a"]));
    }
}
