//! Fingerprint-keyed response cache with TTL expiry
//!
//! Each cached response lives in its own JSON file named by a SHA-256
//! fingerprint of the request identity: topic, endpoint, calendar day, and
//! the query parameters that change result content. Pagination and
//! credential parameters are deliberately excluded so equivalent requests
//! coalesce onto one entry. Expired and unreadable entries are removed at
//! read time; there is no background sweeper.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::Local;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::metrics;

/// Parameters that never enter the fingerprint. Requests differing only in
/// these collapse onto the same entry.
const EXCLUDED_PARAMS: &[&str] = &["page", "pageSize", "apiKey"];

/// On-disk entry, one file per fingerprint. Field names are the persisted
/// wire format.
#[derive(Debug, Deserialize)]
struct CacheEntry<T> {
    timestamp: f64,
    #[allow(dead_code)]
    topic: String,
    #[allow(dead_code)]
    endpoint: String,
    articles: Vec<T>,
    #[allow(dead_code)]
    count: usize,
}

#[derive(Serialize)]
struct CacheEntryRef<'a, T> {
    timestamp: f64,
    topic: &'a str,
    endpoint: &'a str,
    articles: &'a [T],
    count: usize,
}

/// Summary of the cache directory for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub total_files: usize,
    pub total_articles: usize,
    pub cache_size_mb: f64,
    pub oldest_cache: Option<String>,
    pub newest_cache: Option<String>,
    pub enabled: bool,
}

/// File-backed response cache.
///
/// Entries are immutable once written; a newer response for the same
/// fingerprint simply replaces the file. Reads are lock-free: the worst
/// concurrent outcome is two workers fetching the same topic once each,
/// which the fingerprint then deduplicates.
pub struct ResponseCache {
    dir: PathBuf,
    ttl_seconds: f64,
    enabled: bool,
}

impl ResponseCache {
    /// Open a cache rooted at `dir`, creating the directory if needed.
    pub async fn open(dir: PathBuf, ttl_seconds: u64, enabled: bool) -> Result<Self> {
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(common::Error::from)?;
        debug!(dir = %dir.display(), ttl_seconds, enabled, "response cache ready");
        Ok(Self {
            dir,
            ttl_seconds: ttl_seconds as f64,
            enabled,
        })
    }

    /// Look up a fresh entry for this request identity.
    ///
    /// Returns `None` on miss, on expiry (removing the stale file), and on
    /// unreadable entries (removing the damaged file). Disabled caches
    /// always miss.
    pub async fn get<T: DeserializeOwned>(
        &self,
        topic: &str,
        endpoint: &str,
        params: &HashMap<String, String>,
    ) -> Option<Vec<T>> {
        if !self.enabled {
            return None;
        }

        let path = self.entry_path(topic, endpoint, params);
        if !path.exists() {
            debug!(topic, endpoint, "cache miss");
            metrics::record_cache_event("miss");
            return None;
        }

        let entry: CacheEntry<T> = match read_entry(&path).await {
            Ok(entry) => entry,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "removing unreadable cache entry");
                remove_quietly(&path).await;
                metrics::record_cache_event("miss");
                return None;
            }
        };

        let age = epoch_secs() - entry.timestamp;
        if age > self.ttl_seconds {
            debug!(topic, endpoint, age_secs = age as u64, "cache entry expired");
            remove_quietly(&path).await;
            metrics::record_cache_event("expired");
            return None;
        }

        info!(topic, endpoint, articles = entry.articles.len(), "cache hit");
        metrics::record_cache_event("hit");
        Some(entry.articles)
    }

    /// Store a response under this request identity.
    ///
    /// A failed write is logged and swallowed; the response the caller
    /// already holds must not be lost to cache bookkeeping.
    pub async fn put<T: Serialize>(
        &self,
        topic: &str,
        endpoint: &str,
        params: &HashMap<String, String>,
        articles: &[T],
    ) {
        if !self.enabled {
            return;
        }

        let path = self.entry_path(topic, endpoint, params);
        let entry = CacheEntryRef {
            timestamp: epoch_secs(),
            topic,
            endpoint,
            articles,
            count: articles.len(),
        };
        match serde_json::to_string_pretty(&entry) {
            Ok(json) => {
                if let Err(e) = tokio::fs::write(&path, json.as_bytes()).await {
                    warn!(path = %path.display(), error = %e, "failed to write cache entry");
                } else {
                    debug!(topic, endpoint, articles = articles.len(), "cached response");
                }
            }
            Err(e) => warn!(topic, endpoint, error = %e, "failed to serialize cache entry"),
        }
    }

    /// Summarize the cache directory.
    pub async fn stats(&self) -> CacheStats {
        let mut stats = CacheStats {
            total_files: 0,
            total_articles: 0,
            cache_size_mb: 0.0,
            oldest_cache: None,
            newest_cache: None,
            enabled: self.enabled,
        };
        if !self.enabled {
            return stats;
        }

        let mut total_bytes = 0u64;
        let mut oldest: Option<f64> = None;
        let mut newest: Option<f64> = None;

        for path in self.entry_files().await {
            let Ok(contents) = tokio::fs::read_to_string(&path).await else {
                continue;
            };
            let Ok(value) = serde_json::from_str::<serde_json::Value>(&contents) else {
                continue;
            };
            stats.total_files += 1;
            total_bytes += contents.len() as u64;
            if let Some(articles) = value.get("articles").and_then(|a| a.as_array()) {
                stats.total_articles += articles.len();
            }
            if let Some(ts) = value.get("timestamp").and_then(|t| t.as_f64()) {
                oldest = Some(oldest.map_or(ts, |o: f64| o.min(ts)));
                newest = Some(newest.map_or(ts, |n: f64| n.max(ts)));
            }
        }

        stats.cache_size_mb = (total_bytes as f64 / (1024.0 * 1024.0) * 100.0).round() / 100.0;
        stats.oldest_cache = oldest.map(format_timestamp);
        stats.newest_cache = newest.map(format_timestamp);
        stats
    }

    /// Remove every entry. Returns how many files were removed.
    pub async fn clear_all(&self) -> usize {
        let mut removed = 0;
        for path in self.entry_files().await {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => removed += 1,
                Err(e) => warn!(path = %path.display(), error = %e, "failed to remove cache entry"),
            }
        }
        info!(removed, "cleared response cache");
        removed
    }

    /// Remove entries past their TTL, plus any that cannot be read.
    /// Returns how many files were removed.
    pub async fn clear_expired(&self) -> usize {
        let now = epoch_secs();
        let mut removed = 0;
        for path in self.entry_files().await {
            let expired = match read_timestamp(&path).await {
                Some(ts) => now - ts > self.ttl_seconds,
                None => true,
            };
            if expired {
                match tokio::fs::remove_file(&path).await {
                    Ok(()) => removed += 1,
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "failed to remove cache entry")
                    }
                }
            }
        }
        info!(removed, "removed expired cache entries");
        removed
    }

    fn entry_path(&self, topic: &str, endpoint: &str, params: &HashMap<String, String>) -> PathBuf {
        let day = Local::now().format("%Y-%m-%d").to_string();
        let key = fingerprint(topic, endpoint, &day, params);
        self.dir.join(format!("{key}.json"))
    }

    async fn entry_files(&self) -> Vec<PathBuf> {
        let mut files = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(dir = %self.dir.display(), error = %e, "failed to scan cache directory");
                return files;
            }
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                files.push(path);
            }
        }
        files
    }
}

/// Fingerprint of a request identity: sorted-key JSON of topic, endpoint,
/// calendar day, and the non-excluded parameters, hashed with SHA-256.
fn fingerprint(
    topic: &str,
    endpoint: &str,
    day: &str,
    params: &HashMap<String, String>,
) -> String {
    let mut identity = serde_json::Map::new();
    identity.insert("topic".into(), topic.into());
    identity.insert("endpoint".into(), endpoint.into());
    identity.insert("date".into(), day.into());
    for (k, v) in params {
        if !EXCLUDED_PARAMS.contains(&k.as_str()) {
            identity.insert(k.clone(), v.clone().into());
        }
    }

    // serde_json maps iterate in sorted key order, so this serialization
    // is canonical for a given identity.
    let canonical = serde_json::Value::Object(identity).to_string();
    let digest = Sha256::digest(canonical.as_bytes());
    let mut hex = String::with_capacity(digest.len() * 2);
    for byte in digest {
        let _ = write!(hex, "{byte:02x}");
    }
    hex
}

async fn read_entry<T: DeserializeOwned>(path: &Path) -> common::Result<CacheEntry<T>> {
    let contents = tokio::fs::read_to_string(path).await?;
    Ok(serde_json::from_str(&contents)?)
}

async fn read_timestamp(path: &Path) -> Option<f64> {
    let contents = tokio::fs::read_to_string(path).await.ok()?;
    let value: serde_json::Value = serde_json::from_str(&contents).ok()?;
    value.get("timestamp")?.as_f64()
}

async fn remove_quietly(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        warn!(path = %path.display(), error = %e, "failed to remove cache entry");
    }
}

fn epoch_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

fn format_timestamp(ts: f64) -> String {
    chrono::DateTime::from_timestamp(ts as i64, 0)
        .map(|dt| dt.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| format!("{ts}"))
}
