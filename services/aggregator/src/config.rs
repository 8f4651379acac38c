//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! API keys never live in the TOML: each client section lists env var
//! names in rotation order (first is the default active credential) and
//! the keys are resolved from the environment at load time.

use std::path::{Path, PathBuf};
use std::time::Duration;

use common::ApiKey;
use governance::{GovernorConfig, RetryPolicy};
use serde::Deserialize;

/// Root configuration
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory for quota state, cache entries, and rotation state.
    pub state_dir: PathBuf,
    /// Directory the local publisher writes digests into.
    pub output_dir: PathBuf,
    pub discovery: DiscoveryConfig,
    pub summary: SummaryConfig,
    pub retry: RetryConfig,
    pub topics: TopicsConfig,
    pub pipeline: PipelineConfig,
}

/// Article-discovery API settings and its quota/cache knobs
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub base_url: String,
    pub daily_quota: u32,
    pub quota_safety_buffer: f64,
    pub cache_ttl_seconds: u64,
    pub cache_enabled: bool,
    pub min_request_interval_seconds: f64,
    pub timeout_secs: u64,
    /// Articles requested per call, capped by the provider at 100.
    pub page_size: u32,
    pub country: String,
    /// Env var names holding the keys, in rotation order.
    pub key_env_vars: Vec<String>,
    #[serde(skip)]
    pub keys: Vec<ApiKey>,
}

/// Summarization API settings; no quota or cache, retry only
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SummaryConfig {
    pub enabled: bool,
    pub base_url: String,
    pub model: String,
    /// Prompt prefix; `{topic}` is replaced with the topic name.
    pub prompt: String,
    pub timeout_secs: u64,
    pub key_env_vars: Vec<String>,
    #[serde(skip)]
    pub keys: Vec<ApiKey>,
}

/// Retry loop tuning, shared by both clients
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub base_retry_delay_seconds: f64,
    pub max_retries: u32,
    pub max_retry_delay_seconds: f64,
    pub default_rate_limit_cooldown_seconds: f64,
}

/// Topic universe, priorities, and rotation pacing
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct TopicsConfig {
    pub available: Vec<String>,
    pub priority_topics: Vec<String>,
    /// Hard ceiling on topics per cycle; unset means budget-limited only.
    pub max_per_cycle: Option<usize>,
    pub rotation_cooldown_seconds: u64,
    /// Upstream requests one topic fetch is expected to consume.
    pub cost_per_topic: u32,
}

/// Processing loop settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub max_concurrent_fetches: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from("state"),
            output_dir: PathBuf::from("output"),
            discovery: DiscoveryConfig::default(),
            summary: SummaryConfig::default(),
            retry: RetryConfig::default(),
            topics: TopicsConfig::default(),
            pipeline: PipelineConfig::default(),
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            base_url: "https://newsapi.org/v2".into(),
            daily_quota: 100,
            quota_safety_buffer: 0.9,
            cache_ttl_seconds: 3600,
            cache_enabled: true,
            min_request_interval_seconds: 1.0,
            timeout_secs: 30,
            page_size: 100,
            country: "us".into(),
            key_env_vars: vec!["NEWS_API_KEY".into(), "NEWS_API_KEY_2".into()],
            keys: Vec::new(),
        }
    }
}

impl Default for SummaryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: "https://generativelanguage.googleapis.com/v1beta".into(),
            model: "gemini-2.0-flash-lite".into(),
            prompt: "Summarize the most important {topic} stories from these articles \
                     in one concise, engaging paragraph."
                .into(),
            timeout_secs: 60,
            key_env_vars: vec!["SUMMARY_API_KEY".into(), "SUMMARY_API_KEY_2".into()],
            keys: Vec::new(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_retry_delay_seconds: 1.0,
            max_retries: 5,
            max_retry_delay_seconds: 120.0,
            default_rate_limit_cooldown_seconds: 60.0,
        }
    }
}

impl Default for TopicsConfig {
    fn default() -> Self {
        Self {
            available: [
                "top-news",
                "world",
                "business",
                "technology",
                "science",
                "health",
                "sports",
                "entertainment",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            priority_topics: vec!["top-news".into(), "sports".into()],
            max_per_cycle: None,
            rotation_cooldown_seconds: 7200,
            cost_per_topic: 1,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_fetches: 3,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file, validate it, then resolve API
    /// keys from the environment.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;

        config.validate()?;

        config.discovery.keys = keys_from_env(&config.discovery.key_env_vars);
        if config.discovery.keys.is_empty() {
            return Err(common::Error::Config(format!(
                "no discovery API keys found; set {}",
                config.discovery.key_env_vars.join(" or ")
            )));
        }

        config.summary.keys = keys_from_env(&config.summary.key_env_vars);
        if config.summary.enabled && config.summary.keys.is_empty() {
            return Err(common::Error::Config(format!(
                "summarization is enabled but no keys found; set {} or disable [summary]",
                config.summary.key_env_vars.join(" or ")
            )));
        }

        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        if self.discovery.daily_quota == 0 {
            return Err(common::Error::Config(
                "daily_quota must be greater than 0".into(),
            ));
        }
        let buffer = self.discovery.quota_safety_buffer;
        if !(buffer > 0.0 && buffer <= 1.0) {
            return Err(common::Error::Config(format!(
                "quota_safety_buffer must be in (0, 1], got: {buffer}"
            )));
        }
        if self.discovery.min_request_interval_seconds < 0.0 {
            return Err(common::Error::Config(
                "min_request_interval_seconds must not be negative".into(),
            ));
        }
        for (section, url) in [
            ("discovery", &self.discovery.base_url),
            ("summary", &self.summary.base_url),
        ] {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(common::Error::Config(format!(
                    "{section}.base_url must start with http:// or https://, got: {url}"
                )));
            }
        }
        for (section, timeout) in [
            ("discovery", self.discovery.timeout_secs),
            ("summary", self.summary.timeout_secs),
        ] {
            if timeout == 0 {
                return Err(common::Error::Config(format!(
                    "{section}.timeout_secs must be greater than 0"
                )));
            }
        }
        if self.retry.max_retries == 0 {
            return Err(common::Error::Config(
                "max_retries must be greater than 0".into(),
            ));
        }
        if self.retry.base_retry_delay_seconds <= 0.0 {
            return Err(common::Error::Config(
                "base_retry_delay_seconds must be greater than 0".into(),
            ));
        }
        if self.retry.max_retry_delay_seconds < self.retry.base_retry_delay_seconds {
            return Err(common::Error::Config(
                "max_retry_delay_seconds must not be below base_retry_delay_seconds".into(),
            ));
        }
        if self.topics.cost_per_topic == 0 {
            return Err(common::Error::Config(
                "cost_per_topic must be greater than 0".into(),
            ));
        }
        if self.pipeline.max_concurrent_fetches == 0 {
            return Err(common::Error::Config(
                "max_concurrent_fetches must be greater than 0".into(),
            ));
        }
        Ok(())
    }

    /// Resolve config file path from CLI arg or AGGREGATOR_CONFIG env var.
    pub fn resolve_path(cli_path: Option<&Path>) -> PathBuf {
        if let Some(p) = cli_path {
            return p.to_path_buf();
        }
        if let Ok(p) = std::env::var("AGGREGATOR_CONFIG") {
            return PathBuf::from(p);
        }
        PathBuf::from("aggregator.toml")
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_retries,
            base_delay: Duration::from_secs_f64(self.retry.base_retry_delay_seconds),
            max_delay: Duration::from_secs_f64(self.retry.max_retry_delay_seconds),
            rate_limit_cooldown: Duration::from_secs_f64(
                self.retry.default_rate_limit_cooldown_seconds,
            ),
        }
    }

    /// Governance settings for the discovery provider.
    pub fn discovery_governor(&self) -> GovernorConfig {
        GovernorConfig {
            quota_state_path: self.state_dir.join("quota_state.json"),
            cache_dir: self.state_dir.join("cache"),
            daily_quota: self.discovery.daily_quota,
            quota_safety_buffer: self.discovery.quota_safety_buffer,
            cache_ttl_seconds: self.discovery.cache_ttl_seconds,
            cache_enabled: self.discovery.cache_enabled,
            min_request_interval: Duration::from_secs_f64(
                self.discovery.min_request_interval_seconds,
            ),
            retry: self.retry_policy(),
        }
    }

    pub fn rotation_path(&self) -> PathBuf {
        self.state_dir.join("topic_rotation.json")
    }
}

fn keys_from_env(names: &[String]) -> Vec<ApiKey> {
    names
        .iter()
        .filter_map(|name| std::env::var(name).ok())
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
        .map(ApiKey::new)
        .collect()
}
