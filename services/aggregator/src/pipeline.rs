//! One aggregation cycle
//!
//! rotation → budget allocation → governed per-topic discovery →
//! summarization → publisher hand-off. A failed topic is skipped, not
//! fatal to the cycle, and is left unmarked in the rotation so the next
//! cycle picks it up again. A shutdown signal stops admission of new
//! topics; in-flight backoff waits are interrupted by the same signal
//! through the retry layer.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use futures::StreamExt;
use governance::{
    CredentialPool, FetchOutcome, Governor, Retrier, TopicRotation, allocate,
};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::discovery::{
    Article, DiscoveryClient, Endpoint, category_for, everything_params, headlines_params,
};
use crate::summarize::SummaryClient;

/// Articles included in a summarization prompt, newest first.
const MAX_PROMPT_ARTICLES: usize = 25;

/// Per-topic result handed to the publisher.
#[derive(Debug, Serialize)]
pub struct TopicDigest {
    pub topic: String,
    pub generated_at: String,
    pub article_count: usize,
    pub articles: Vec<Article>,
    pub summary: Option<String>,
}

/// Collaborator boundary for the document store.
pub trait Publish {
    async fn publish(&self, digest: &TopicDigest) -> std::io::Result<PathBuf>;
}

/// Writes one JSON file per topic under `dir/<date>/<topic>.json`.
pub struct LocalJsonPublisher {
    dir: PathBuf,
}

impl LocalJsonPublisher {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }
}

impl Publish for LocalJsonPublisher {
    async fn publish(&self, digest: &TopicDigest) -> std::io::Result<PathBuf> {
        let day_dir = self.dir.join(Local::now().format("%Y-%m-%d").to_string());
        tokio::fs::create_dir_all(&day_dir).await?;
        let path = day_dir.join(format!("{}.json", digest.topic));
        let json = serde_json::to_string_pretty(digest).map_err(std::io::Error::other)?;
        tokio::fs::write(&path, json).await?;
        Ok(path)
    }
}

/// What one cycle did.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub scheduled: usize,
    pub completed: usize,
    pub refused: usize,
    pub failed: usize,
    pub articles: usize,
}

enum TopicResult {
    Done { articles: usize },
    Refused { reason: String },
}

/// The aggregation pipeline for one configured provider pair.
pub struct Pipeline<P> {
    config: Config,
    governor: Governor,
    rotation: TopicRotation,
    discovery: DiscoveryClient,
    summarizer: Option<(SummaryClient, Retrier)>,
    publisher: P,
    shutdown: watch::Receiver<bool>,
}

impl<P: Publish> Pipeline<P> {
    pub async fn new(
        config: Config,
        publisher: P,
        shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<Self> {
        let governor = Governor::with_shutdown(
            config.discovery_governor(),
            config.discovery.keys.clone(),
            shutdown.clone(),
        )
        .await?;
        let rotation = TopicRotation::load(config.rotation_path()).await?;
        let discovery = DiscoveryClient::new(
            config.discovery.base_url.clone(),
            Duration::from_secs(config.discovery.timeout_secs),
        );
        let summarizer = if config.summary.enabled {
            let pool = Arc::new(CredentialPool::new(config.summary.keys.clone())?);
            let retrier = Retrier::with_shutdown(config.retry_policy(), pool, shutdown.clone());
            let client = SummaryClient::new(
                config.summary.base_url.clone(),
                config.summary.model.clone(),
                Duration::from_secs(config.summary.timeout_secs),
            );
            Some((client, retrier))
        } else {
            None
        };

        Ok(Self {
            config,
            governor,
            rotation,
            discovery,
            summarizer,
            publisher,
            shutdown,
        })
    }

    pub fn governor(&self) -> &Governor {
        &self.governor
    }

    /// Run one aggregation cycle and report what happened.
    pub async fn run_cycle(&self) -> CycleReport {
        let status = self.governor.quota_status().await;
        let due = self
            .rotation
            .next_batch(
                &self.config.topics.available,
                self.config.topics.max_per_cycle,
                Duration::from_secs(self.config.topics.rotation_cooldown_seconds),
            )
            .await;
        let scheduled = allocate(
            &due,
            &self.config.topics.priority_topics,
            status.remaining,
            self.config.topics.cost_per_topic,
            self.config.topics.max_per_cycle,
        );
        info!(
            due = due.len(),
            scheduled = scheduled.len(),
            remaining_budget = status.remaining,
            "cycle planned"
        );

        let mut report = CycleReport {
            scheduled: scheduled.len(),
            ..Default::default()
        };
        let mut done: Vec<String> = Vec::new();

        let stream = futures::stream::iter(scheduled)
            .take_while(|_| futures::future::ready(!*self.shutdown.borrow()))
            .map(|topic| async move {
                let result = self.process_topic(&topic).await;
                (topic, result)
            })
            .buffer_unordered(self.config.pipeline.max_concurrent_fetches);
        futures::pin_mut!(stream);

        while let Some((topic, result)) = stream.next().await {
            match result {
                Ok(TopicResult::Done { articles }) => {
                    report.completed += 1;
                    report.articles += articles;
                    done.push(topic);
                }
                Ok(TopicResult::Refused { reason }) => {
                    report.refused += 1;
                    warn!(topic = %topic, reason = %reason, "topic refused by quota");
                }
                Err(e) => {
                    report.failed += 1;
                    error!(topic = %topic, error = %e, "topic failed, skipping");
                }
            }
        }

        if !done.is_empty() {
            self.rotation.mark_processed(&done).await;
        }
        info!(
            completed = report.completed,
            refused = report.refused,
            failed = report.failed,
            articles = report.articles,
            "cycle complete"
        );
        report
    }

    async fn process_topic(&self, topic: &str) -> anyhow::Result<TopicResult> {
        // Category topics use curated headlines; the rest are keyword searches.
        let (endpoint, params) = match category_for(topic) {
            Some(category) => (
                Endpoint::Headlines,
                headlines_params(
                    &self.config.discovery.country,
                    category,
                    self.config.discovery.page_size,
                ),
            ),
            None => (
                Endpoint::Everything,
                everything_params(topic, self.config.discovery.page_size),
            ),
        };
        let outcome = self
            .governor
            .governed_call(topic, endpoint.as_str(), &params, |cred| {
                let client = &self.discovery;
                let params = &params;
                async move { client.fetch(endpoint, params, &cred.key).await }
            })
            .await?;

        let articles = match outcome {
            FetchOutcome::Fresh(articles) | FetchOutcome::Cached(articles) => articles,
            FetchOutcome::Refused { reason } => return Ok(TopicResult::Refused { reason }),
        };
        if articles.is_empty() {
            info!(topic, "no articles discovered");
            return Ok(TopicResult::Done { articles: 0 });
        }

        let summary = match &self.summarizer {
            Some((client, retrier)) => {
                let prompt = build_prompt(&self.config.summary.prompt, topic, &articles);
                match retrier
                    .run(|cred| {
                        let prompt = &prompt;
                        async move { client.summarize(prompt, &cred.key).await }
                    })
                    .await
                {
                    Ok(text) => Some(text),
                    Err(e) => {
                        warn!(topic, error = %e, "summarization failed, publishing without summary");
                        None
                    }
                }
            }
            None => None,
        };

        let digest = TopicDigest {
            topic: topic.to_owned(),
            generated_at: Local::now().to_rfc3339(),
            article_count: articles.len(),
            articles,
            summary,
        };
        let path = self.publisher.publish(&digest).await?;
        info!(
            topic,
            articles = digest.article_count,
            path = %path.display(),
            "topic published"
        );
        Ok(TopicResult::Done {
            articles: digest.article_count,
        })
    }
}

fn build_prompt(template: &str, topic: &str, articles: &[Article]) -> String {
    let mut text = template.replace("{topic}", topic);
    text.push('\n');
    for article in articles.iter().take(MAX_PROMPT_ARTICLES) {
        text.push_str(&format!("\n- {} ({})", article.title, article.source));
        if !article.description.is_empty() {
            text.push_str(&format!("\n  {}", article.description));
        }
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::ApiKey;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn article(url: &str, title: &str) -> Article {
        Article {
            url: url.into(),
            title: title.into(),
            description: String::new(),
            source: "Example".into(),
            author: None,
            published_at: None,
            image_url: None,
            content: None,
        }
    }

    #[test]
    fn prompt_replaces_topic_and_lists_articles() {
        let articles = vec![article("https://a", "First story"), article("https://b", "Second")];
        let prompt = build_prompt("Summarize {topic} news.", "nba", &articles);
        assert!(prompt.starts_with("Summarize nba news.\n"));
        assert!(prompt.contains("- First story (Example)"));
        assert!(prompt.contains("- Second (Example)"));
    }

    #[test]
    fn prompt_caps_article_count() {
        let articles: Vec<Article> = (0..100)
            .map(|i| article(&format!("https://a/{i}"), &format!("story {i}")))
            .collect();
        let prompt = build_prompt("{topic}", "nba", &articles);
        assert!(prompt.contains("story 24"));
        assert!(!prompt.contains("story 25"));
    }

    /// Mock server answering every connection with the same response.
    async fn serve_all(response: String) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let response = response.clone();
                tokio::spawn(async move {
                    let mut buf = [0u8; 8192];
                    let _ = socket.read(&mut buf).await;
                    let _ = socket.write_all(response.as_bytes()).await;
                    let _ = socket.shutdown().await;
                });
            }
        });
        format!("http://{addr}")
    }

    fn http_response(status_line: &str, body: &str) -> String {
        format!(
            "HTTP/1.1 {}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
            status_line,
            body.len(),
            body
        )
    }

    fn discovery_body() -> &'static str {
        r#"{"status":"ok","articles":[
            {"url":"https://example.com/1","title":"One","source":{"name":"Example"}},
            {"url":"https://example.com/2","title":"Two","source":{"name":"Example"}}
        ]}"#
    }

    fn summary_body() -> &'static str {
        r#"{"candidates":[{"content":{"parts":[{"text":"A fine summary."}]}}]}"#
    }

    fn test_config(
        dir: &tempfile::TempDir,
        discovery_url: String,
        summary_url: Option<String>,
    ) -> Config {
        let mut config = Config::default();
        config.state_dir = dir.path().join("state");
        config.output_dir = dir.path().join("out");
        config.discovery.base_url = discovery_url;
        config.discovery.keys = vec![ApiKey::new("disc-key-0001")];
        config.discovery.min_request_interval_seconds = 0.0;
        config.topics.available = vec!["nba".into(), "nhl".into()];
        config.topics.priority_topics = Vec::new();
        config.retry.base_retry_delay_seconds = 0.001;
        config.retry.max_retry_delay_seconds = 0.004;
        config.retry.default_rate_limit_cooldown_seconds = 0.001;
        match summary_url {
            Some(url) => {
                config.summary.base_url = url;
                config.summary.keys = vec![ApiKey::new("sum-key-0001")];
            }
            None => config.summary.enabled = false,
        }
        config
    }

    async fn build_pipeline(
        config: Config,
    ) -> (Pipeline<LocalJsonPublisher>, watch::Sender<bool>) {
        let (tx, rx) = watch::channel(false);
        let publisher = LocalJsonPublisher::new(config.output_dir.clone());
        let p = Pipeline::new(config, publisher, rx).await.unwrap();
        (p, tx)
    }

    async fn published_files(output_dir: &std::path::Path) -> Vec<PathBuf> {
        let mut files = Vec::new();
        let Ok(mut days) = tokio::fs::read_dir(output_dir).await else {
            return files;
        };
        while let Ok(Some(day)) = days.next_entry().await {
            let mut entries = tokio::fs::read_dir(day.path()).await.unwrap();
            while let Ok(Some(entry)) = entries.next_entry().await {
                files.push(entry.path());
            }
        }
        files.sort();
        files
    }

    #[tokio::test]
    async fn cycle_discovers_summarizes_publishes() {
        let dir = tempfile::tempdir().unwrap();
        let discovery_url = serve_all(http_response("200 OK", discovery_body())).await;
        let summary_url = serve_all(http_response("200 OK", summary_body())).await;
        let config = test_config(&dir, discovery_url, Some(summary_url));
        let output_dir = config.output_dir.clone();
        let (pipeline, _tx) = build_pipeline(config).await;

        let report = pipeline.run_cycle().await;
        assert_eq!(report.scheduled, 2);
        assert_eq!(report.completed, 2);
        assert_eq!(report.refused, 0);
        assert_eq!(report.failed, 0);
        assert_eq!(report.articles, 4);

        let files = published_files(&output_dir).await;
        assert_eq!(files.len(), 2);
        let digest: serde_json::Value =
            serde_json::from_str(&tokio::fs::read_to_string(&files[0]).await.unwrap()).unwrap();
        assert_eq!(digest["article_count"], 2);
        assert_eq!(digest["summary"], "A fine summary.");
        assert_eq!(digest["articles"][0]["url"], "https://example.com/1");

        assert_eq!(pipeline.governor().quota_status().await.requests_made, 2);
    }

    #[tokio::test]
    async fn category_topic_goes_through_headlines_endpoint() {
        let dir = tempfile::tempdir().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let response = http_response("200 OK", discovery_body());
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 8192];
            let n = socket.read(&mut buf).await.unwrap();
            let _ = socket.write_all(response.as_bytes()).await;
            let _ = socket.shutdown().await;
            String::from_utf8_lossy(&buf[..n]).into_owned()
        });

        let mut config = test_config(&dir, format!("http://{addr}"), None);
        config.topics.available = vec!["sports".into()];
        let (pipeline, _tx) = build_pipeline(config).await;

        let report = pipeline.run_cycle().await;
        assert_eq!(report.completed, 1);

        let request = server.await.unwrap();
        assert!(request.starts_with("GET /top-headlines?"), "got: {request}");
        assert!(request.contains("category=sports"));
        assert!(request.contains("country=us"));
    }

    #[tokio::test]
    async fn completed_topics_rest_until_cooldown_lapses() {
        let dir = tempfile::tempdir().unwrap();
        let discovery_url = serve_all(http_response("200 OK", discovery_body())).await;
        let config = test_config(&dir, discovery_url, None);
        let (pipeline, _tx) = build_pipeline(config).await;

        let first = pipeline.run_cycle().await;
        assert_eq!(first.completed, 2);

        // Both topics were just marked processed, so nothing is due.
        let second = pipeline.run_cycle().await;
        assert_eq!(second.scheduled, 0);
        assert_eq!(second.completed, 0);
    }

    #[tokio::test]
    async fn failed_topics_are_skipped_and_retried_next_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let discovery_url =
            serve_all(http_response("404 Not Found", r#"{"status":"error","message":"gone"}"#))
                .await;
        let config = test_config(&dir, discovery_url, None);
        let output_dir = config.output_dir.clone();
        let (pipeline, _tx) = build_pipeline(config).await;

        let report = pipeline.run_cycle().await;
        assert_eq!(report.scheduled, 2);
        assert_eq!(report.failed, 2);
        assert_eq!(report.completed, 0);
        assert!(published_files(&output_dir).await.is_empty());

        // Failures are not marked processed; the next cycle tries again.
        let second = pipeline.run_cycle().await;
        assert_eq!(second.scheduled, 2);
    }

    #[tokio::test]
    async fn summarization_failure_still_publishes() {
        let dir = tempfile::tempdir().unwrap();
        let discovery_url = serve_all(http_response("200 OK", discovery_body())).await;
        let summary_url =
            serve_all(http_response("404 Not Found", r#"{"error":{"message":"no such model"}}"#))
                .await;
        let config = test_config(&dir, discovery_url, Some(summary_url));
        let output_dir = config.output_dir.clone();
        let (pipeline, _tx) = build_pipeline(config).await;

        let report = pipeline.run_cycle().await;
        assert_eq!(report.completed, 2);

        let files = published_files(&output_dir).await;
        let digest: serde_json::Value =
            serde_json::from_str(&tokio::fs::read_to_string(&files[0]).await.unwrap()).unwrap();
        assert!(digest["summary"].is_null());
    }

    #[tokio::test]
    async fn shutdown_stops_admission_of_new_topics() {
        let dir = tempfile::tempdir().unwrap();
        let discovery_url = serve_all(http_response("200 OK", discovery_body())).await;
        let config = test_config(&dir, discovery_url, None);
        let (pipeline, tx) = build_pipeline(config).await;

        tx.send(true).unwrap();
        let report = pipeline.run_cycle().await;
        assert_eq!(report.completed + report.failed + report.refused, 0);
    }
}
