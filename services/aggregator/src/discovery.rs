//! Article-discovery API client
//!
//! Thin reqwest wrapper over the discovery provider's two endpoints.
//! Raw responses are normalized into `Article` records (entries without
//! a URL are dropped) and failures map onto `CallError` so the retry
//! loop can classify them.

use std::collections::HashMap;
use std::time::Duration;

use common::ApiKey;
use governance::CallError;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Discovery endpoint. `as_str` is the cache identity string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    Headlines,
    Everything,
}

impl Endpoint {
    pub fn as_str(self) -> &'static str {
        match self {
            Endpoint::Headlines => "headlines",
            Endpoint::Everything => "everything",
        }
    }

    fn path(self) -> &'static str {
        match self {
            Endpoint::Headlines => "top-headlines",
            Endpoint::Everything => "everything",
        }
    }
}

/// Normalized article record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Article {
    pub url: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub source: String,
    pub author: Option<String>,
    pub published_at: Option<String>,
    pub image_url: Option<String>,
    pub content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawResponse {
    status: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    articles: Vec<RawArticle>,
}

#[derive(Debug, Deserialize)]
struct RawArticle {
    url: Option<String>,
    title: Option<String>,
    description: Option<String>,
    source: Option<RawSource>,
    author: Option<String>,
    #[serde(rename = "publishedAt")]
    published_at: Option<String>,
    #[serde(rename = "urlToImage")]
    url_to_image: Option<String>,
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawSource {
    name: Option<String>,
}

pub struct DiscoveryClient {
    http: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl DiscoveryClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            timeout,
        }
    }

    /// Place one discovery call with the given credential.
    ///
    /// `params` holds the endpoint's query parameters; the key travels in
    /// the `X-Api-Key` header and never appears in the URL.
    pub async fn fetch(
        &self,
        endpoint: Endpoint,
        params: &HashMap<String, String>,
        key: &ApiKey,
    ) -> Result<Vec<Article>, CallError> {
        let url = format!("{}/{}", self.base_url.trim_end_matches('/'), endpoint.path());
        debug!(endpoint = endpoint.as_str(), key = key.last4(), "discovery request");

        let response = self
            .http
            .get(&url)
            .timeout(self.timeout)
            .query(params)
            .header("X-Api-Key", key.expose())
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = response.status();
        let body = response.text().await.map_err(map_transport_error)?;
        if !status.is_success() {
            return Err(CallError::Status {
                status: status.as_u16(),
                message: body,
            });
        }
        parse_articles(&body)
    }
}

/// Provider category for topics that have one. Topics without a category
/// go through keyword search on the everything endpoint instead.
pub fn category_for(topic: &str) -> Option<&'static str> {
    match topic {
        "top-news" => Some("general"),
        "business" => Some("business"),
        "technology" => Some("technology"),
        "science" => Some("science"),
        "health" => Some("health"),
        "sports" => Some("sports"),
        "entertainment" => Some("entertainment"),
        _ => None,
    }
}

/// Query parameters for a category headlines request.
pub fn headlines_params(country: &str, category: &str, page_size: u32) -> HashMap<String, String> {
    HashMap::from([
        ("country".into(), country.into()),
        ("category".into(), category.into()),
        ("pageSize".into(), page_size.min(100).to_string()),
    ])
}

/// Query parameters for a keyword search, newest first.
pub fn everything_params(query: &str, page_size: u32) -> HashMap<String, String> {
    HashMap::from([
        ("q".into(), query.into()),
        ("language".into(), "en".into()),
        ("sortBy".into(), "publishedAt".into()),
        ("pageSize".into(), page_size.min(100).to_string()),
    ])
}

fn parse_articles(body: &str) -> Result<Vec<Article>, CallError> {
    let raw: RawResponse = serde_json::from_str(body).map_err(|e| CallError::Status {
        status: 502,
        message: format!("unparsable discovery response: {e}"),
    })?;
    if raw.status != "ok" {
        return Err(CallError::Status {
            status: 502,
            message: raw
                .message
                .unwrap_or_else(|| "provider reported an error".into()),
        });
    }
    Ok(raw.articles.into_iter().filter_map(normalize).collect())
}

fn normalize(raw: RawArticle) -> Option<Article> {
    let url = raw.url.filter(|u| !u.is_empty())?;
    let source = raw
        .source
        .and_then(|s| s.name)
        .filter(|n| !n.is_empty())
        .or_else(|| host_of(&url))
        .unwrap_or_default();
    Some(Article {
        title: raw.title.unwrap_or_else(|| "No Title".into()),
        description: raw.description.unwrap_or_default(),
        source,
        author: raw.author,
        published_at: raw.published_at,
        image_url: raw.url_to_image,
        content: raw.content,
        url,
    })
}

fn host_of(url: &str) -> Option<String> {
    let parsed = reqwest::Url::parse(url).ok()?;
    let host = parsed.host_str()?;
    Some(host.strip_prefix("www.").unwrap_or(host).to_owned())
}

fn map_transport_error(e: reqwest::Error) -> CallError {
    if e.is_timeout() {
        CallError::Timeout(e.to_string())
    } else {
        CallError::Connection(e.to_string())
    }
}
