//! # Literature Module
//!
//! Elsevier client: ScienceDirect search plus full-text retrieval by DOI.
//!
//! Both endpoints authenticate with the `X-ELS-APIKey` header and are asked
//! for JSON via `Accept: application/json`.

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::{Deserialize, Deserializer, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{Config, KeywordJoin};

const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Top-level key wrapping an article in the retrieval API response.
const FULL_TEXT_KEY: &str = "full-text-retrieval-response";

// =============================================================================
// ERRORS
// =============================================================================
#[derive(Error, Debug)]
pub enum LiteratureError {
    #[error("No keywords provided for search")]
    NoKeywords,

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Unauthorized - check the Elsevier API key")]
    Unauthorized,

    #[error("Rate limited by Elsevier")]
    RateLimited,

    #[error("HTTP error ({0}): {1}")]
    Status(u16, String),

    #[error("Failed to parse response: {0}")]
    Parse(String),
}

// =============================================================================
// SEARCH RECORD
// =============================================================================
/// Metadata for one search hit.
///
/// Elsevier sometimes wraps scalar fields as `{"$": "..."}` or a one-element
/// list of those, so every field is read leniently.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchRecord {
    #[serde(rename = "dc:title", default, deserialize_with = "lenient_string")]
    pub title: Option<String>,

    #[serde(rename = "prism:doi", default, deserialize_with = "lenient_string")]
    pub doi: Option<String>,

    #[serde(
        rename = "prism:publicationName",
        default,
        deserialize_with = "lenient_string"
    )]
    pub publication_name: Option<String>,

    #[serde(rename = "prism:coverDate", default, deserialize_with = "lenient_string")]
    pub cover_date: Option<String>,

    /// First listed author
    #[serde(rename = "dc:creator", default, deserialize_with = "lenient_string")]
    pub creator: Option<String>,

    #[serde(rename = "pii", default, deserialize_with = "lenient_string")]
    pub pii: Option<String>,

    #[serde(rename = "prism:url", default, deserialize_with = "lenient_string")]
    pub url: Option<String>,
}

impl SearchRecord {
    /// Title for log lines.
    pub fn display_title(&self) -> &str {
        self.title.as_deref().unwrap_or("N/A")
    }
}

fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    fn flatten(value: serde_json::Value) -> Option<String> {
        match value {
            serde_json::Value::String(s) => Some(s),
            serde_json::Value::Number(n) => Some(n.to_string()),
            serde_json::Value::Object(mut map) => map.remove("$").and_then(flatten),
            serde_json::Value::Array(items) => items.into_iter().find_map(flatten),
            _ => None,
        }
    }

    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(flatten(value))
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(rename = "search-results")]
    results: SearchResults,
}

#[derive(Debug, Deserialize)]
struct SearchResults {
    #[serde(default)]
    entry: Vec<serde_json::Value>,
}

// =============================================================================
// TRAITS
// =============================================================================
/// Keyword search against a literature database.
#[async_trait]
pub trait PaperSearch: Send + Sync {
    async fn search(&self, keywords: &[String]) -> anyhow::Result<Vec<SearchRecord>>;
}

/// Full-text retrieval by DOI. `Ok(None)` means the article is not available.
#[async_trait]
pub trait FullTextSource: Send + Sync {
    async fn fetch_full_text(&self, doi: &str) -> anyhow::Result<Option<serde_json::Value>>;
}

/// Join keywords into a ScienceDirect query string.
pub fn build_query(keywords: &[String], join: KeywordJoin) -> String {
    match join {
        KeywordJoin::And => keywords
            .iter()
            .map(|kw| format!("\"{}\"", kw))
            .collect::<Vec<_>>()
            .join(" AND "),
        KeywordJoin::Comma => keywords.join(" , "),
    }
}

// =============================================================================
// ELSEVIER CLIENT
// =============================================================================
#[derive(Debug, Clone)]
pub struct ElsevierClient {
    client: Client,
    base_url: String,
    api_key: String,
    max_results: usize,
    join: KeywordJoin,
}

impl ElsevierClient {
    pub fn new(config: &Config) -> Result<Self, LiteratureError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            client,
            base_url: config.elsevier_root().to_string(),
            api_key: config.elsevier_api_key.clone(),
            max_results: config.max_papers_to_download,
            join: config.keyword_join,
        })
    }

    fn get(&self, endpoint: &str) -> RequestBuilder {
        self.client
            .get(format!("{}/{}", self.base_url, endpoint))
            .header("X-ELS-APIKey", &self.api_key)
            .header(reqwest::header::ACCEPT, "application/json")
    }

    /// Search ScienceDirect, keeping at most `max_papers_to_download` hits.
    pub async fn search_papers(
        &self,
        keywords: &[String],
    ) -> Result<Vec<SearchRecord>, LiteratureError> {
        if keywords.is_empty() {
            return Err(LiteratureError::NoKeywords);
        }

        let query = build_query(keywords, self.join);
        info!(query = %query, "Searching ScienceDirect");

        let count = self.max_results.to_string();
        let response = self
            .get("content/search/sciencedirect")
            .query(&[("query", query.as_str()), ("count", count.as_str())])
            .send()
            .await?;

        let response = check_status(response).await?;
        let body: SearchResponse = response
            .json()
            .await
            .map_err(|e| LiteratureError::Parse(e.to_string()))?;

        let records: Vec<SearchRecord> = body
            .results
            .entry
            .into_iter()
            // An empty result set comes back as a single {"error": ...} entry
            .filter(|entry| entry.get("error").is_none())
            .filter_map(|entry| match serde_json::from_value::<SearchRecord>(entry) {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!(error = %e, "Skipping unreadable search entry");
                    None
                }
            })
            .take(self.max_results)
            .collect();

        if records.is_empty() {
            warn!("ScienceDirect search returned no results");
        } else {
            info!(count = records.len(), "ScienceDirect search completed");
        }
        Ok(records)
    }

    /// Retrieve the full text of one article.
    ///
    /// 403 and 404 mean "not available to this key" and map to `Ok(None)`.
    pub async fn full_text(&self, doi: &str) -> Result<Option<serde_json::Value>, LiteratureError> {
        debug!(doi = %doi, "Fetching full text");

        let response = self
            .get(&format!("content/article/doi/{}", doi))
            .send()
            .await?;

        if matches!(
            response.status(),
            StatusCode::NOT_FOUND | StatusCode::FORBIDDEN
        ) {
            warn!(
                doi = %doi,
                status = response.status().as_u16(),
                "Full text not available, possibly due to access restrictions"
            );
            return Ok(None);
        }

        let response = check_status(response).await?;
        let mut body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| LiteratureError::Parse(e.to_string()))?;

        let article = match body.get_mut(FULL_TEXT_KEY).map(serde_json::Value::take) {
            Some(inner) => inner,
            None => body,
        };
        Ok(Some(article))
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, LiteratureError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let error_text = response.text().await.unwrap_or_default();
    match status.as_u16() {
        401 => Err(LiteratureError::Unauthorized),
        429 => Err(LiteratureError::RateLimited),
        code => Err(LiteratureError::Status(code, error_text)),
    }
}

#[async_trait]
impl PaperSearch for ElsevierClient {
    async fn search(&self, keywords: &[String]) -> anyhow::Result<Vec<SearchRecord>> {
        Ok(self.search_papers(keywords).await?)
    }
}

#[async_trait]
impl FullTextSource for ElsevierClient {
    async fn fetch_full_text(&self, doi: &str) -> anyhow::Result<Option<serde_json::Value>> {
        Ok(self.full_text(doi).await?)
    }
}

// =============================================================================
// UNIT TESTS
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn kws(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_build_query_and() {
        assert_eq!(
            build_query(&kws(&["llm", "code generation"]), KeywordJoin::And),
            "\"llm\" AND \"code generation\""
        );
    }

    #[test]
    fn test_build_query_comma() {
        assert_eq!(
            build_query(&kws(&["llm", "tokamak"]), KeywordJoin::Comma),
            "llm , tokamak"
        );
    }

    #[test]
    fn test_record_lenient_fields() {
        let record: SearchRecord = serde_json::from_value(serde_json::json!({
            "dc:title": "Plasma control",
            "prism:doi": "10.1016/j.fusengdes.2024.1",
            "prism:coverDate": [{"@_fa": "true", "$": "2024-01-01"}],
            "prism:publicationName": {"$": "Fusion Eng. Des."},
            "dc:creator": [{"$": "Doe, J."}],
            "openaccess": true
        }))
        .unwrap();

        assert_eq!(record.title.as_deref(), Some("Plasma control"));
        assert_eq!(record.doi.as_deref(), Some("10.1016/j.fusengdes.2024.1"));
        assert_eq!(record.cover_date.as_deref(), Some("2024-01-01"));
        assert_eq!(record.publication_name.as_deref(), Some("Fusion Eng. Des."));
        assert_eq!(record.creator.as_deref(), Some("Doe, J."));
        assert_eq!(record.pii, None);
    }

    #[test]
    fn test_display_title_fallback() {
        assert_eq!(SearchRecord::default().display_title(), "N/A");
    }
}
