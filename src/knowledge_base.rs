//! # Knowledge Base Module
//!
//! Syncs downloaded files into a RAGFlow dataset:
//! find or create the dataset, upload files it does not have yet, start
//! parsing for everything still unparsed, and wait for parsing to settle.
//!
//! Waiting is bounded by `parse_max_polls`; running out of polls is reported
//! as [`KnowledgeBaseError::ParseTimeout`].

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, RequestBuilder};
use serde::de::{DeserializeOwned, IgnoredAny};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::envelope::{self, ApiResult};

const CONNECT_TIMEOUT_SECS: u64 = 10;
const PAGE_SIZE: usize = 100;

// =============================================================================
// ERRORS
// =============================================================================
#[derive(Error, Debug)]
pub enum KnowledgeBaseError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("HTTP error ({0}): {1}")]
    Status(u16, String),

    #[error("RAGFlow error ({code}): {message}")]
    Api { code: i64, message: String },

    #[error("Unexpected RAGFlow response: {0}")]
    Malformed(String),

    #[error("Failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{pending} documents still parsing after {polls} polls")]
    ParseTimeout { pending: usize, polls: u32 },
}

// =============================================================================
// TYPES
// =============================================================================
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Dataset {
    pub id: String,
    pub name: String,
}

/// Parse state of a document, as reported in its `run` field.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "String")]
pub enum RunStatus {
    Unstart,
    Running,
    Cancel,
    Done,
    Fail,
    Other(String),
}

impl From<String> for RunStatus {
    fn from(value: String) -> Self {
        match value.as_str() {
            "UNSTART" => RunStatus::Unstart,
            "RUNNING" => RunStatus::Running,
            "CANCEL" => RunStatus::Cancel,
            "DONE" => RunStatus::Done,
            "FAIL" => RunStatus::Fail,
            _ => RunStatus::Other(value),
        }
    }
}

impl RunStatus {
    /// Parsing has finished one way or another.
    pub fn is_settled(&self) -> bool {
        matches!(self, RunStatus::Done | RunStatus::Fail | RunStatus::Cancel)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Document {
    pub id: String,
    pub name: String,
    pub run: RunStatus,
}

#[derive(Debug, Deserialize)]
struct DocumentPage {
    #[serde(default)]
    docs: Vec<Document>,
    #[serde(default)]
    total: Option<usize>,
}

#[derive(Debug, Serialize)]
struct CreateDatasetRequest<'a> {
    name: &'a str,
}

#[derive(Debug, Serialize)]
struct ParseRequest<'a> {
    document_ids: &'a [String],
}

/// What one sync did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub dataset: Option<Dataset>,
    /// File names uploaded in this run
    pub uploaded: Vec<String>,
    /// Documents this run parsed successfully
    pub parsed: Vec<String>,
    /// Documents whose parse ended in FAIL or CANCEL, or that vanished mid-parse
    pub failed: Vec<String>,
    /// Documents in the dataset after the sync
    pub total_documents: usize,
}

/// Destination for downloaded files.
#[async_trait]
pub trait KnowledgeBase: Send + Sync {
    async fn sync(&self, files: &[PathBuf], kb_name: &str) -> anyhow::Result<SyncReport>;
}

// =============================================================================
// RAGFLOW CLIENT
// =============================================================================
pub struct RagflowKnowledgeBase {
    client: Client,
    base_url: String,
    api_key: String,
    poll_interval: Duration,
    max_polls: u32,
}

impl RagflowKnowledgeBase {
    pub fn new(config: &Config) -> Result<Self, KnowledgeBaseError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            client,
            base_url: config.ragflow_root().to_string(),
            api_key: config.ragflow_api_key.clone(),
            poll_interval: Duration::from_secs(config.parse_poll_interval_secs),
            max_polls: config.parse_max_polls,
        })
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}/api/v1/{}", self.base_url, endpoint)
    }

    async fn call<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
    ) -> Result<T, KnowledgeBaseError> {
        let response = request.bearer_auth(&self.api_key).send().await?;
        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            return Err(match envelope::decode::<IgnoredAny>(&body) {
                ApiResult::Error { code, message } => KnowledgeBaseError::Api { code, message },
                _ => KnowledgeBaseError::Status(status.as_u16(), body),
            });
        }

        match envelope::decode(&body) {
            ApiResult::Success(data) => Ok(data),
            ApiResult::Error { code, message } => Err(KnowledgeBaseError::Api { code, message }),
            ApiResult::Malformed(reason) => Err(KnowledgeBaseError::Malformed(reason)),
        }
    }

    /// Look a dataset up by exact name.
    pub async fn find_dataset(&self, name: &str) -> Result<Option<Dataset>, KnowledgeBaseError> {
        let mut page = 1;
        loop {
            let datasets: Vec<Dataset> = self
                .call(self.client.get(self.url("datasets")).query(&[
                    ("page", page.to_string()),
                    ("page_size", PAGE_SIZE.to_string()),
                ]))
                .await?;

            let count = datasets.len();
            if let Some(found) = datasets.into_iter().find(|ds| ds.name == name) {
                return Ok(Some(found));
            }
            if count < PAGE_SIZE {
                return Ok(None);
            }
            page += 1;
        }
    }

    pub async fn create_dataset(&self, name: &str) -> Result<Dataset, KnowledgeBaseError> {
        self.call(
            self.client
                .post(self.url("datasets"))
                .json(&CreateDatasetRequest { name }),
        )
        .await
    }

    pub async fn get_or_create_dataset(&self, name: &str) -> Result<Dataset, KnowledgeBaseError> {
        info!(kb_name = %name, "Accessing knowledge base");

        if let Some(dataset) = self.find_dataset(name).await? {
            info!(dataset_id = %dataset.id, "Knowledge base already exists");
            return Ok(dataset);
        }

        info!("Knowledge base not found, creating it");
        let dataset = self.create_dataset(name).await?;
        info!(dataset_id = %dataset.id, "Created knowledge base");
        Ok(dataset)
    }

    /// Every document in the dataset, across all pages.
    pub async fn list_documents(&self, dataset_id: &str) -> Result<Vec<Document>, KnowledgeBaseError> {
        let endpoint = self.url(&format!("datasets/{}/documents", dataset_id));
        let mut documents = Vec::new();
        let mut page = 1;

        loop {
            let batch: DocumentPage = self
                .call(self.client.get(&endpoint).query(&[
                    ("page", page.to_string()),
                    ("page_size", PAGE_SIZE.to_string()),
                ]))
                .await?;

            let count = batch.docs.len();
            documents.extend(batch.docs);

            let reached_total = batch.total.is_some_and(|total| documents.len() >= total);
            if count < PAGE_SIZE || reached_total {
                return Ok(documents);
            }
            page += 1;
        }
    }

    /// Upload files in one multipart request. Returns the created documents.
    pub async fn upload_documents(
        &self,
        dataset_id: &str,
        files: &[PathBuf],
    ) -> Result<Vec<Document>, KnowledgeBaseError> {
        let mut form = Form::new();
        for file in files {
            let bytes = tokio::fs::read(file)
                .await
                .map_err(|source| KnowledgeBaseError::Io {
                    path: file.clone(),
                    source,
                })?;
            let name = display_name(file).unwrap_or_default().to_string();
            form = form.part("file", Part::bytes(bytes).file_name(name));
        }

        info!(count = files.len(), "Uploading documents");
        self.call(
            self.client
                .post(self.url(&format!("datasets/{}/documents", dataset_id)))
                .multipart(form),
        )
        .await
    }

    /// Start asynchronous parsing of the given documents.
    pub async fn parse_documents(
        &self,
        dataset_id: &str,
        document_ids: &[String],
    ) -> Result<(), KnowledgeBaseError> {
        let _: IgnoredAny = self
            .call(
                self.client
                    .post(self.url(&format!("datasets/{}/chunks", dataset_id)))
                    .json(&ParseRequest { document_ids }),
            )
            .await?;
        Ok(())
    }

    /// Poll until every document in `ids` is settled, or give up.
    async fn wait_for_parsing(
        &self,
        dataset_id: &str,
        ids: &HashSet<String>,
    ) -> Result<Vec<Document>, KnowledgeBaseError> {
        let mut pending = ids.len();

        for attempt in 1..=self.max_polls {
            tokio::time::sleep(self.poll_interval).await;

            let documents = self.list_documents(dataset_id).await?;
            pending = documents
                .iter()
                .filter(|doc| ids.contains(&doc.id) && !doc.run.is_settled())
                .count();

            if pending == 0 {
                return Ok(documents);
            }
            info!(
                attempt,
                pending,
                interval_secs = self.poll_interval.as_secs(),
                "Documents still parsing"
            );
        }

        Err(KnowledgeBaseError::ParseTimeout {
            pending,
            polls: self.max_polls,
        })
    }

    /// Upload new files into `kb_name`, parse, and wait.
    pub async fn sync_files(
        &self,
        files: &[PathBuf],
        kb_name: &str,
    ) -> Result<SyncReport, KnowledgeBaseError> {
        let dataset = self.get_or_create_dataset(kb_name).await?;
        let mut report = SyncReport::default();

        // Step 1: upload whatever the dataset does not have yet
        let existing: HashSet<String> = self
            .list_documents(&dataset.id)
            .await?
            .into_iter()
            .map(|doc| doc.name)
            .collect();

        let new_files: Vec<PathBuf> = files
            .iter()
            .filter(|file| match display_name(file) {
                Some(name) => !existing.contains(name),
                None => {
                    warn!(file = %file.display(), "Skipping file without a usable name");
                    false
                }
            })
            .cloned()
            .collect();

        if new_files.is_empty() {
            info!("No new documents to upload");
        } else {
            for file in &new_files {
                debug!(file = %file.display(), "Pending upload");
            }
            let uploaded = self.upload_documents(&dataset.id, &new_files).await?;
            report.uploaded = uploaded.into_iter().map(|doc| doc.name).collect();
            info!(count = report.uploaded.len(), "Upload complete");
        }

        // Step 2: find everything not parsed yet
        let documents = self.list_documents(&dataset.id).await?;
        info!(total = documents.len(), kb_name = %kb_name, "Documents in knowledge base");
        for doc in &documents {
            debug!(name = %doc.name, status = ?doc.run, "Document");
        }

        let unparsed: Vec<&Document> = documents
            .iter()
            .filter(|doc| doc.run == RunStatus::Unstart)
            .collect();

        if unparsed.is_empty() {
            info!("No documents are pending parsing");
            report.total_documents = documents.len();
            report.dataset = Some(dataset);
            return Ok(report);
        }

        // Step 3: parse and wait
        let ids: Vec<String> = unparsed.iter().map(|doc| doc.id.clone()).collect();
        info!(count = ids.len(), "Triggering asynchronous parsing");
        self.parse_documents(&dataset.id, &ids).await?;

        let id_set: HashSet<String> = ids.into_iter().collect();
        let settled = self.wait_for_parsing(&dataset.id, &id_set).await?;

        for tracked in &unparsed {
            match settled.iter().find(|doc| doc.id == tracked.id) {
                Some(doc) if doc.run == RunStatus::Done => report.parsed.push(doc.name.clone()),
                Some(doc) => {
                    warn!(name = %doc.name, status = ?doc.run, "Document did not parse");
                    report.failed.push(doc.name.clone());
                }
                None => {
                    warn!(name = %tracked.name, "Document vanished from the dataset while parsing");
                    report.failed.push(tracked.name.clone());
                }
            }
        }
        info!(
            parsed = report.parsed.len(),
            failed = report.failed.len(),
            "Parsing finished"
        );

        report.total_documents = settled.len();
        report.dataset = Some(dataset);
        Ok(report)
    }
}

#[async_trait]
impl KnowledgeBase for RagflowKnowledgeBase {
    async fn sync(&self, files: &[PathBuf], kb_name: &str) -> anyhow::Result<SyncReport> {
        Ok(self.sync_files(files, kb_name).await?)
    }
}

fn display_name(path: &Path) -> Option<&str> {
    path.file_name().and_then(|name| name.to_str())
}
