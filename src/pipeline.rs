//! # Pipeline Module
//!
//! Runs the four stages in order:
//! keywords -> search -> download -> knowledge-base sync.
//!
//! Each stage only starts when the previous one produced something. An empty
//! stage ends the run with a [`HaltReason`]; a failing stage returns an error.
//! Nothing is rolled back: downloaded files stay on disk and act as a cache
//! for the next run.

use anyhow::{Context, Result};
use std::fmt;
use std::path::PathBuf;
use tracing::{error, info, warn};

use crate::agent::KeywordSource;
use crate::download::Downloader;
use crate::knowledge_base::{KnowledgeBase, SyncReport};
use crate::literature::{FullTextSource, PaperSearch};

/// Longest prefix of the sanitized query kept in a knowledge-base name.
const KB_NAME_PREFIX_LEN: usize = 50;

/// Derive a knowledge-base name from a query.
///
/// Runs of non-word characters become `_`, the result is cut to 50
/// characters and suffixed with `_KB`.
pub fn knowledge_base_name(query: &str) -> String {
    let mut sanitized = String::with_capacity(query.len());
    let mut in_separator = false;
    for c in query.chars() {
        if c.is_alphanumeric() || c == '_' {
            sanitized.push(c);
            in_separator = false;
        } else if !in_separator {
            sanitized.push('_');
            in_separator = true;
        }
    }

    let prefix: String = sanitized.chars().take(KB_NAME_PREFIX_LEN).collect();
    format!("{}_KB", prefix)
}

/// Why a run stopped early without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HaltReason {
    NoKeywords,
    NoPapers,
    NoDownloads,
}

impl fmt::Display for HaltReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            HaltReason::NoKeywords => "could not extract keywords",
            HaltReason::NoPapers => "no papers found",
            HaltReason::NoDownloads => "no papers could be downloaded",
        };
        f.write_str(text)
    }
}

/// Result of a completed run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub kb_name: String,
    pub keywords: Vec<String>,
    pub downloaded: Vec<PathBuf>,
    pub sync: SyncReport,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Completed(RunSummary),
    Halted(HaltReason),
}

pub struct Pipeline<K, S, F, B> {
    keywords: K,
    search: S,
    downloader: Downloader<F>,
    knowledge_base: B,
}

impl<K, S, F, B> Pipeline<K, S, F, B>
where
    K: KeywordSource,
    S: PaperSearch,
    F: FullTextSource,
    B: KnowledgeBase,
{
    pub fn new(keywords: K, search: S, downloader: Downloader<F>, knowledge_base: B) -> Self {
        Self {
            keywords,
            search,
            downloader,
            knowledge_base,
        }
    }

    /// Run every stage for `query`, syncing into `kb_name`.
    pub async fn run(&self, query: &str, kb_name: &str) -> Result<Outcome> {
        info!(query = %query, kb_name = %kb_name, "Starting pipeline");

        // Stage 1: keywords
        let keywords = match self
            .keywords
            .keywords(query)
            .await
            .context("keyword extraction failed")?
        {
            Some(keywords) if !keywords.is_empty() => keywords,
            _ => return Ok(self.halt(HaltReason::NoKeywords)),
        };

        // Stage 2: search
        let records = self
            .search
            .search(&keywords)
            .await
            .context("literature search failed")?;
        if records.is_empty() {
            return Ok(self.halt(HaltReason::NoPapers));
        }

        // Stage 3: download
        let downloaded = self.downloader.download(&records).await;
        if downloaded.is_empty() {
            return Ok(self.halt(HaltReason::NoDownloads));
        }

        // Stage 4: knowledge base
        let sync = self
            .knowledge_base
            .sync(&downloaded, kb_name)
            .await
            .context("knowledge base sync failed")?;

        info!(kb_name = %kb_name, "Pipeline finished");
        Ok(Outcome::Completed(RunSummary {
            kb_name: kb_name.to_string(),
            keywords,
            downloaded,
            sync,
        }))
    }

    fn halt(&self, reason: HaltReason) -> Outcome {
        match reason {
            HaltReason::NoKeywords => error!(reason = %reason, "Pipeline halted"),
            _ => warn!(reason = %reason, "Pipeline halted"),
        }
        Outcome::Halted(reason)
    }
}
