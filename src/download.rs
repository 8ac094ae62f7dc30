//! # Download Module
//!
//! Saves the full text of each search hit as `<download_dir>/<sanitized DOI>.json`.
//!
//! The file on disk is the cache: a DOI whose file already exists is never
//! fetched again, so an interrupted run can simply be restarted.

use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{error, info, warn};

use crate::literature::{FullTextSource, SearchRecord};

/// Characters that are not safe in file names on every platform.
const UNSAFE_FILENAME_CHARS: [char; 9] = ['\\', '/', '*', '?', ':', '"', '<', '>', '|'];

/// Replace filesystem-unsafe characters in a DOI with `_`.
pub fn sanitize_doi(doi: &str) -> String {
    doi.replace(UNSAFE_FILENAME_CHARS, "_")
}

/// Cache path for a DOI inside `dir`.
pub fn cache_path(dir: &Path, doi: &str) -> PathBuf {
    dir.join(format!("{}.json", sanitize_doi(doi)))
}

pub struct Downloader<F> {
    source: F,
    dir: PathBuf,
    delay: Duration,
}

impl<F: FullTextSource> Downloader<F> {
    /// `delay` is slept after every fetch attempt to stay polite with the API.
    pub fn new(source: F, dir: impl Into<PathBuf>, delay: Duration) -> Self {
        Self {
            source,
            dir: dir.into(),
            delay,
        }
    }

    /// Download every record with a DOI, returning the paths now on disk.
    ///
    /// Failures are per record: they are logged and the record is skipped.
    pub async fn download(&self, records: &[SearchRecord]) -> Vec<PathBuf> {
        info!(
            count = records.len(),
            dir = %self.dir.display(),
            "Downloading articles"
        );

        let mut saved = Vec::new();
        for record in records {
            let Some(doi) = record.doi.as_deref() else {
                warn!(title = %record.display_title(), "No DOI for paper, skipping");
                continue;
            };

            let path = cache_path(&self.dir, doi);
            if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                info!(file = %path.display(), "Already downloaded, skipping");
                saved.push(path);
                continue;
            }

            match self.fetch_and_save(doi, &path).await {
                Ok(true) => {
                    info!(file = %path.display(), "Saved article");
                    saved.push(path);
                }
                Ok(false) => {
                    warn!(doi = %doi, "Failed to retrieve full text, may be access restricted");
                }
                Err(e) => {
                    error!(doi = %doi, error = %e, "Failed to download paper");
                }
            }

            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
        }

        saved
    }

    async fn fetch_and_save(&self, doi: &str, path: &Path) -> anyhow::Result<bool> {
        let Some(article) = self.source.fetch_full_text(doi).await? else {
            return Ok(false);
        };

        let bytes = serde_json::to_vec_pretty(&article)?;
        tokio::fs::write(path, bytes).await?;
        Ok(true)
    }
}

// =============================================================================
// UNIT TESTS
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Returns a tiny article for every DOI except those starting with "locked"
    /// and counts calls.
    #[derive(Default)]
    struct FakeSource {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl FullTextSource for FakeSource {
        async fn fetch_full_text(&self, doi: &str) -> anyhow::Result<Option<serde_json::Value>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if doi.starts_with("locked") {
                return Ok(None);
            }
            if doi.starts_with("broken") {
                anyhow::bail!("connection reset");
            }
            Ok(Some(serde_json::json!({"doi": doi})))
        }
    }

    fn record(doi: Option<&str>) -> SearchRecord {
        SearchRecord {
            title: Some("Paper".to_string()),
            doi: doi.map(String::from),
            ..Default::default()
        }
    }

    #[test]
    fn test_sanitize_doi() {
        assert_eq!(sanitize_doi("10.1016/j.x:1"), "10.1016_j.x_1");
        assert_eq!(sanitize_doi(r#"a\b*c?d"e<f>g|h"#), "a_b_c_d_e_f_g_h");
        assert_eq!(sanitize_doi("10.1000.plain"), "10.1000.plain");
    }

    #[tokio::test]
    async fn test_download_writes_files() {
        let dir = tempfile::tempdir().unwrap();
        let downloader = Downloader::new(FakeSource::default(), dir.path(), Duration::ZERO);

        let paths = downloader
            .download(&[record(Some("10.1/a")), record(None), record(Some("locked/1"))])
            .await;

        assert_eq!(paths, vec![dir.path().join("10.1_a.json")]);
        let saved: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&paths[0]).unwrap()).unwrap();
        assert_eq!(saved["doi"], "10.1/a");
        assert_eq!(downloader.source.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_existing_file_not_refetched() {
        let dir = tempfile::tempdir().unwrap();
        let existing = cache_path(dir.path(), "10.1/cached");
        std::fs::write(&existing, "{}").unwrap();

        let downloader = Downloader::new(FakeSource::default(), dir.path(), Duration::ZERO);
        let paths = downloader.download(&[record(Some("10.1/cached"))]).await;

        assert_eq!(paths, vec![existing.clone()]);
        assert_eq!(downloader.source.calls.load(Ordering::SeqCst), 0);
        assert_eq!(std::fs::read_to_string(existing).unwrap(), "{}");
    }

    #[tokio::test]
    async fn test_fetch_error_skips_record() {
        let dir = tempfile::tempdir().unwrap();
        let downloader = Downloader::new(FakeSource::default(), dir.path(), Duration::ZERO);

        let paths = downloader
            .download(&[record(Some("broken/1")), record(Some("10.1/ok"))])
            .await;

        assert_eq!(paths, vec![dir.path().join("10.1_ok.json")]);
    }
}
