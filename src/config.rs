//! # Configuration Module
//!
//! Loads the pipeline configuration from a JSON file, with API keys optionally
//! overridden from the environment (or a `.env` file).
//!
//! The resulting [`Config`] is built once at startup and handed by reference to
//! every client constructor. Nothing mutates it after `load` returns.

use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

// =============================================================================
// ERRORS
// =============================================================================
/// Everything that can go wrong before the pipeline starts.
///
/// All of these are fatal: `main` reports them and exits non-zero.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("configuration file not found at {}", .0.display())]
    NotFound(PathBuf),

    #[error("invalid JSON in {}: {source}", path.display())]
    InvalidJson {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

// =============================================================================
// KEYWORD JOIN MODE
// =============================================================================
/// How keywords are combined into a ScienceDirect query string.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum KeywordJoin {
    /// `"kw1" AND "kw2"` - every keyword must match
    #[default]
    And,
    /// `kw1 , kw2` - loose match on any keyword
    Comma,
}

// =============================================================================
// CONFIGURATION STRUCT
// =============================================================================
/// Main configuration for the pipeline.
///
/// Field names match the keys of `config.json`. The four credentials / ids
/// are required; everything else has a default.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Bearer token for the RAGFlow HTTP API
    pub ragflow_api_key: String,

    /// RAGFlow server root, e.g. `http://localhost:9380`
    pub ragflow_base_url: String,

    /// Id of the RAGFlow agent that turns a question into keywords
    pub keyword_agent_id: String,

    /// Elsevier API key (sent as `X-ELS-APIKey`)
    pub elsevier_api_key: String,

    #[serde(default = "default_elsevier_base_url")]
    pub elsevier_base_url: String,

    /// Where downloaded full texts are cached
    #[serde(default = "default_download_directory")]
    pub download_directory: PathBuf,

    /// Upper bound on search results kept (and therefore on downloads)
    #[serde(default = "default_max_papers")]
    pub max_papers_to_download: usize,

    /// `user_id` attached to new agent sessions
    #[serde(default = "default_session_user_id")]
    pub session_user_id: String,

    /// Longest silence tolerated between reads on an agent connection
    #[serde(default = "default_stream_timeout_secs")]
    pub stream_timeout_secs: u64,

    /// Pause after each full-text fetch
    #[serde(default = "default_download_delay_ms")]
    pub download_delay_ms: u64,

    /// Interval between parse-status polls
    #[serde(default = "default_parse_poll_interval_secs")]
    pub parse_poll_interval_secs: u64,

    /// Give up waiting for parsing after this many polls
    #[serde(default = "default_parse_max_polls")]
    pub parse_max_polls: u32,

    #[serde(default)]
    pub keyword_join: KeywordJoin,
}

fn default_elsevier_base_url() -> String {
    "https://api.elsevier.com".to_string()
}

fn default_download_directory() -> PathBuf {
    PathBuf::from("./downloads")
}

fn default_max_papers() -> usize {
    5
}

fn default_session_user_id() -> String {
    "research_assistant_user".to_string()
}

fn default_stream_timeout_secs() -> u64 {
    60
}

fn default_download_delay_ms() -> u64 {
    1000
}

fn default_parse_poll_interval_secs() -> u64 {
    10
}

fn default_parse_max_polls() -> u32 {
    60
}

// =============================================================================
// CONFIGURATION LOADING
// =============================================================================
impl Config {
    /// Load configuration from a JSON file, then apply environment overrides.
    ///
    /// A `.env` file is loaded first if present (silently ignored otherwise),
    /// so `RAGFLOW_API_KEY` / `ELSEVIER_API_KEY` can live outside the JSON.
    ///
    /// # Example
    /// ```ignore
    /// let config = Config::load("config.json")?;
    /// config.validate()?;
    /// ```
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        let _ = dotenvy::dotenv();

        let raw = std::fs::read_to_string(path).map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                ConfigError::NotFound(path.to_path_buf())
            } else {
                ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                }
            }
        })?;

        let mut config = Self::from_json(&raw).map_err(|source| ConfigError::InvalidJson {
            path: path.to_path_buf(),
            source,
        })?;
        config.apply_env_overrides();

        info!("Configuration loaded");
        Ok(config)
    }

    /// Parse a configuration document without touching the environment.
    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(val) = env::var("RAGFLOW_API_KEY") {
            self.ragflow_api_key = val;
        }

        if let Ok(val) = env::var("ELSEVIER_API_KEY") {
            self.elsevier_api_key = val;
        }
    }

    /// Validate the configuration.
    ///
    /// Fail fast here instead of with a confusing 401 three stages later.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let required = [
            ("ragflow_api_key", &self.ragflow_api_key),
            ("ragflow_base_url", &self.ragflow_base_url),
            ("keyword_agent_id", &self.keyword_agent_id),
            ("elsevier_api_key", &self.elsevier_api_key),
            ("elsevier_base_url", &self.elsevier_base_url),
        ];
        for (key, value) in required {
            if value.trim().is_empty() {
                return Err(ConfigError::Invalid(format!("{} cannot be empty", key)));
            }
        }

        if self.max_papers_to_download == 0 {
            return Err(ConfigError::Invalid(
                "max_papers_to_download must be at least 1".to_string(),
            ));
        }

        if self.parse_max_polls == 0 {
            return Err(ConfigError::Invalid(
                "parse_max_polls must be at least 1".to_string(),
            ));
        }

        Ok(())
    }

    /// Create the download directory if it does not exist yet.
    pub fn prepare_download_dir(&self) -> Result<(), ConfigError> {
        std::fs::create_dir_all(&self.download_directory).map_err(|source| ConfigError::Io {
            path: self.download_directory.clone(),
            source,
        })
    }

    /// RAGFlow base URL without a trailing slash.
    pub fn ragflow_root(&self) -> &str {
        self.ragflow_base_url.trim_end_matches('/')
    }

    /// Elsevier base URL without a trailing slash.
    pub fn elsevier_root(&self) -> &str {
        self.elsevier_base_url.trim_end_matches('/')
    }
}

// =============================================================================
// UNIT TESTS
// =============================================================================
#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const MINIMAL: &str = r#"{
        "ragflow_api_key": "rf-key",
        "ragflow_base_url": "http://localhost:9380/",
        "keyword_agent_id": "agent-1",
        "elsevier_api_key": "els-key"
    }"#;

    /// A config pointing both services at `base_url` with no pacing delays.
    pub(crate) fn config_for(base_url: &str, download_dir: &Path) -> Config {
        let mut config = Config::from_json(MINIMAL).unwrap();
        config.ragflow_base_url = base_url.to_string();
        config.elsevier_base_url = base_url.to_string();
        config.download_directory = download_dir.to_path_buf();
        config.download_delay_ms = 0;
        config.parse_poll_interval_secs = 0;
        config.parse_max_polls = 3;
        config
    }

    #[test]
    fn test_defaults_applied() {
        let config = Config::from_json(MINIMAL).unwrap();

        assert_eq!(config.download_directory, PathBuf::from("./downloads"));
        assert_eq!(config.max_papers_to_download, 5);
        assert_eq!(config.stream_timeout_secs, 60);
        assert_eq!(config.download_delay_ms, 1000);
        assert_eq!(config.parse_poll_interval_secs, 10);
        assert_eq!(config.keyword_join, KeywordJoin::And);
        assert_eq!(config.elsevier_root(), "https://api.elsevier.com");
    }

    #[test]
    fn test_trailing_slash_trimmed() {
        let config = Config::from_json(MINIMAL).unwrap();
        assert_eq!(config.ragflow_root(), "http://localhost:9380");
    }

    #[test]
    fn test_missing_required_key() {
        let result = Config::from_json(r#"{"ragflow_api_key": "x"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_keyword_join_parsing() {
        let raw = MINIMAL.replace(
            "\"elsevier_api_key\": \"els-key\"",
            "\"elsevier_api_key\": \"els-key\", \"keyword_join\": \"comma\"",
        );
        let config = Config::from_json(&raw).unwrap();
        assert_eq!(config.keyword_join, KeywordJoin::Comma);
    }

    #[test]
    fn test_validation_valid() {
        let config = Config::from_json(MINIMAL).unwrap();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_empty_key() {
        let mut config = Config::from_json(MINIMAL).unwrap();
        config.keyword_agent_id = "  ".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("keyword_agent_id"));
    }

    #[test]
    fn test_validation_zero_papers() {
        let mut config = Config::from_json(MINIMAL).unwrap();
        config.max_papers_to_download = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = Config::load(dir.path().join("nope.json")).unwrap_err();
        assert!(matches!(err, ConfigError::NotFound(_)));
    }

    #[test]
    fn test_load_invalid_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();

        let err = Config::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidJson { .. }));
    }

    #[test]
    fn test_prepare_download_dir() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::from_json(MINIMAL).unwrap();
        config.download_directory = dir.path().join("nested").join("downloads");

        config.prepare_download_dir().unwrap();
        assert!(config.download_directory.is_dir());
    }
}
