//! Application configuration
//!
//! Loaded in layers: built-in defaults, then an optional `nimbus.toml`, then
//! `NIMBUS__*` environment overrides (double underscore separates nesting,
//! e.g. `NIMBUS__BACKEND__MODEL`). Secrets stay out of the file: API keys are
//! read from the environment variables named here.

use crate::error::Result;
use config::{Config, Environment, File};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Root configuration (top level of nimbus.toml)
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct NimbusConfig {
    pub storage: StorageSection,
    pub backend: BackendSection,
    pub embedding: EmbeddingSection,
    pub retrieval: RetrievalSection,
    pub dispatch: DispatchSection,
    pub shell: ShellSection,
    pub history: HistorySection,
}

/// [storage] section: database location and bounded-growth policy
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    /// Path to the SQLite database file; defaults to the platform data dir
    pub db_path: Option<PathBuf>,

    /// Per-category entry capacity before eviction kicks in
    pub capacity_per_category: usize,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            db_path: None,
            capacity_per_category: 2048,
        }
    }
}

impl StorageSection {
    /// Resolve the database path, falling back to the platform data dir
    pub fn resolved_db_path(&self) -> PathBuf {
        self.db_path.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("nimbus")
                .join("nimbus.db")
        })
    }
}

/// [backend] section: language-model endpoint
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackendSection {
    /// Messages endpoint base URL
    pub base_url: String,

    /// Model identifier sent with each request
    pub model: String,

    /// Environment variable holding the API key
    pub api_key_env: String,

    pub max_tokens: usize,
    pub temperature: f32,

    /// Per-call timeout; on expiry the turn resolves as failed, never hangs
    pub timeout_ms: u64,
}

impl Default for BackendSection {
    fn default() -> Self {
        Self {
            base_url: "https://api.anthropic.com/v1".to_string(),
            model: "claude-3-5-haiku-20241022".to_string(),
            api_key_env: "ANTHROPIC_API_KEY".to_string(),
            max_tokens: 1024,
            temperature: 0.7,
            timeout_ms: 60_000,
        }
    }
}

impl BackendSection {
    /// Read the API key from the configured environment variable
    pub fn api_key(&self) -> Option<String> {
        std::env::var(&self.api_key_env).ok().filter(|k| !k.is_empty())
    }
}

/// [embedding] section: embedding service selection
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EmbeddingSection {
    /// "remote" for the HTTP service, "hashed" for the offline embedder
    pub provider: String,

    pub base_url: String,
    pub model: String,
    pub api_key_env: String,

    /// Fixed vector dimensionality for the lifetime of the store
    pub dimensions: usize,

    /// Timeout after which retrieval degrades to lexical-only
    pub timeout_ms: u64,
}

impl Default for EmbeddingSection {
    fn default() -> Self {
        Self {
            provider: "hashed".to_string(),
            base_url: "https://api.voyageai.com/v1".to_string(),
            model: "voyage-3-lite".to_string(),
            api_key_env: "VOYAGE_API_KEY".to_string(),
            dimensions: 384,
            timeout_ms: 5_000,
        }
    }
}

/// [retrieval] section
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrievalSection {
    /// Context entries handed to the backend per turn (bounds prompt size)
    pub top_k: usize,
}

impl Default for RetrievalSection {
    fn default() -> Self {
        Self { top_k: 8 }
    }
}

/// [dispatch] section: retry/timeout policy for provider tool calls
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatchSection {
    /// Attempts including the first (idempotent + transient failures only)
    pub max_attempts: u32,

    pub base_delay_ms: u64,
    pub max_delay_ms: u64,

    /// Per-call timeout
    pub timeout_ms: u64,
}

impl Default for DispatchSection {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 250,
            max_delay_ms: 5_000,
            timeout_ms: 30_000,
        }
    }
}

/// [shell] section
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ShellSection {
    /// Command timeout in seconds
    pub timeout_secs: u64,
}

impl Default for ShellSection {
    fn default() -> Self {
        Self { timeout_secs: 30 }
    }
}

/// [history] section
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HistorySection {
    /// Path to the raw-input history file; defaults next to the database
    pub file: Option<PathBuf>,

    /// Entries kept in the index (oldest dropped beyond this)
    pub max_entries: usize,
}

impl Default for HistorySection {
    fn default() -> Self {
        Self {
            file: None,
            max_entries: 10_000,
        }
    }
}

impl HistorySection {
    pub fn resolved_file(&self, storage: &StorageSection) -> PathBuf {
        self.file.clone().unwrap_or_else(|| {
            storage
                .resolved_db_path()
                .with_file_name("history")
        })
    }
}

/// Load configuration from an optional file plus environment overrides
pub fn load_config(path: Option<&Path>) -> Result<NimbusConfig> {
    let mut builder = Config::builder();

    if let Some(p) = path {
        builder = builder.add_source(File::from(p));
    } else {
        builder = builder.add_source(File::with_name("nimbus").required(false));
    }

    let cfg = builder
        .add_source(Environment::with_prefix("NIMBUS").separator("__"))
        .build()?;

    Ok(cfg.try_deserialize()?)
}
