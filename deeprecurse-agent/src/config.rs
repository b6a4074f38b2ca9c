//! # Engine Configuration
//!
//! Defaults, then a TOML file, then `DEEPRECURSE_*` environment variables,
//! then CLI flags (applied by the caller). `validate` runs last.

use deeprecurse_vm::error::{self, Error, Result};
use deeprecurse_vm::{
    FileObjectStore, HttpObjectStore, InterpreterLimits, ObjectStore, PrefetchPolicy,
    ProviderConfig, RetryPolicy, SandboxKind, SegmentedConfig,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Model driving depth-0 executors
    pub model: String,
    /// Model for child executors and direct sub-calls
    pub sub_model: String,
    pub max_iterations: usize,
    pub max_depth: usize,
    /// Simultaneous resolutions per broker
    pub max_concurrent_subcalls: usize,
    /// How long a sandbox waits on one sub-request
    pub subcall_timeout_secs: u64,
    pub backend: BackendConfig,
    pub sandbox: SandboxConfig,
    pub context: ContextConfig,
    pub store: StoreConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            model: "gpt-5".to_string(),
            sub_model: "gpt-5-nano".to_string(),
            max_iterations: 10,
            max_depth: 3,
            max_concurrent_subcalls: 8,
            subcall_timeout_secs: 300,
            backend: BackendConfig::default(),
            sandbox: SandboxConfig::default(),
            context: ContextConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// OpenAI-compatible endpoint; absent means api.openai.com
    pub base_url: Option<String>,
    /// Environment variable holding the API key
    pub api_key_env: String,
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub call_timeout_secs: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            api_key_env: "OPENAI_API_KEY".to_string(),
            max_attempts: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 8000,
            call_timeout_secs: 120,
        }
    }
}

impl BackendConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
            attempt_timeout: Duration::from_secs(self.call_timeout_secs),
        }
    }

    /// Provider settings for `model`. A custom base URL works without a key.
    pub fn provider_config(&self, model: &str) -> Result<ProviderConfig> {
        let api_key = std::env::var(&self.api_key_env).ok().filter(|k| !k.is_empty());
        let config = match (&self.base_url, api_key) {
            (Some(url), Some(key)) => ProviderConfig::openai(key).with_base_url(url.clone()),
            (Some(url), None) => ProviderConfig::local(url.clone(), model),
            (None, Some(key)) => ProviderConfig::openai(key),
            (None, None) => {
                return Err(Error::config_invalid(format!(
                    "no API key: set {} or backend.base_url",
                    self.api_key_env
                )))
            }
        };
        Ok(config.with_model(model).with_timeout(self.call_timeout_secs))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    pub kind: SandboxKind,
    pub run_timeout_secs: u64,
    pub max_output_chars: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            kind: SandboxKind::InProcess,
            run_timeout_secs: 600,
            max_output_chars: 20_000,
        }
    }
}

impl SandboxConfig {
    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_secs)
    }

    pub fn limits(&self) -> InterpreterLimits {
        InterpreterLimits {
            max_output_chars: self.max_output_chars,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    pub max_concurrent_fetches: usize,
    pub fetch_timeout_secs: u64,
    pub fetch_attempts: u32,
    pub cache_budget_bytes: usize,
    /// Segments to warm after each slice; 0 disables prefetch
    pub prefetch_segments: usize,
    /// Segment size used when appending
    pub segment_chars: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_concurrent_fetches: 16,
            fetch_timeout_secs: 30,
            fetch_attempts: 3,
            cache_budget_bytes: 256 * 1024 * 1024,
            prefetch_segments: 0,
            segment_chars: deeprecurse_vm::DEFAULT_SEGMENT_CHARS,
        }
    }
}

impl ContextConfig {
    pub fn segmented_config(&self) -> SegmentedConfig {
        let prefetch = match self.prefetch_segments {
            0 => PrefetchPolicy::Disabled,
            n => PrefetchPolicy::Adjacent { segments: n },
        };
        SegmentedConfig {
            max_concurrent_fetches: self.max_concurrent_fetches,
            fetch_timeout: Duration::from_secs(self.fetch_timeout_secs),
            fetch_attempts: self.fetch_attempts,
            cache_budget_bytes: self.cache_budget_bytes,
            prefetch,
            ..SegmentedConfig::default()
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreKind {
    #[default]
    File,
    Http,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub kind: StoreKind,
    /// Directory for the file store
    pub root: PathBuf,
    /// Base URL for the http store
    pub base_url: Option<String>,
    /// Environment variable holding a bearer token for the http store
    pub token_env: Option<String>,
    pub timeout_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            kind: StoreKind::File,
            root: PathBuf::from(".deeprecurse/store"),
            base_url: None,
            token_env: None,
            timeout_secs: 30,
        }
    }
}

impl StoreConfig {
    pub fn build(&self) -> Result<Arc<dyn ObjectStore>> {
        match self.kind {
            StoreKind::File => Ok(Arc::new(FileObjectStore::new(&self.root)?)),
            StoreKind::Http => {
                let url = self
                    .base_url
                    .as_deref()
                    .ok_or_else(|| Error::config_invalid("store.base_url is required for the http store"))?;
                let mut store = HttpObjectStore::new(url, Duration::from_secs(self.timeout_secs))?;
                let token = self.token_env.as_deref().and_then(|name| std::env::var(name).ok());
                if let Some(token) = token {
                    store = store.with_bearer_token(token);
                }
                Ok(Arc::new(store))
            }
        }
    }
}

impl EngineConfig {
    /// Load from an optional TOML file, apply the environment, validate
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            error::io_error(format!("Failed to read config {}: {}", path.display(), e)).set_source(e)
        })?;
        Self::from_toml(&contents).map_err(|e| e.with_context("path", path.display().to_string()))
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        toml::from_str(contents)
            .map_err(|e| Error::config_invalid(format!("Failed to parse TOML: {}", e)))
    }

    /// Apply `DEEPRECURSE_*` overrides read through `lookup`
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(model) = lookup("DEEPRECURSE_MODEL") {
            self.model = model;
        }
        if let Some(model) = lookup("DEEPRECURSE_SUB_MODEL") {
            self.sub_model = model;
        }
        if let Some(value) = lookup("DEEPRECURSE_MAX_ITERATIONS") {
            self.max_iterations = parse_number("DEEPRECURSE_MAX_ITERATIONS", &value)?;
        }
        if let Some(value) = lookup("DEEPRECURSE_MAX_DEPTH") {
            self.max_depth = parse_number("DEEPRECURSE_MAX_DEPTH", &value)?;
        }
        if let Some(url) = lookup("DEEPRECURSE_BASE_URL") {
            self.backend.base_url = Some(url);
        }
        if let Some(root) = lookup("DEEPRECURSE_STORE_ROOT") {
            self.store.kind = StoreKind::File;
            self.store.root = PathBuf::from(root);
        }
        if let Some(url) = lookup("DEEPRECURSE_STORE_URL") {
            self.store.kind = StoreKind::Http;
            self.store.base_url = Some(url);
        }
        if let Some(kind) = lookup("DEEPRECURSE_SANDBOX") {
            self.sandbox.kind = kind
                .parse()
                .map_err(|e: Error| Error::config_invalid(e.message().to_string()))?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();
        if self.model.trim().is_empty() {
            problems.push("model must not be empty");
        }
        if self.sub_model.trim().is_empty() {
            problems.push("sub_model must not be empty");
        }
        if self.max_depth == 0 {
            problems.push("max_depth must be at least 1");
        }
        if self.max_concurrent_subcalls == 0 {
            problems.push("max_concurrent_subcalls must be positive");
        }
        if self.context.max_concurrent_fetches == 0 {
            problems.push("context.max_concurrent_fetches must be positive");
        }
        if self.backend.max_attempts == 0 {
            problems.push("backend.max_attempts must be at least 1");
        }
        if self.context.segment_chars == 0 {
            problems.push("context.segment_chars must be positive");
        }
        if self.store.kind == StoreKind::Http && self.store.base_url.is_none() {
            problems.push("store.base_url is required for the http store");
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(Error::config_invalid(problems.join("; ")))
        }
    }

    pub fn subcall_timeout(&self) -> Duration {
        Duration::from_secs(self.subcall_timeout_secs)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| error::serialization_error(format!("Failed to render TOML: {}", e)))
    }
}

fn parse_number(name: &str, value: &str) -> Result<usize> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::config_invalid(format!("{} must be a number, got '{}'", name, value)))
}
