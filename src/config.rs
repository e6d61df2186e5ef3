use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::platform::{ChatId, Source, SourceKind};
use crate::retry::RetryPolicy;

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    #[default]
    Openrouter,
    Ollama,
    Openai,
}

impl std::fmt::Display for LlmProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LlmProvider::Openrouter => write!(f, "openrouter"),
            LlmProvider::Ollama => write!(f, "ollama"),
            LlmProvider::Openai => write!(f, "openai"),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default)]
    pub provider: LlmProvider,
    pub model: String,
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Classification prompt; `{content}` is replaced with the message text
    #[serde(default = "default_prompt")]
    pub prompt: String,
}

impl LlmConfig {
    /// Returns the effective base_url: if the stored value is empty,
    /// fall back to the canonical URL for the configured provider.
    pub fn effective_base_url(&self) -> &str {
        if !self.base_url.is_empty() {
            return &self.base_url;
        }
        match self.provider {
            LlmProvider::Openrouter => "https://openrouter.ai/api/v1",
            LlmProvider::Ollama => "http://localhost:11434/v1",
            LlmProvider::Openai => "https://api.openai.com/v1",
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub telegram: TelegramConfig,
    pub llm: LlmConfig,
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
    #[serde(default = "default_polling_config")]
    pub polling: PollingConfig,
    #[serde(default = "default_retry_config")]
    pub retry: RetryConfig,
    #[serde(default = "default_filter_config")]
    pub filter: FilterConfig,
    #[serde(default = "default_state_config")]
    pub state: StateConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct TelegramConfig {
    pub bot_token: String,
    /// Where accepted messages are forwarded
    pub target_chat_id: ChatId,
    /// Long-poll timeout for getUpdates; 0 returns immediately
    #[serde(default)]
    pub fetch_timeout_secs: u32,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct SourceConfig {
    pub id: ChatId,
    pub kind: SourceKind,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PollingConfig {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// How long to wait for straggler parts of a media group
    #[serde(default = "default_assembly_window_ms")]
    pub assembly_window_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
    /// Cycles a batch may fail before the failure policy applies
    #[serde(default = "default_max_batch_failures")]
    pub max_batch_failures: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct FilterConfig {
    /// Forward (true) or drop (false) a batch whose classification kept failing
    #[serde(default = "default_fail_open")]
    pub fail_open: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StateConfig {
    #[serde(default = "default_db_path")]
    pub database_path: PathBuf,
    /// Consecutive flush failures tolerated before shutting down
    #[serde(default = "default_max_flush_failures")]
    pub max_flush_failures: u32,
    /// Oldest fingerprints are evicted past this size; 0 keeps all
    #[serde(default = "default_seen_capacity")]
    pub seen_capacity: usize,
}

fn default_max_tokens() -> u32 {
    16
}

pub const DEFAULT_PROMPT: &str = "You are given some content to evaluate, you need to decide if it is of interest to me.\n\
Answer with ONLY the word 'True' or the word 'False', nothing else.\n\
If you are unsure, answer True and I will take a look.\n\n\
Content: {content}";

fn default_prompt() -> String {
    DEFAULT_PROMPT.to_string()
}

fn default_interval_secs() -> u64 {
    10
}

fn default_assembly_window_ms() -> u64 {
    2000
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

fn default_call_timeout_secs() -> u64 {
    30
}

fn default_max_batch_failures() -> u32 {
    2
}

fn default_fail_open() -> bool {
    true
}

fn default_db_path() -> PathBuf {
    PathBuf::from("forwarder_state.db")
}

fn default_max_flush_failures() -> u32 {
    5
}

fn default_seen_capacity() -> usize {
    10_000
}

fn default_polling_config() -> PollingConfig {
    PollingConfig {
        interval_secs: default_interval_secs(),
        assembly_window_ms: default_assembly_window_ms(),
    }
}

fn default_retry_config() -> RetryConfig {
    RetryConfig {
        max_attempts: default_max_attempts(),
        initial_backoff_ms: default_initial_backoff_ms(),
        max_backoff_ms: default_max_backoff_ms(),
        call_timeout_secs: default_call_timeout_secs(),
        max_batch_failures: default_max_batch_failures(),
    }
}

fn default_filter_config() -> FilterConfig {
    FilterConfig {
        fail_open: default_fail_open(),
    }
}

fn default_state_config() -> StateConfig {
    StateConfig {
        database_path: default_db_path(),
        max_flush_failures: default_max_flush_failures(),
        seen_capacity: default_seen_capacity(),
    }
}

impl PollingConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn assembly_window(&self) -> Duration {
        Duration::from_millis(self.assembly_window_ms)
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
            call_timeout: Duration::from_secs(self.call_timeout_secs),
        }
    }
}

impl TelegramConfig {
    /// Read only the `[telegram]` table, for tools that run before the
    /// rest of the file is filled in.
    pub fn load(path: &Path) -> Result<Self> {
        #[derive(Deserialize)]
        struct TelegramOnly {
            telegram: TelegramConfig,
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let parsed: TelegramOnly = toml::from_str(&content)
            .with_context(|| format!("Failed to parse [telegram] in {}", path.display()))?;
        Ok(parsed.telegram)
    }
}

impl Config {
    /// Configured sources, in file order
    pub fn sources(&self) -> Vec<Source> {
        self.sources
            .iter()
            .map(|s| Source {
                id: s.id,
                kind: s.kind,
            })
            .collect()
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::from_toml_str(&content)
            .with_context(|| format!("Invalid config file: {}", path.display()))
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).context("Failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.sources.is_empty() {
            anyhow::bail!("at least one [[sources]] entry is required");
        }
        for (i, source) in self.sources.iter().enumerate() {
            if self.sources[..i].iter().any(|s| s.id == source.id) {
                anyhow::bail!("source {} is listed more than once", source.id);
            }
        }
        if self.polling.interval_secs == 0 {
            anyhow::bail!("polling.interval_secs must be greater than zero");
        }
        if !self.llm.prompt.contains("{content}") {
            anyhow::bail!("llm.prompt must contain the {{content}} placeholder");
        }
        if self.retry.max_attempts == 0 {
            anyhow::bail!("retry.max_attempts must be at least 1");
        }
        if self.retry.max_batch_failures == 0 {
            anyhow::bail!("retry.max_batch_failures must be at least 1");
        }
        if self.retry.max_backoff_ms < self.retry.initial_backoff_ms {
            anyhow::bail!("retry.max_backoff_ms must not be below retry.initial_backoff_ms");
        }
        if self.state.max_flush_failures == 0 {
            anyhow::bail!("state.max_flush_failures must be at least 1");
        }
        Ok(())
    }
}
