//! Configuration management
//!
//! 設定は以下の優先順位で読み込まれます:
//! 1. 環境変数 (`HIVE_*`)
//! 2. hive.toml 設定ファイル
//! 3. デフォルト値
//!
//! 設定ファイル内では `${VAR_NAME}` 形式で環境変数を展開できます。

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::Error;
use crate::agents::RuntimeLimits;
use crate::scheduler::SchedulerLimits;

/// Default configuration file name
pub const CONFIG_FILE: &str = "hive.toml";

/// Main configuration for the orchestration core
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Scheduling and retry limits
    #[serde(default)]
    pub orchestration: OrchestrationConfig,

    /// Task state checkpointing
    #[serde(default)]
    pub checkpoint: CheckpointConfig,

    /// Shared memory store
    #[serde(default)]
    pub memory: MemoryConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestrationConfig {
    /// Maximum runtimes executing at once, across all agents
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,

    /// Maximum runtimes per agent (0 = unbounded)
    #[serde(default)]
    pub per_agent_concurrency: usize,

    /// Retry budget for tasks that do not carry their own
    #[serde(default = "default_max_retries")]
    pub default_max_retries: u32,

    /// Pause before a retried task is resubmitted
    #[serde(default)]
    pub retry_backoff_ms: u64,

    /// Recovery rounds a parent may spend on failed children per attempt
    #[serde(default = "default_max_replans")]
    pub max_replans: u32,

    /// Memories handed to one Decide phase
    #[serde(default = "default_memory_recall_limit")]
    pub memory_recall_limit: usize,
}

impl Default for OrchestrationConfig {
    fn default() -> Self {
        Self {
            max_in_flight: default_max_in_flight(),
            per_agent_concurrency: 0,
            default_max_retries: default_max_retries(),
            retry_backoff_ms: 0,
            max_replans: default_max_replans(),
            memory_recall_limit: default_memory_recall_limit(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Whether task records are persisted after every round
    #[serde(default)]
    pub enabled: bool,

    /// Path to SQLite database file
    #[serde(default = "default_checkpoint_db_path")]
    pub db_path: String,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            db_path: default_checkpoint_db_path(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Whether agents that ask for memory get the SQLite store
    #[serde(default)]
    pub enabled: bool,

    /// Path to SQLite database file
    #[serde(default = "default_memory_db_path")]
    pub db_path: String,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            db_path: default_memory_db_path(),
        }
    }
}

fn default_max_in_flight() -> usize {
    64
}

fn default_max_retries() -> u32 {
    2
}

fn default_max_replans() -> u32 {
    2
}

fn default_memory_recall_limit() -> usize {
    5
}

fn default_checkpoint_db_path() -> String {
    "data/hive.db".to_string()
}

fn default_memory_db_path() -> String {
    "data/hive-memory.db".to_string()
}

impl Config {
    /// 設定ファイルから環境変数を展開する
    ///
    /// `${VAR_NAME}` 形式の文字列を環境変数の値に置換します。
    /// 環境変数が存在しない場合は空文字列になります。
    fn expand_env_vars(value: &str) -> String {
        let mut result = String::new();
        let mut chars = value.chars().peekable();

        while let Some(c) = chars.next() {
            if c == '$' && chars.peek() == Some(&'{') {
                chars.next(); // '{' を消費

                let mut var_name = String::new();
                for c in chars.by_ref() {
                    if c == '}' {
                        break;
                    }
                    var_name.push(c);
                }

                if let Ok(env_value) = std::env::var(&var_name) {
                    result.push_str(&env_value);
                }
            } else {
                result.push(c);
            }
        }

        result
    }

    /// TOML 設定ファイルから設定を読み込む
    ///
    /// # 引数
    /// * `path` - TOML ファイルのパス
    ///
    /// # 環境変数展開
    /// 設定ファイル内の `${VAR_NAME}` は環境変数の値に置換されます。
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let path = path.as_ref();

        let toml_content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;

        let mut cfg = Self::from_toml_str(&toml_content)?;

        // 既存の環境変数で上書き（環境変数が優先）
        cfg.apply_env_overrides();
        cfg.validate()?;

        Ok(cfg)
    }

    /// TOML 文字列を解析する（環境変数による上書きなし）
    pub fn from_toml_str(content: &str) -> crate::Result<Self> {
        let expanded_content = Self::expand_env_vars(content);

        let config: TomlConfig = toml::from_str(&expanded_content)
            .map_err(|e| Error::Config(format!("Failed to parse TOML: {}", e)))?;

        Ok(Self::from_toml_config(config))
    }

    /// デフォルトパスから設定を読み込む
    ///
    /// `./hive.toml` があればそれを使い、なければデフォルト値と環境変数のみ。
    pub fn load() -> crate::Result<Self> {
        if Path::new(CONFIG_FILE).exists() {
            return Self::from_toml_file(CONFIG_FILE);
        }

        Self::from_env()
    }

    /// TOML 構造から Config を構築
    fn from_toml_config(toml: TomlConfig) -> Self {
        let defaults = OrchestrationConfig::default();
        let orchestration = toml.orchestration.unwrap_or_default();
        let orchestration = OrchestrationConfig {
            max_in_flight: orchestration.max_in_flight.unwrap_or(defaults.max_in_flight),
            per_agent_concurrency: orchestration
                .per_agent_concurrency
                .unwrap_or(defaults.per_agent_concurrency),
            default_max_retries: orchestration
                .default_max_retries
                .unwrap_or(defaults.default_max_retries),
            retry_backoff_ms: orchestration
                .retry_backoff_ms
                .unwrap_or(defaults.retry_backoff_ms),
            max_replans: orchestration.max_replans.unwrap_or(defaults.max_replans),
            memory_recall_limit: orchestration
                .memory_recall_limit
                .unwrap_or(defaults.memory_recall_limit),
        };

        // Checkpoint 設定
        let checkpoint = toml.checkpoint.unwrap_or_default();
        let checkpoint = CheckpointConfig {
            enabled: checkpoint.enabled.unwrap_or(false),
            db_path: checkpoint.db_path.unwrap_or_else(default_checkpoint_db_path),
        };

        // Memory 設定
        let memory = toml.memory.unwrap_or_default();
        let memory = MemoryConfig {
            enabled: memory.enabled.unwrap_or(false),
            db_path: memory.db_path.unwrap_or_else(default_memory_db_path),
        };

        Config {
            orchestration,
            checkpoint,
            memory,
        }
    }

    /// 環境変数で設定を上書きする
    fn apply_env_overrides(&mut self) {
        let o = &mut self.orchestration;
        if let Some(v) = env_parse("HIVE_MAX_IN_FLIGHT") {
            o.max_in_flight = v;
        }
        if let Some(v) = env_parse("HIVE_PER_AGENT_CONCURRENCY") {
            o.per_agent_concurrency = v;
        }
        if let Some(v) = env_parse("HIVE_DEFAULT_MAX_RETRIES") {
            o.default_max_retries = v;
        }
        if let Some(v) = env_parse("HIVE_RETRY_BACKOFF_MS") {
            o.retry_backoff_ms = v;
        }
        if let Some(v) = env_parse("HIVE_MAX_REPLANS") {
            o.max_replans = v;
        }
        if let Some(v) = env_parse("HIVE_MEMORY_RECALL_LIMIT") {
            o.memory_recall_limit = v;
        }

        // Checkpoint 設定の上書き
        if let Some(enabled) = env_flag("HIVE_CHECKPOINT_ENABLED") {
            self.checkpoint.enabled = enabled;
        }
        if let Ok(path) = std::env::var("HIVE_CHECKPOINT_DB") {
            if !path.is_empty() {
                self.checkpoint.db_path = path;
            }
        }

        // Memory 設定の上書き
        if let Some(enabled) = env_flag("HIVE_MEMORY_ENABLED") {
            self.memory.enabled = enabled;
        }
        if let Ok(path) = std::env::var("HIVE_MEMORY_DB") {
            if !path.is_empty() {
                self.memory.db_path = path;
            }
        }
    }

    /// Load configuration from defaults and environment variables
    pub fn from_env() -> crate::Result<Self> {
        let mut cfg = Self::default();
        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject settings the coordinator cannot run with
    pub fn validate(&self) -> crate::Result<()> {
        if self.orchestration.max_in_flight == 0 {
            return Err(Error::Config(
                "orchestration.max_in_flight must be at least 1".to_string(),
            ));
        }
        if self.checkpoint.enabled && self.checkpoint.db_path.is_empty() {
            return Err(Error::Config("checkpoint.db_path is empty".to_string()));
        }
        if self.memory.enabled && self.memory.db_path.is_empty() {
            return Err(Error::Config("memory.db_path is empty".to_string()));
        }
        Ok(())
    }

    /// Limits applied to each runtime invocation
    pub fn runtime_limits(&self) -> RuntimeLimits {
        RuntimeLimits {
            max_replans: self.orchestration.max_replans,
            memory_recall_limit: self.orchestration.memory_recall_limit,
        }
    }

    /// Concurrency bounds for the delegation scheduler
    pub fn scheduler_limits(&self) -> SchedulerLimits {
        SchedulerLimits {
            max_in_flight: self.orchestration.max_in_flight,
            per_agent: self.orchestration.per_agent_concurrency,
        }
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.orchestration.retry_backoff_ms)
    }
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

fn env_flag(name: &str) -> Option<bool> {
    std::env::var(name)
        .ok()
        .filter(|v| !v.is_empty())
        .map(|v| v.to_lowercase() != "false")
}

// ============================================================================
// TOML 構造体定義（ファイル解析用）
// ============================================================================

/// TOML ファイル用のトップレベル構造
#[derive(Debug, Deserialize)]
struct TomlConfig {
    /// オーケストレーション設定
    orchestration: Option<TomlOrchestrationConfig>,
    /// チェックポイント設定
    checkpoint: Option<TomlCheckpointConfig>,
    /// メモリ設定
    memory: Option<TomlMemoryConfig>,
}

#[derive(Debug, Deserialize, Default)]
struct TomlOrchestrationConfig {
    max_in_flight: Option<usize>,
    per_agent_concurrency: Option<usize>,
    default_max_retries: Option<u32>,
    retry_backoff_ms: Option<u64>,
    max_replans: Option<u32>,
    memory_recall_limit: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct TomlCheckpointConfig {
    /// 有効/無効
    enabled: Option<bool>,
    /// データベースパス
    db_path: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct TomlMemoryConfig {
    /// 有効/無効
    enabled: Option<bool>,
    /// データベースパス
    db_path: Option<String>,
}
