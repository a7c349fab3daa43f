//! Configuration management for Magic Agent.
//!
//! Configuration is a TOML document (default `config/config.toml`). Every
//! table has defaults, so a partial document is valid:
//!
//! ```toml
//! [agent]
//! max_steps = 20
//! save_interval = 5.0
//!
//! [llm]
//! api_type = "openai"
//! model = "gpt-4o"
//! api_key = "${OPENAI_API_KEY}"
//!
//! [llm.vision]
//! api_type = "openai"
//! model = "gpt-4o"
//!
//! [sandbox]
//! use_sandbox = true
//! memory_limit = "512m"
//! ```
//!
//! String values of the form `${NAME}` in credential fields are resolved from
//! the environment at load time.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_CONFIG_PATH: &str = "config/config.toml";

const SUPPORTED_API_TYPES: &[&str] = &[
    "openai",
    "azure",
    "ollama",
    "ppio",
    "claude",
    "anthropic",
    "aws",
    "bedrock",
];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level configuration document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub system: SystemConfig,
    pub logging: LoggingConfig,
    pub agent: AgentConfig,
    pub llm: LlmConfig,
    pub tools: ToolsConfig,
    /// Directory holding prompt templates (`system.md`).
    pub templates_dir: Option<PathBuf>,
    pub browser: BrowserConfig,
    pub sandbox: SandboxConfig,
    pub mcp: McpConfig,
}

/// System identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    pub name: String,
    pub debug: bool,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            name: "magic-agent".to_string(),
            debug: false,
        }
    }
}

/// Output format of the log stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Full,
    Compact,
    Pretty,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive (`info`, `debug`, `magic_agent=trace`, ...)
    pub level: String,
    pub format: LogFormat,
    /// Append-only log file; stderr when unset.
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Full,
            file: None,
        }
    }
}

/// Agent loop parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub name: String,
    /// Maximum steps produced in one run
    pub max_steps: usize,
    /// Consecutive non-productive steps before the loop stops
    pub max_idle_loops: usize,
    /// Consecutive failed model calls tolerated before the agent fails
    pub max_model_retries: u32,
    pub auto_save: bool,
    /// Minimum seconds between automatic snapshots
    pub save_interval: f64,
    /// Directory for AgentState snapshots
    pub data_dir: PathBuf,
    /// Directory for session metadata
    pub sessions_dir: PathBuf,
    /// Overrides the built-in system prompt when set
    pub system_prompt: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            name: "Assistant".to_string(),
            max_steps: 10,
            max_idle_loops: 5,
            max_model_retries: 3,
            auto_save: true,
            save_interval: 5.0,
            data_dir: PathBuf::from("data/agents"),
            sessions_dir: PathBuf::from("data/sessions"),
            system_prompt: None,
        }
    }
}

impl AgentConfig {
    pub fn save_interval(&self) -> Duration {
        Duration::from_secs_f64(self.save_interval.max(0.0))
    }
}

/// One LLM backend profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmProfile {
    /// `openai` | `azure` | `ollama` | `claude` | `anthropic` | `aws` | `bedrock`
    pub api_type: String,
    pub model: String,
    pub base_url: Option<String>,
    /// AWS region for Bedrock
    pub region: Option<String>,
    pub api_key: Option<String>,
    /// Azure `api-version` query parameter
    pub api_version: Option<String>,
    /// Model context size
    pub max_tokens: u64,
    pub temperature: f64,
    /// Tokens reserved for the completion
    pub reserved_tokens: u64,
    /// Per-request timeout in seconds
    pub timeout: u64,
    /// Retries for transient failures
    pub max_retries: u32,
}

impl Default for LlmProfile {
    fn default() -> Self {
        Self {
            api_type: "openai".to_string(),
            model: "gpt-4o-mini".to_string(),
            base_url: None,
            region: None,
            api_key: None,
            api_version: None,
            max_tokens: 4096,
            temperature: 0.7,
            reserved_tokens: 1000,
            timeout: 60,
            max_retries: 3,
        }
    }
}

impl LlmProfile {
    fn validate(&self, section: &str) -> Result<(), ConfigError> {
        if !SUPPORTED_API_TYPES.contains(&self.api_type.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "{}.api_type '{}' is not one of {}",
                section,
                self.api_type,
                SUPPORTED_API_TYPES.join(", ")
            )));
        }
        if self.model.trim().is_empty() {
            return Err(ConfigError::Invalid(format!("{}.model is empty", section)));
        }
        if self.reserved_tokens >= self.max_tokens {
            return Err(ConfigError::Invalid(format!(
                "{}.reserved_tokens ({}) must be below max_tokens ({})",
                section, self.reserved_tokens, self.max_tokens
            )));
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(ConfigError::Invalid(format!(
                "{}.temperature must be within 0.0..=2.0",
                section
            )));
        }
        Ok(())
    }

    fn resolve_env(&mut self, section: &str) -> Result<(), ConfigError> {
        if let Some(key) = self.api_key.take() {
            self.api_key = Some(resolve_env_ref(&key, &format!("{}.api_key", section))?);
        }
        Ok(())
    }
}

/// Primary LLM profile plus an optional vision profile.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(flatten)]
    pub profile: LlmProfile,
    #[serde(default)]
    pub vision: Option<LlmProfile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    /// Tool names to register (empty with `auto_discover` means "all found")
    pub enabled: Vec<String>,
    pub auto_discover: bool,
    /// Default wall-clock timeout per tool call, seconds
    pub timeout: u64,
    /// Output longer than this is truncated
    pub max_output_chars: usize,
    /// Base directory for relative tool paths
    pub working_dir: PathBuf,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            enabled: Vec::new(),
            auto_discover: true,
            timeout: 60,
            max_output_chars: 10_000,
            working_dir: PathBuf::from("workspace"),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// `http://host:port` or `socks5://host:port`
    pub server: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserConfig {
    pub headless: bool,
    pub disable_security: bool,
    /// Seconds
    pub timeout: u64,
    pub user_agent: Option<String>,
    /// Chrome/Chromium binary; discovered on PATH when unset
    pub chrome_path: Option<PathBuf>,
    pub proxy: Option<ProxyConfig>,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            headless: true,
            disable_security: false,
            timeout: 30,
            user_agent: None,
            chrome_path: None,
            proxy: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    pub use_sandbox: bool,
    pub image: String,
    /// Working directory inside the container
    pub work_dir: String,
    /// Docker memory limit (`512m`, `1g`)
    pub memory_limit: String,
    /// CPU share (`1.0` = one core)
    pub cpu_limit: f64,
    /// Seconds
    pub timeout: u64,
    pub network_enabled: bool,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            use_sandbox: false,
            image: "python:3.12-slim".to_string(),
            work_dir: "/workspace".to_string(),
            memory_limit: "512m".to_string(),
            cpu_limit: 1.0,
            timeout: 300,
            network_enabled: false,
        }
    }
}

/// Control surface settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct McpConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    /// Name the server reports in `initialize`
    pub server_reference: String,
}

impl Default for McpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "127.0.0.1".to_string(),
            port: 8765,
            server_reference: "magic-agent".to_string(),
        }
    }
}

impl Config {
    /// Load, resolve and validate a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_toml_str(&content).map_err(|e| match e {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            },
            other => other,
        })?;
        config.resolve_env()?;
        config.validate()?;
        tracing::debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Parse a document without touching the environment.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: PathBuf::from("<inline>"),
            source,
        })
    }

    fn resolve_env(&mut self) -> Result<(), ConfigError> {
        self.llm.profile.resolve_env("llm")?;
        if let Some(vision) = self.llm.vision.as_mut() {
            vision.resolve_env("llm.vision")?;
        }
        if let Some(proxy) = self.browser.proxy.as_mut() {
            if let Some(password) = proxy.password.take() {
                proxy.password = Some(resolve_env_ref(&password, "browser.proxy.password")?);
            }
        }
        Ok(())
    }

    /// Reject values the runtime cannot honour.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.agent.max_steps == 0 {
            return Err(ConfigError::Invalid("agent.max_steps must be > 0".into()));
        }
        if self.agent.max_idle_loops == 0 {
            return Err(ConfigError::Invalid(
                "agent.max_idle_loops must be > 0".into(),
            ));
        }
        if !self.agent.save_interval.is_finite() || self.agent.save_interval < 0.0 {
            return Err(ConfigError::Invalid(
                "agent.save_interval must be a non-negative number of seconds".into(),
            ));
        }
        self.llm.profile.validate("llm")?;
        if let Some(vision) = &self.llm.vision {
            vision.validate("llm.vision")?;
        }
        if self.tools.max_output_chars == 0 {
            return Err(ConfigError::Invalid(
                "tools.max_output_chars must be > 0".into(),
            ));
        }
        if self.sandbox.cpu_limit <= 0.0 {
            return Err(ConfigError::Invalid("sandbox.cpu_limit must be > 0".into()));
        }
        if let Some(proxy) = &self.browser.proxy {
            url::Url::parse(&proxy.server).map_err(|e| {
                ConfigError::Invalid(format!("browser.proxy.server '{}': {}", proxy.server, e))
            })?;
        }
        Ok(())
    }
}

/// Resolve `${NAME}` against the environment; other values pass through.
fn resolve_env_ref(value: &str, field: &str) -> Result<String, ConfigError> {
    let trimmed = value.trim();
    match trimmed
        .strip_prefix("${")
        .and_then(|rest| rest.strip_suffix('}'))
    {
        Some(name) => std::env::var(name).map_err(|_| {
            ConfigError::Invalid(format!(
                "{} references unset environment variable {}",
                field, name
            ))
        }),
        None => Ok(value.to_string()),
    }
}
