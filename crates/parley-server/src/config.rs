//! Server configuration loading from file and environment variables.

use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use thiserror::Error;

/// Top-level server configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    /// Remote speech-model gateway.
    #[serde(default)]
    pub model: ModelConfig,

    #[serde(default)]
    pub inference: InferenceSection,

    #[serde(default)]
    pub audio: AudioConfig,

    #[serde(default)]
    pub sessions: SessionsConfig,

    #[serde(default)]
    pub prompt: PromptConfig,

    #[serde(default)]
    pub history: HistoryConfig,

    #[serde(default)]
    pub webhook: WebhookConfig,

    #[serde(default)]
    pub compliance: ComplianceConfig,
}

/// Network configuration for the HTTP server.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: IpAddr,

    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_db_path")]
    pub path: String,

    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    #[serde(default = "default_pool_max_size")]
    pub pool_max_size: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "parley_engine=debug,info").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to output logs in JSON format.
    #[serde(default)]
    pub json: bool,
}

#[derive(Clone, Deserialize)]
pub struct ModelConfig {
    /// `ws://` or `wss://` URL of the bidirectional gateway.
    #[serde(default = "default_model_endpoint")]
    pub endpoint_url: String,

    #[serde(default)]
    pub auth_token: Option<String>,

    #[serde(default = "default_model_id")]
    pub model_id: String,

    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

impl std::fmt::Debug for ModelConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelConfig")
            .field("endpoint_url", &self.endpoint_url)
            .field("auth_token", &self.auth_token.as_ref().map(|_| "<redacted>"))
            .field("model_id", &self.model_id)
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct InferenceSection {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default = "default_top_p")]
    pub top_p: f32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AudioConfig {
    #[serde(default = "default_input_sample_rate")]
    pub input_sample_rate: u32,

    #[serde(default = "default_output_sample_rate")]
    pub output_sample_rate: u32,

    #[serde(default = "default_sample_size_bits")]
    pub sample_size_bits: u16,

    #[serde(default = "default_channels")]
    pub channels: u16,

    #[serde(default = "default_voice_id")]
    pub voice_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionsConfig {
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    #[serde(default = "default_reap_interval_secs")]
    pub reap_interval_secs: u64,

    #[serde(default = "default_close_timeout_secs")]
    pub close_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PromptConfig {
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HistoryConfig {
    /// `true` checkpoints history in SQLite; `false` keeps it in process.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Clone, Deserialize)]
pub struct WebhookConfig {
    #[serde(default)]
    pub url: Option<String>,

    #[serde(default)]
    pub secret: Option<String>,

    #[serde(default = "default_secret_header")]
    pub secret_header: String,

    #[serde(default = "default_webhook_timeout_secs")]
    pub timeout_secs: u64,
}

impl std::fmt::Debug for WebhookConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookConfig")
            .field("url", &self.url)
            .field("secret", &self.secret.as_ref().map(|_| "<redacted>"))
            .field("secret_header", &self.secret_header)
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ComplianceConfig {
    /// Phrases that block an assistant fragment. Empty disables filtering.
    #[serde(default)]
    pub blocked_phrases: Vec<String>,

    #[serde(default = "default_replacement_text")]
    pub replacement_text: String,
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))
}

fn default_port() -> u16 {
    8000
}

fn default_db_path() -> String {
    "parley.db".to_string()
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

fn default_pool_max_size() -> u32 {
    8
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_model_endpoint() -> String {
    "ws://127.0.0.1:9000/v1/stream".to_string()
}

fn default_model_id() -> String {
    "amazon.nova-sonic-v1:0".to_string()
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_max_tokens() -> u32 {
    1024
}

fn default_temperature() -> f32 {
    0.7
}

fn default_top_p() -> f32 {
    0.9
}

fn default_input_sample_rate() -> u32 {
    16_000
}

fn default_output_sample_rate() -> u32 {
    24_000
}

fn default_sample_size_bits() -> u16 {
    16
}

fn default_channels() -> u16 {
    1
}

fn default_voice_id() -> String {
    "matthew".to_string()
}

fn default_max_concurrent() -> usize {
    100
}

fn default_idle_timeout_secs() -> u64 {
    300
}

fn default_reap_interval_secs() -> u64 {
    60
}

fn default_close_timeout_secs() -> u64 {
    5
}

fn default_system_prompt() -> String {
    parley_engine::DEFAULT_SYSTEM_PROMPT.to_string()
}

fn default_true() -> bool {
    true
}

fn default_secret_header() -> String {
    "X-N8N-Secret".to_string()
}

fn default_webhook_timeout_secs() -> u64 {
    10
}

fn default_replacement_text() -> String {
    "I'm sorry, I can't discuss that.".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
            pool_max_size: default_pool_max_size(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            endpoint_url: default_model_endpoint(),
            auth_token: None,
            model_id: default_model_id(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

impl Default for InferenceSection {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            top_p: default_top_p(),
        }
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            input_sample_rate: default_input_sample_rate(),
            output_sample_rate: default_output_sample_rate(),
            sample_size_bits: default_sample_size_bits(),
            channels: default_channels(),
            voice_id: default_voice_id(),
        }
    }
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            idle_timeout_secs: default_idle_timeout_secs(),
            reap_interval_secs: default_reap_interval_secs(),
            close_timeout_secs: default_close_timeout_secs(),
        }
    }
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            system_prompt: default_system_prompt(),
        }
    }
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            url: None,
            secret: None,
            secret_header: default_secret_header(),
            timeout_secs: default_webhook_timeout_secs(),
        }
    }
}

impl Default for ComplianceConfig {
    fn default() -> Self {
        Self {
            blocked_phrases: Vec::new(),
            replacement_text: default_replacement_text(),
        }
    }
}

impl SessionsConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs.max(1))
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Loads configuration from a TOML file, falling back to defaults.
///
/// Environment variable overrides:
/// - `PARLEY_HOST`, `PARLEY_PORT`
/// - `PARLEY_DB_PATH`
/// - `PARLEY_LOG_LEVEL`, `PARLEY_LOG_JSON` ("true" or "1" to enable)
/// - `PARLEY_MODEL_ENDPOINT`, `PARLEY_MODEL_TOKEN`
/// - `PARLEY_WEBHOOK_URL`, `PARLEY_WEBHOOK_SECRET`
/// - `PARLEY_MAX_SESSIONS`, `PARLEY_SESSION_TIMEOUT_SECS`
///
/// # Errors
///
/// Returns `ConfigError` if the file exists but cannot be read or parsed.
pub fn load_config(path: Option<&str>) -> Result<Config, ConfigError> {
    let mut config = match path {
        Some(p) => match std::fs::read_to_string(p) {
            Ok(contents) => toml::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = p, "config file not found, using defaults");
                Config::default()
            }
            Err(e) => return Err(ConfigError::FileRead(e)),
        },
        None => Config::default(),
    };
    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    Ok(config)
}

fn apply_env_overrides(config: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(parsed) = var("PARLEY_HOST").and_then(|v| v.parse().ok()) {
        config.server.host = parsed;
    }
    if let Some(parsed) = var("PARLEY_PORT").and_then(|v| v.parse().ok()) {
        config.server.port = parsed;
    }
    if let Some(path) = var("PARLEY_DB_PATH") {
        config.database.path = path;
    }
    if let Some(level) = var("PARLEY_LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Some(json) = var("PARLEY_LOG_JSON") {
        config.logging.json = json == "true" || json == "1";
    }
    if let Some(endpoint) = var("PARLEY_MODEL_ENDPOINT") {
        config.model.endpoint_url = endpoint;
    }
    if let Some(token) = var("PARLEY_MODEL_TOKEN").filter(|t| !t.is_empty()) {
        config.model.auth_token = Some(token);
    }
    if let Some(url) = var("PARLEY_WEBHOOK_URL").filter(|u| !u.is_empty()) {
        config.webhook.url = Some(url);
    }
    if let Some(secret) = var("PARLEY_WEBHOOK_SECRET").filter(|s| !s.is_empty()) {
        config.webhook.secret = Some(secret);
    }
    if let Some(parsed) = var("PARLEY_MAX_SESSIONS").and_then(|v| v.parse().ok()) {
        config.sessions.max_concurrent = parsed;
    }
    if let Some(parsed) = var("PARLEY_SESSION_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
        config.sessions.idle_timeout_secs = parsed;
    }
}
