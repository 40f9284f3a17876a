use std::collections::BTreeMap;
use std::path::PathBuf;

use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::secrets::{has_secret_source, resolve_secret, SecretError};

/// Root of `tms.yaml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TmsConfig {
    pub mailbox: MailboxConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub analysis: AnalysisConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// IMAP mailbox holding the abuse complaints.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MailboxConfig {
    /// IMAP server hostname (e.g., "imap.gmail.com").
    pub host: String,

    #[serde(default = "default_imap_port")]
    pub port: u16,

    /// Plain IMAP is rejected at connect time.
    #[serde(default = "default_true")]
    pub use_tls: bool,

    pub username: String,

    #[serde(default)]
    pub auth: MailboxAuth,

    #[serde(default = "default_inbox")]
    pub folder: String,

    /// Only messages from this address are ingested.
    #[serde(default = "default_target_sender")]
    pub target_sender: String,

    /// Extra IMAP SEARCH equality criteria, e.g. `SUBJECT: "Abuse"`.
    #[serde(default)]
    pub criteria: BTreeMap<String, String>,

    /// Seconds allowed for TCP connect, TLS and login together.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,
}

impl MailboxConfig {
    /// Search criteria in IMAP order: `FROM <targetSender>` first, then the
    /// configured extras with upper-cased keys.
    pub fn search_criteria(&self) -> Vec<(String, String)> {
        let mut criteria = Vec::with_capacity(self.criteria.len() + 1);
        if !self.target_sender.is_empty() {
            criteria.push(("FROM".to_string(), self.target_sender.clone()));
        }
        for (key, value) in &self.criteria {
            let key = key.to_ascii_uppercase();
            if key == "FROM" && !self.target_sender.is_empty() {
                continue;
            }
            criteria.push((key, value.clone()));
        }
        criteria
    }
}

/// Where the mailbox password comes from.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MailboxAuth {
    /// Direct password value (for local development).
    /// Prefer `passwordEnvVar` or `passwordFile`.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        rename = "passwordInsecure",
        alias = "password"
    )]
    pub password_insecure: Option<String>,

    /// Path to a file containing the password (Docker secrets).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_file: Option<String>,

    /// Environment variable containing the password.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_env_var: Option<String>,
}

impl MailboxAuth {
    /// Whether any password source is set, without reading it.
    pub fn has_source(&self) -> bool {
        has_secret_source(
            self.password_insecure.as_deref(),
            self.password_file.as_deref(),
            self.password_env_var.as_deref(),
        )
    }

    pub fn resolve_password(&self) -> Result<SecretString, SecretError> {
        if self.password_insecure.is_some() {
            log::warn!(
                "Using direct password value (passwordInsecure) is not recommended. \
                 Consider using passwordEnvVar or passwordFile instead."
            );
        }
        resolve_secret(
            self.password_insecure.as_deref(),
            self.password_file.as_deref(),
            self.password_env_var.as_deref(),
        )
    }
}

/// Polling and cursor behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestConfig {
    /// Seconds between cycles.
    #[serde(default = "default_poll_interval")]
    pub poll_interval: u64,

    /// Start after the newest matching message on first run instead of
    /// ingesting the whole mailbox history.
    #[serde(default = "default_true")]
    pub skip_existing: bool,

    /// Store the cursor in the database so restarts resume where they left.
    #[serde(default = "default_true")]
    pub persist_cursor: bool,

    /// Attempts per UID before a failing message is given up on.
    #[serde(default = "default_max_fetch_attempts")]
    pub max_fetch_attempts: u32,

    /// Seconds allowed for one ticket analysis.
    #[serde(default = "default_analysis_timeout")]
    pub analysis_timeout: u64,

    /// Seconds to wait for the worker on shutdown. Pending analyses are
    /// abandoned at once; a mailbox command in flight is not, and past this
    /// limit the worker is aborted without logging out.
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            poll_interval: default_poll_interval(),
            skip_existing: true,
            persist_cursor: true,
            max_fetch_attempts: default_max_fetch_attempts(),
            analysis_timeout: default_analysis_timeout(),
            stop_timeout: default_stop_timeout(),
        }
    }
}

/// Chat-completions backend for ticket analysis.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_analysis_base_url")]
    pub base_url: String,

    #[serde(default = "default_analysis_model")]
    pub model: String,

    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        rename = "apiKeyInsecure",
        alias = "apiKey"
    )]
    pub api_key_insecure: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_file: Option<String>,

    #[serde(default = "default_api_key_env_var")]
    pub api_key_env_var: Option<String>,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Seconds allowed for one HTTP request.
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,
}

impl AnalysisConfig {
    pub fn has_api_key_source(&self) -> bool {
        has_secret_source(
            self.api_key_insecure.as_deref(),
            self.api_key_file.as_deref(),
            self.api_key_env_var.as_deref(),
        )
    }

    pub fn resolve_api_key(&self) -> Result<SecretString, SecretError> {
        resolve_secret(
            self.api_key_insecure.as_deref(),
            self.api_key_file.as_deref(),
            self.api_key_env_var.as_deref(),
        )
    }
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: default_analysis_base_url(),
            model: default_analysis_model(),
            api_key_insecure: None,
            api_key_file: None,
            api_key_env_var: default_api_key_env_var(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            request_timeout: default_request_timeout(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseConfig {
    /// SQLite file. Defaults to `~/.tms/data/tms.db`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

impl DatabaseConfig {
    pub fn resolved_path(&self) -> Option<PathBuf> {
        self.path
            .clone()
            .or_else(crate::db::default_database_path)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` overrides it.
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

fn default_true() -> bool {
    true
}

fn default_imap_port() -> u16 {
    993
}

fn default_inbox() -> String {
    "INBOX".to_string()
}

fn default_target_sender() -> String {
    "abuse@contabo.com".to_string()
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_poll_interval() -> u64 {
    60
}

fn default_max_fetch_attempts() -> u32 {
    3
}

fn default_analysis_timeout() -> u64 {
    60
}

fn default_stop_timeout() -> u64 {
    5
}

fn default_analysis_base_url() -> String {
    crate::analysis::chat::DEFAULT_BASE_URL.to_string()
}

fn default_analysis_model() -> String {
    crate::analysis::chat::DEFAULT_MODEL.to_string()
}

fn default_api_key_env_var() -> Option<String> {
    Some("GROK_API_KEY".to_string())
}

fn default_temperature() -> f32 {
    0.3
}

fn default_max_tokens() -> u32 {
    3000
}

fn default_request_timeout() -> u64 {
    60
}

fn default_log_level() -> String {
    "info".to_string()
}
