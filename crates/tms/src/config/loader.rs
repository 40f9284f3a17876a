use std::path::Path;

use crate::config::schema::TmsConfig;
use crate::error::ConfigError;

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<TmsConfig, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;

    load_config_from_str(&content)
}

pub fn load_config_from_str(content: &str) -> Result<TmsConfig, ConfigError> {
    let config: TmsConfig = serde_yaml::from_str(content)?;

    validate_config(&config)?;

    Ok(config)
}

pub fn validate_config(config: &TmsConfig) -> Result<(), ConfigError> {
    let mailbox = &config.mailbox;

    if mailbox.host.trim().is_empty() {
        return Err(invalid("mailbox.host must not be empty"));
    }
    if mailbox.username.trim().is_empty() {
        return Err(invalid("mailbox.username must not be empty"));
    }
    if mailbox.port == 0 {
        return Err(invalid("mailbox.port must be non-zero"));
    }
    if !mailbox.use_tls {
        return Err(invalid("mailbox.useTls must be true; plain IMAP is not supported"));
    }
    if mailbox.folder.trim().is_empty() {
        return Err(invalid("mailbox.folder must not be empty"));
    }
    if !mailbox.auth.has_source() {
        return Err(invalid(
            "mailbox.auth needs one of passwordInsecure, passwordFile or passwordEnvVar",
        ));
    }
    if mailbox.connect_timeout == 0 {
        return Err(invalid("mailbox.connectTimeout must be at least 1 second"));
    }
    if mailbox.search_criteria().is_empty() {
        return Err(invalid(
            "mailbox.targetSender or mailbox.criteria must select some messages",
        ));
    }
    for key in mailbox.criteria.keys() {
        if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(invalid(&format!(
                "mailbox.criteria key '{}' is not an IMAP search key",
                key
            )));
        }
    }

    let ingest = &config.ingest;
    if ingest.poll_interval == 0 {
        return Err(invalid("ingest.pollInterval must be at least 1 second"));
    }
    if ingest.max_fetch_attempts == 0 {
        return Err(invalid("ingest.maxFetchAttempts must be at least 1"));
    }
    if ingest.analysis_timeout == 0 {
        return Err(invalid("ingest.analysisTimeout must be at least 1 second"));
    }

    let analysis = &config.analysis;
    if analysis.enabled {
        if !analysis.base_url.starts_with("http://") && !analysis.base_url.starts_with("https://")
        {
            return Err(invalid("analysis.baseUrl must be an http(s) URL"));
        }
        if analysis.model.trim().is_empty() {
            return Err(invalid("analysis.model must not be empty"));
        }
        if !(0.0..=2.0).contains(&analysis.temperature) {
            return Err(invalid("analysis.temperature must be between 0 and 2"));
        }
        if analysis.max_tokens == 0 {
            return Err(invalid("analysis.maxTokens must be at least 1"));
        }
        if !analysis.has_api_key_source() {
            return Err(invalid(
                "analysis.apiKeyInsecure, apiKeyFile or apiKeyEnvVar is required when enabled",
            ));
        }
    }

    if config.logging.level.trim().is_empty() {
        return Err(invalid("logging.level must not be empty"));
    }

    Ok(())
}

fn invalid(message: &str) -> ConfigError {
    ConfigError::Validation {
        message: message.to_string(),
    }
}
