use std::collections::HashMap;
use std::env;
use std::fmt;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingVar(&'static str),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Clone)]
pub struct AppConfig {
    pub bind_addr: String,
    /// Shared bearer token every client must present
    pub api_token: String,
}

impl fmt::Debug for AppConfig {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("AppConfig")
            .field("bind_addr", &self.bind_addr)
            .field("api_token", &"[REDACTED]")
            .finish()
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let values: HashMap<String, String> = env::vars().collect();
        Self::from_lookup(|name| values.get(name).cloned())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let bind_addr = value_or_default(&lookup, "HERDSYNC_API_BIND_ADDR", "127.0.0.1:8080");
        if !bind_addr.contains(':') {
            return Err(ConfigError::Invalid(
                "HERDSYNC_API_BIND_ADDR must be host:port".to_string(),
            ));
        }

        let api_token = required_trimmed(&lookup, "HERDSYNC_API_TOKEN")?;
        if api_token.contains(char::is_whitespace) {
            return Err(ConfigError::Invalid(
                "HERDSYNC_API_TOKEN must not contain whitespace".to_string(),
            ));
        }

        Ok(Self {
            bind_addr,
            api_token,
        })
    }
}

fn value_or_default(lookup: impl Fn(&str) -> Option<String>, name: &str, default: &str) -> String {
    optional_trimmed(lookup, name).unwrap_or_else(|| default.to_string())
}

fn required_trimmed(
    lookup: impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<String, ConfigError> {
    optional_trimmed(lookup, name).ok_or(ConfigError::MissingVar(name))
}

fn optional_trimmed(lookup: impl Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    lookup(name).and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config_from(pairs: &[(&str, &str)]) -> Result<AppConfig, ConfigError> {
        let map: HashMap<&str, &str> = pairs.iter().copied().collect();
        AppConfig::from_lookup(|key| map.get(key).map(|value| (*value).to_string()))
    }

    #[test]
    fn config_requires_api_token() {
        let err = config_from(&[]).unwrap_err();
        assert!(err.to_string().contains("HERDSYNC_API_TOKEN"));
    }

    #[test]
    fn config_defaults_bind_addr() {
        let config = config_from(&[("HERDSYNC_API_TOKEN", " farm-secret ")]).unwrap();
        assert_eq!(config.bind_addr, "127.0.0.1:8080");
        assert_eq!(config.api_token, "farm-secret");
    }

    #[test]
    fn config_rejects_bad_values() {
        let err = config_from(&[
            ("HERDSYNC_API_TOKEN", "farm-secret"),
            ("HERDSYNC_API_BIND_ADDR", "localhost"),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("HERDSYNC_API_BIND_ADDR"));

        let err = config_from(&[("HERDSYNC_API_TOKEN", "farm secret")]).unwrap_err();
        assert!(err.to_string().contains("whitespace"));
    }

    #[test]
    fn config_redacts_api_token() {
        let config = config_from(&[("HERDSYNC_API_TOKEN", "sensitive-farm-token")]).unwrap();
        let debug_output = format!("{config:?}");
        assert!(!debug_output.contains("sensitive-farm-token"));
        assert!(debug_output.contains("[REDACTED]"));
    }
}
