//! History consumer configuration.

use std::net::IpAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use encore_core::{split_list, AuthConfig, BrokerConfig, ConsumerConfig};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    /// Port of the history API.
    /// Override: `HISTORY_PORT`
    pub bind_port: u16,

    pub bind_address: IpAddr,

    /// Browser origins allowed by CORS; empty allows any.
    /// Override: `ALLOWED_ORIGINS` (comma separated, `*` for any)
    pub allowed_origins: Vec<String>,

    /// Override: `JWT_SECRET`
    pub auth: AuthConfig,

    /// Override: `RABBITMQ_URL`
    pub broker: BrokerConfig,

    /// Override: `ENCORE_CONNECT_ATTEMPTS`
    pub consumer: ConsumerConfig,

    /// Append-only play journal.
    /// Override: `ENCORE_HISTORY_JOURNAL`
    pub journal_path: PathBuf,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            bind_port: 8005,
            bind_address: IpAddr::from([0, 0, 0, 0]),
            allowed_origins: Vec::new(),
            auth: AuthConfig::default(),
            broker: BrokerConfig::default(),
            consumer: ConsumerConfig::default(),
            journal_path: PathBuf::from("./data/history.jsonl"),
        }
    }
}

impl HistoryConfig {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let content = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read config file: {}", path.display()))?;
                serde_yaml::from_str(&content)
                    .with_context(|| format!("Failed to parse config file: {}", path.display()))?
            }
            None => Self::default(),
        };

        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let var = |key: &str| lookup(key).filter(|v| !v.is_empty());

        if let Some(port) = var("HISTORY_PORT").and_then(|v| v.parse().ok()) {
            self.bind_port = port;
        }
        if let Some(origins) = var("ALLOWED_ORIGINS") {
            self.allowed_origins = split_list(&origins)
                .into_iter()
                .filter(|origin| origin != "*")
                .collect();
        }
        if let Some(secret) = var("JWT_SECRET") {
            self.auth.jwt_secret = secret;
        }
        if let Some(url) = var("RABBITMQ_URL") {
            self.broker.url = url;
        }
        if let Some(path) = var("ENCORE_HISTORY_JOURNAL") {
            self.journal_path = PathBuf::from(path);
        }
        if let Some(attempts) = var("ENCORE_CONNECT_ATTEMPTS").and_then(|v| v.parse().ok()) {
            self.consumer.connect_attempts = attempts;
        }
    }

    fn validate(&self) -> Result<()> {
        self.broker.validate().map_err(anyhow::Error::msg)?;
        self.consumer.validate().map_err(anyhow::Error::msg)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_replace_defaults() {
        let mut config = HistoryConfig::default();
        config.apply_overrides(|key| match key {
            "RABBITMQ_URL" => Some("amqp://rabbit/%2f".to_string()),
            "ENCORE_CONNECT_ATTEMPTS" => Some("3".to_string()),
            _ => None,
        });

        assert_eq!(config.broker.url, "amqp://rabbit/%2f");
        assert_eq!(config.consumer.connect_attempts, 3);
        assert_eq!(config.journal_path, PathBuf::from("./data/history.jsonl"));
        assert_eq!(config.bind_port, 8005);
    }

    #[test]
    fn api_overrides_apply() {
        let mut config = HistoryConfig::default();
        config.apply_overrides(|key| match key {
            "HISTORY_PORT" => Some("9005".to_string()),
            "ALLOWED_ORIGINS" => Some("https://encore.app,https://admin.encore.app".to_string()),
            "JWT_SECRET" => Some("s3cret".to_string()),
            _ => None,
        });

        assert_eq!(config.bind_port, 9005);
        assert_eq!(
            config.allowed_origins,
            vec!["https://encore.app", "https://admin.encore.app"]
        );
        assert_eq!(config.auth.jwt_secret, "s3cret");
    }

    #[test]
    fn wildcard_origin_allows_any() {
        let mut config = HistoryConfig::default();
        config.apply_overrides(|key| (key == "ALLOWED_ORIGINS").then(|| "*".to_string()));
        assert!(config.allowed_origins.is_empty());
    }

    #[test]
    fn zero_attempts_fail_validation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.yaml");
        std::fs::write(&path, "consumer:\n  connect_attempts: 0\n").unwrap();

        assert!(HistoryConfig::load(Some(&path)).is_err());
    }
}
