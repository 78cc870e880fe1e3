//! Streaming server configuration.
//!
//! Supports loading from YAML files with environment variable overrides.

use std::net::IpAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use encore_core::{split_list, AuthConfig, BrokerConfig, SourceConfig, StreamingConfig};
use serde::Deserialize;

/// Default browser origins of the web player.
const DEFAULT_ORIGINS: &str = "http://localhost:5173,http://localhost:3000,http://localhost:5174";

/// Server configuration loaded from YAML with environment overrides.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Port to bind the HTTP server to.
    /// Override: `STREAMING_PORT`
    pub bind_port: u16,

    /// Address to bind the HTTP server to.
    pub bind_address: IpAddr,

    /// Browser origins allowed by CORS.
    /// Override: `FRONTEND_ORIGINS` (comma separated)
    pub allowed_origins: Vec<String>,

    /// Song manifest (YAML).
    /// Override: `ENCORE_CATALOG`
    pub catalog_path: PathBuf,

    pub streaming: StreamingConfig,
    pub broker: BrokerConfig,
    pub source: SourceConfig,
    pub auth: AuthConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_port: 8001,
            bind_address: IpAddr::from([0, 0, 0, 0]),
            allowed_origins: split_list(DEFAULT_ORIGINS),
            catalog_path: PathBuf::from("./catalog.yaml"),
            streaming: StreamingConfig::default(),
            broker: BrokerConfig::default(),
            source: SourceConfig::default(),
            auth: AuthConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Loads configuration from a YAML file, then applies environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = if let Some(path) = path {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?
        } else {
            Self::default()
        };

        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Applies overrides from `lookup` (the process environment in production).
    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let var = |key: &str| lookup(key).filter(|v| !v.is_empty());

        if let Some(port) = var("STREAMING_PORT").and_then(|v| v.parse().ok()) {
            self.bind_port = port;
        }
        if let Some(origins) = var("FRONTEND_ORIGINS") {
            self.allowed_origins = split_list(&origins);
        }
        if let Some(path) = var("ENCORE_CATALOG") {
            self.catalog_path = PathBuf::from(path);
        }
        if let Some(secret) = var("JWT_SECRET") {
            self.auth.jwt_secret = secret;
        }
        if let Some(url) = var("RABBITMQ_URL") {
            self.broker.url = url;
        }
        if let Some(path) = var("CONTENT_BASE_PATH") {
            self.source.base_path = PathBuf::from(path);
        }
        if let Some(kind) = var("ENCORE_SOURCE_KIND") {
            match kind.parse() {
                Ok(kind) => self.source.kind = kind,
                Err(e) => log::warn!("Ignoring ENCORE_SOURCE_KIND: {}", e),
            }
        }
        if let Some(url) = var("ENCORE_OBJECT_BASE_URL") {
            self.source.object_base_url = Some(url);
        }
        if let Some(threshold) = var("ENCORE_PLAY_THRESHOLD").and_then(|v| v.parse().ok()) {
            self.streaming.play_threshold = threshold;
        }
    }

    /// Converts to encore-core's Config type.
    pub fn to_core_config(&self) -> encore_core::Config {
        encore_core::Config {
            streaming: self.streaming.clone(),
            broker: self.broker.clone(),
            source: self.source.clone(),
            auth: self.auth.clone(),
            ..Default::default()
        }
    }
}
