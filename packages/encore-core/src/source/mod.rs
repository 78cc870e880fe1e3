//! Audio byte sources.
//!
//! An [`AudioSource`] is "a seekable, closeable byte stream of known length".
//! The responder never learns where the bytes live: [`SourceFactory`] picks
//! the implementation from a [`SourceKind`] tag, so adding an origin means
//! adding a variant here and nothing in the HTTP layer.

mod local;
mod object;

pub use local::LocalFileSource;
pub use object::{ObjectReader, ObjectSource};

use std::fmt;
use std::path::{Component, Path};
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncSeek};

use crate::config::SourceConfig;

/// Errors opening or reading an audio source.
#[derive(Debug, Error)]
pub enum SourceError {
    /// The underlying audio bytes do not exist.
    #[error("audio not found: {0}")]
    NotFound(String),

    #[error("audio I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Object storage returned an unexpected response.
    #[error("object storage error: {0}")]
    Http(String),

    /// The configured source type has no implementation.
    #[error("unsupported source type: {0}")]
    Unsupported(String),
}

/// Seekable byte stream handed out by a source.
///
/// Dropping the reader releases the underlying handle (file descriptor or
/// in-flight HTTP request).
pub trait AudioReader: AsyncRead + AsyncSeek + Send + Unpin {}

impl<T: AsyncRead + AsyncSeek + Send + Unpin> AudioReader for T {}

/// A resolved audio resource of known size.
#[async_trait]
pub trait AudioSource: Send + Sync {
    /// Total size of the resource in bytes.
    fn size(&self) -> i64;

    /// Opens a fresh reader positioned at offset 0.
    async fn reader(&self) -> Result<Box<dyn AudioReader>, SourceError>;
}

/// Resolves a storage key into an [`AudioSource`].
#[async_trait]
pub trait AudioOpener: Send + Sync {
    async fn open(&self, key: &str) -> Result<Box<dyn AudioSource>, SourceError>;
}

/// Tag selecting the physical origin of audio bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// Files under a local directory.
    Local,
    /// Objects in an HTTP-reachable bucket.
    Object,
}

impl SourceKind {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Object => "object",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceKind {
    type Err = SourceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "object" | "s3" => Ok(Self::Object),
            other => Err(SourceError::Unsupported(other.to_string())),
        }
    }
}

/// Factory selecting the source implementation from configuration.
pub struct SourceFactory {
    config: SourceConfig,
    http: reqwest::Client,
}

impl SourceFactory {
    pub fn new(config: SourceConfig, http: reqwest::Client) -> Self {
        Self { config, http }
    }

    pub fn kind(&self) -> SourceKind {
        self.config.kind
    }
}

#[async_trait]
impl AudioOpener for SourceFactory {
    async fn open(&self, key: &str) -> Result<Box<dyn AudioSource>, SourceError> {
        if !is_relative_key(key) {
            return Err(SourceError::NotFound(key.to_string()));
        }

        match self.config.kind {
            SourceKind::Local => {
                let path = self.config.base_path.join(key);
                Ok(Box::new(LocalFileSource::open(path).await?))
            }
            SourceKind::Object => {
                let base = self.config.object_base_url.as_deref().ok_or_else(|| {
                    SourceError::Unsupported("object source without object_base_url".into())
                })?;
                let url = format!("{}/{}", base.trim_end_matches('/'), key);
                Ok(Box::new(ObjectSource::open(self.http.clone(), url).await?))
            }
        }
    }
}

/// Storage keys must stay inside the source root.
fn is_relative_key(key: &str) -> bool {
    !key.is_empty()
        && Path::new(key)
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;

    #[test]
    fn source_kind_parses_tags() {
        assert_eq!("local".parse::<SourceKind>().unwrap(), SourceKind::Local);
        assert_eq!(" Object ".parse::<SourceKind>().unwrap(), SourceKind::Object);
        assert_eq!("s3".parse::<SourceKind>().unwrap(), SourceKind::Object);
        assert!(matches!(
            "cdn".parse::<SourceKind>(),
            Err(SourceError::Unsupported(_))
        ));
    }

    #[test]
    fn keys_escaping_the_root_are_rejected() {
        assert!(is_relative_key("albums/1/track.mp3"));
        assert!(!is_relative_key("../etc/passwd"));
        assert!(!is_relative_key("/etc/passwd"));
        assert!(!is_relative_key("a/../../b"));
        assert!(!is_relative_key(""));
    }

    #[tokio::test]
    async fn factory_opens_local_files_under_base_path() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("songs")).unwrap();
        std::fs::write(dir.path().join("songs/a.mp3"), b"ID3 audio bytes").unwrap();

        let factory = SourceFactory::new(
            SourceConfig {
                kind: SourceKind::Local,
                base_path: dir.path().to_path_buf(),
                object_base_url: None,
            },
            reqwest::Client::new(),
        );

        let source = factory.open("songs/a.mp3").await.unwrap();
        assert_eq!(source.size(), 15);

        let mut reader = source.reader().await.unwrap();
        let mut contents = Vec::new();
        reader.read_to_end(&mut contents).await.unwrap();
        assert_eq!(contents, b"ID3 audio bytes");

        assert!(matches!(
            factory.open("songs/missing.mp3").await,
            Err(SourceError::NotFound(_))
        ));
        assert!(matches!(
            factory.open("../a.mp3").await,
            Err(SourceError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn object_kind_requires_base_url() {
        let factory = SourceFactory::new(
            SourceConfig {
                kind: SourceKind::Object,
                base_path: Default::default(),
                object_base_url: None,
            },
            reqwest::Client::new(),
        );
        assert!(matches!(
            factory.open("a.mp3").await,
            Err(SourceError::Unsupported(_))
        ));
    }
}
