//! Song lookup.
//!
//! The streaming responder only needs a storage key per song; the info
//! endpoint additionally returns album, genre and artist metadata. Song
//! persistence belongs to the content service, so this module exposes the
//! lookup as the [`SongCatalog`] trait plus a read-only manifest-backed
//! implementation.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("song {0} not found")]
    SongNotFound(u64),

    /// The catalog manifest could not be read or parsed.
    #[error("catalog manifest error: {0}")]
    Manifest(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlbumRef {
    pub id: u64,
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenreRef {
    pub id: u64,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtistRef {
    pub id: u64,
    #[serde(default)]
    pub name: String,
}

/// Public song metadata as returned by `GET /song/{id}/info`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SongInfo {
    pub id: u64,
    pub title: String,
    /// Duration in seconds.
    pub duration: u32,
    pub track_number: u32,
    pub audio_url: String,
    pub album: AlbumRef,
    pub genre: GenreRef,
    pub artists: Vec<ArtistRef>,
    /// RFC 3339 creation timestamp.
    pub created_at: String,
}

/// Read-only song lookup.
#[async_trait]
pub trait SongCatalog: Send + Sync {
    /// Returns the storage key of the song's audio bytes.
    async fn resolve_song_key(&self, id: u64) -> Result<String, CatalogError>;

    async fn song_info(&self, id: u64) -> Result<SongInfo, CatalogError>;
}

/// One manifest entry: public metadata plus the private storage key.
#[derive(Debug, Clone, Deserialize)]
pub struct SongRecord {
    /// Key relative to the audio source root.
    pub storage_key: String,
    #[serde(flatten)]
    pub info: SongInfo,
}

#[derive(Debug, Deserialize)]
struct Manifest {
    #[serde(default)]
    songs: Vec<SongRecord>,
}

/// In-memory catalog loaded once from a YAML (or JSON) manifest.
#[derive(Debug, Default)]
pub struct StaticCatalog {
    songs: HashMap<u64, SongRecord>,
}

impl StaticCatalog {
    pub fn new(records: impl IntoIterator<Item = SongRecord>) -> Self {
        Self {
            songs: records.into_iter().map(|r| (r.info.id, r)).collect(),
        }
    }

    /// Parses a manifest of the form `songs: [{storage_key, id, title, ...}]`.
    ///
    /// JSON manifests parse too, since YAML is a superset.
    pub fn from_yaml(content: &str) -> Result<Self, CatalogError> {
        let manifest: Manifest =
            serde_yaml::from_str(content).map_err(|e| CatalogError::Manifest(e.to_string()))?;
        Ok(Self::new(manifest.songs))
    }

    pub fn load(path: &Path) -> Result<Self, CatalogError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| CatalogError::Manifest(format!("{}: {}", path.display(), e)))?;
        let catalog = Self::from_yaml(&content)?;
        log::info!(
            "[Catalog] Loaded {} song(s) from {}",
            catalog.len(),
            path.display()
        );
        Ok(catalog)
    }

    pub fn len(&self) -> usize {
        self.songs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.songs.is_empty()
    }
}

#[async_trait]
impl SongCatalog for StaticCatalog {
    async fn resolve_song_key(&self, id: u64) -> Result<String, CatalogError> {
        self.songs
            .get(&id)
            .map(|r| r.storage_key.clone())
            .ok_or(CatalogError::SongNotFound(id))
    }

    async fn song_info(&self, id: u64) -> Result<SongInfo, CatalogError> {
        self.songs
            .get(&id)
            .map(|r| r.info.clone())
            .ok_or(CatalogError::SongNotFound(id))
    }
}
