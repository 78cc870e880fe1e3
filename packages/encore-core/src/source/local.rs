use std::io::ErrorKind;
use std::path::PathBuf;

use async_trait::async_trait;

use super::{AudioReader, AudioSource, SourceError};

/// Audio stored as a file on the local filesystem.
#[derive(Debug, Clone)]
pub struct LocalFileSource {
    path: PathBuf,
    size: i64,
}

impl LocalFileSource {
    /// Stats the file to learn its size. Missing files and directories are
    /// reported as [`SourceError::NotFound`].
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, SourceError> {
        let path = path.into();
        let metadata = tokio::fs::metadata(&path)
            .await
            .map_err(|e| map_open_error(e, &path))?;

        if !metadata.is_file() {
            return Err(SourceError::NotFound(path.display().to_string()));
        }

        Ok(Self {
            path,
            size: metadata.len() as i64,
        })
    }
}

#[async_trait]
impl AudioSource for LocalFileSource {
    fn size(&self) -> i64 {
        self.size
    }

    async fn reader(&self) -> Result<Box<dyn AudioReader>, SourceError> {
        let file = tokio::fs::File::open(&self.path)
            .await
            .map_err(|e| map_open_error(e, &self.path))?;
        Ok(Box::new(file))
    }
}

fn map_open_error(err: std::io::Error, path: &std::path::Path) -> SourceError {
    if err.kind() == ErrorKind::NotFound {
        SourceError::NotFound(path.display().to_string())
    } else {
        SourceError::Io(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::io::{AsyncReadExt, AsyncSeekExt};

    #[tokio::test]
    async fn reader_supports_seek() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("track.mp3");
        std::fs::write(&path, b"0123456789").unwrap();

        let source = LocalFileSource::open(&path).await.unwrap();
        assert_eq!(source.size(), 10);

        let mut reader = source.reader().await.unwrap();
        reader.seek(std::io::SeekFrom::Start(6)).await.unwrap();
        let mut rest = String::new();
        reader.read_to_string(&mut rest).await.unwrap();
        assert_eq!(rest, "6789");
    }

    #[tokio::test]
    async fn directory_is_not_audio() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            LocalFileSource::open(dir.path()).await,
            Err(SourceError::NotFound(_))
        ));
    }
}
