//! Object storage over HTTP.
//!
//! The size comes from a `HEAD` request. Reads are served by ranged `GET`
//! requests starting at the current position; a seek drops the in-flight
//! body and the next read issues a new request from the new offset.

use std::future::Future;
use std::io::{self, SeekFrom};
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt};
use reqwest::header::{CONTENT_LENGTH, RANGE};
use reqwest::StatusCode;
use tokio::io::{AsyncRead, AsyncSeek, ReadBuf};
use tokio_util::io::StreamReader;

use super::{AudioReader, AudioSource, SourceError};

type PendingResponse = Pin<Box<dyn Future<Output = reqwest::Result<reqwest::Response>> + Send>>;
type BodyReader = StreamReader<BoxStream<'static, io::Result<Bytes>>, Bytes>;

/// Audio stored as an object behind an HTTP endpoint (S3-compatible bucket,
/// CDN origin or presigned URL).
#[derive(Debug, Clone)]
pub struct ObjectSource {
    client: reqwest::Client,
    url: String,
    size: i64,
}

impl ObjectSource {
    /// Issues a `HEAD` request for the object to learn its size.
    pub async fn open(client: reqwest::Client, url: String) -> Result<Self, SourceError> {
        let response = client
            .head(&url)
            .send()
            .await
            .map_err(|e| SourceError::Http(e.to_string()))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(SourceError::NotFound(url));
        }
        if !response.status().is_success() {
            return Err(SourceError::Http(format!(
                "HEAD {} returned {}",
                url,
                response.status()
            )));
        }

        let size = response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<i64>().ok())
            .ok_or_else(|| SourceError::Http(format!("HEAD {} has no Content-Length", url)))?;

        Ok(Self { client, url, size })
    }
}

#[async_trait]
impl AudioSource for ObjectSource {
    fn size(&self) -> i64 {
        self.size
    }

    async fn reader(&self) -> Result<Box<dyn AudioReader>, SourceError> {
        Ok(Box::new(ObjectReader::new(
            self.client.clone(),
            self.url.clone(),
            self.size as u64,
        )))
    }
}

enum ReadState {
    Idle,
    Requesting(PendingResponse),
    Streaming(BodyReader),
}

/// Seekable reader over a remote object.
pub struct ObjectReader {
    client: reqwest::Client,
    url: String,
    size: u64,
    position: u64,
    state: ReadState,
}

impl ObjectReader {
    pub fn new(client: reqwest::Client, url: String, size: u64) -> Self {
        Self {
            client,
            url,
            size,
            position: 0,
            state: ReadState::Idle,
        }
    }

    fn request_from_position(&self) -> PendingResponse {
        let request = self
            .client
            .get(&self.url)
            .header(RANGE, format!("bytes={}-", self.position))
            .send();
        Box::pin(request)
    }
}

fn io_error(err: impl std::fmt::Display) -> io::Error {
    io::Error::other(err.to_string())
}

impl AsyncRead for ObjectReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            match &mut this.state {
                ReadState::Idle => {
                    if this.position >= this.size {
                        return Poll::Ready(Ok(()));
                    }
                    this.state = ReadState::Requesting(this.request_from_position());
                }
                ReadState::Requesting(pending) => {
                    let response = ready!(pending.as_mut().poll(cx)).map_err(io_error)?;
                    let status = response.status();

                    // A 200 for a non-zero offset means the origin ignored the range.
                    let honoured = status == StatusCode::PARTIAL_CONTENT
                        || (status == StatusCode::OK && this.position == 0);
                    if !honoured {
                        this.state = ReadState::Idle;
                        return Poll::Ready(Err(io_error(format!(
                            "GET {} from offset {} returned {}",
                            this.url, this.position, status
                        ))));
                    }

                    let body = response.bytes_stream().map(|r| r.map_err(io_error)).boxed();
                    this.state = ReadState::Streaming(StreamReader::new(body));
                }
                ReadState::Streaming(reader) => {
                    let before = buf.filled().len();
                    ready!(Pin::new(reader).poll_read(cx, buf))?;
                    this.position += (buf.filled().len() - before) as u64;
                    return Poll::Ready(Ok(()));
                }
            }
        }
    }
}

impl AsyncSeek for ObjectReader {
    fn start_seek(self: Pin<&mut Self>, position: SeekFrom) -> io::Result<()> {
        let this = self.get_mut();
        let target = match position {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::End(delta) => this.size.checked_add_signed(delta),
            SeekFrom::Current(delta) => this.position.checked_add_signed(delta),
        };
        let target = target.ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "seek before start of object")
        })?;

        if target != this.position {
            this.position = target;
            this.state = ReadState::Idle;
        }
        Ok(())
    }

    fn poll_complete(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<u64>> {
        Poll::Ready(Ok(self.position))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::Path;
    use axum::http::{HeaderMap, StatusCode as AxumStatus};
    use axum::response::IntoResponse;
    use axum::routing::get;
    use axum::Router;
    use tokio::io::{AsyncReadExt, AsyncSeekExt};

    use crate::range::parse_range;

    const OBJECT: &[u8] = b"the quick brown fox jumps over the lazy dog";

    async fn serve_object(Path(key): Path<String>, headers: HeaderMap) -> axum::response::Response {
        if key != "song.mp3" {
            return AxumStatus::NOT_FOUND.into_response();
        }
        let total = OBJECT.len() as i64;
        match headers.get("range").and_then(|v| v.to_str().ok()) {
            Some(range) => {
                let r = parse_range(Some(range), total);
                let body = OBJECT[r.start as usize..=r.end as usize].to_vec();
                (
                    AxumStatus::PARTIAL_CONTENT,
                    [("content-range", r.content_range())],
                    body,
                )
                    .into_response()
            }
            None => OBJECT.to_vec().into_response(),
        }
    }

    async fn start_bucket() -> String {
        let app = Router::new().route("/bucket/{key}", get(serve_object));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}/bucket", addr)
    }

    #[tokio::test]
    async fn head_reports_size_and_missing_objects() {
        let base = start_bucket().await;
        let client = reqwest::Client::new();

        let source = ObjectSource::open(client.clone(), format!("{}/song.mp3", base))
            .await
            .unwrap();
        assert_eq!(source.size(), OBJECT.len() as i64);

        assert!(matches!(
            ObjectSource::open(client, format!("{}/other.mp3", base)).await,
            Err(SourceError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn reader_seeks_with_ranged_requests() {
        let base = start_bucket().await;
        let source = ObjectSource::open(reqwest::Client::new(), format!("{}/song.mp3", base))
            .await
            .unwrap();

        let mut reader = source.reader().await.unwrap();
        let mut head = [0u8; 9];
        reader.read_exact(&mut head).await.unwrap();
        assert_eq!(&head, b"the quick");

        reader.seek(SeekFrom::Start(35)).await.unwrap();
        let mut tail = Vec::new();
        reader.read_to_end(&mut tail).await.unwrap();
        assert_eq!(tail, b"lazy dog");
    }
}
