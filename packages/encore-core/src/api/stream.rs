//! Range-aware audio responder.
//!
//! `GET /stream?id=<song>` answers with the whole resource (200) or one byte
//! range (206). A play counts once a listener has received a configurable
//! fraction of the track:
//!
//! - full-body responses count at response start;
//! - partial responses count on the chunk that carries
//!   `(range_start + bytes_sent) / total` across the threshold. The offset term
//!   means a seek past the threshold counts on the first chunk.
//!
//! A chunk counts as sent once the connection writer asks for the next one,
//! or the body ends with every byte handed out. The publish itself is detached from the request, so neither broker latency
//! nor broker failure ever affects the audio bytes.

use std::io::SeekFrom;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::Response;
use bytes::Bytes;
use futures::Stream;
use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncSeekExt, Take};
use tokio_util::io::ReaderStream;

use crate::api::{AppState, AuthenticatedUser};
use crate::error::{EncoreError, EncoreResult};
use crate::events::PlayEvent;
use crate::range::parse_range;
use crate::runtime::TaskSpawner;
use crate::source::AudioReader;

/// Tracks delivered bytes of a partial response against the play threshold.
#[derive(Debug, Clone)]
pub struct PlayThreshold {
    offset: i64,
    total: i64,
    fraction: f64,
    sent: i64,
    reached: bool,
}

impl PlayThreshold {
    /// `offset` is the first byte of the range, `total` the resource size.
    pub fn new(offset: i64, total: i64, fraction: f64) -> Self {
        Self {
            offset,
            total,
            fraction,
            sent: 0,
            reached: false,
        }
    }

    /// Records `n` more delivered bytes.
    ///
    /// Returns `true` exactly once: on the call that first reaches the threshold.
    pub fn advance(&mut self, n: usize) -> bool {
        self.sent += n as i64;
        if self.reached || self.total <= 0 {
            return false;
        }
        let progress = (self.offset + self.sent) as f64 / self.total as f64;
        if progress >= self.fraction {
            self.reached = true;
            return true;
        }
        false
    }

    pub fn reached(&self) -> bool {
        self.reached
    }

    pub fn sent(&self) -> i64 {
        self.sent
    }
}

type PlayCallback = Box<dyn FnOnce() + Send>;

/// The threshold of a partial response and what to run once it is crossed.
struct PlayTrigger {
    threshold: PlayThreshold,
    on_played: Option<PlayCallback>,
}

/// Audio body of one response.
///
/// Reads `len` bytes from the source in fixed-size chunks. A chunk is
/// counted on the next poll, or on end of body when it was the last one. A
/// read error ends the body; the listener sees a truncated response and no
/// play is counted for the unsent remainder. Dropping the body (client gone)
/// releases the source.
pub struct PlayTrackingBody {
    chunks: ReaderStream<Take<Box<dyn AudioReader>>>,
    trigger: Option<PlayTrigger>,
    event: PlayEvent,
    expected: u64,
    delivered: u64,
    /// Length of the chunk handed out last and not yet counted.
    pending: usize,
    counted: bool,
    failed: bool,
}

impl PlayTrackingBody {
    pub fn new(reader: Box<dyn AudioReader>, len: u64, chunk_size: usize, event: PlayEvent) -> Self {
        Self {
            chunks: ReaderStream::with_capacity(reader.take(len), chunk_size.max(1)),
            trigger: None,
            event,
            expected: len,
            delivered: 0,
            pending: 0,
            counted: false,
            failed: false,
        }
    }

    /// Runs `on_played` once `threshold` is crossed.
    pub fn with_trigger(
        mut self,
        threshold: PlayThreshold,
        on_played: impl FnOnce() + Send + 'static,
    ) -> Self {
        self.trigger = Some(PlayTrigger {
            threshold,
            on_played: Some(Box::new(on_played)),
        });
        self
    }

    /// Marks the play as already counted (full-body responses).
    pub fn counted(mut self) -> Self {
        self.counted = true;
        self
    }

    fn settle_pending(&mut self) {
        let len = std::mem::take(&mut self.pending);
        if len > 0 {
            self.record_chunk(len);
        }
    }

    fn record_chunk(&mut self, len: usize) {
        self.delivered += len as u64;
        let Some(trigger) = self.trigger.as_mut() else {
            return;
        };
        if trigger.threshold.advance(len) {
            if let Some(on_played) = trigger.on_played.take() {
                on_played();
            }
            self.counted = true;
        }
    }
}

impl Stream for PlayTrackingBody {
    type Item = std::io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        this.settle_pending();
        match ready!(Pin::new(&mut this.chunks).poll_next(cx)) {
            Some(Ok(chunk)) => {
                this.pending = chunk.len();
                Poll::Ready(Some(Ok(chunk)))
            }
            Some(Err(e)) => {
                log::warn!(
                    "[Stream] Read failed after {} bytes (user={}, song={}): {}",
                    this.delivered,
                    this.event.user_id,
                    this.event.song_id,
                    e
                );
                this.failed = true;
                Poll::Ready(Some(Err(e)))
            }
            None => Poll::Ready(None),
        }
    }
}

impl Drop for PlayTrackingBody {
    fn drop(&mut self) {
        // The server stops polling once Content-Length bytes are out.
        if !self.failed && self.delivered + self.pending as u64 >= self.expected {
            self.settle_pending();
        }

        let complete = self.delivered >= self.expected;
        if complete && !self.failed {
            log::debug!(
                "[Stream] Response complete: user={}, song={}, bytes={}, counted={}",
                self.event.user_id,
                self.event.song_id,
                self.delivered,
                self.counted
            );
        } else {
            log::info!(
                "[Stream] Response ended early: user={}, song={}, bytes={}/{}, counted={}",
                self.event.user_id,
                self.event.song_id,
                self.delivered,
                self.expected,
                self.counted
            );
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    id: Option<String>,
}

/// `GET /stream?id=<song>`
pub async fn stream_song(
    State(state): State<AppState>,
    AuthenticatedUser(principal): AuthenticatedUser,
    Query(query): Query<StreamQuery>,
    headers: HeaderMap,
) -> EncoreResult<Response> {
    let song_id = parse_song_id(query.id.as_deref())?;
    let key = state.catalog.resolve_song_key(song_id).await?;
    let source = state.audio.open(&key).await?;
    let size = source.size();
    let mut reader = source.reader().await?;

    let event = PlayEvent::new(principal.user_id, song_id);
    let streaming = &state.streaming;

    let range_header = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty());

    let response = Response::builder()
        .header(header::ACCEPT_RANGES, "bytes")
        .header(header::CONTENT_TYPE, streaming.content_type.as_str())
        .header(header::CACHE_CONTROL, "no-cache");

    let Some(raw_range) = range_header else {
        log::info!(
            "[Stream] Full response: user={}, song={}, size={}",
            principal.user_id,
            song_id,
            size
        );
        dispatch_play_event(&state, event);

        let body = PlayTrackingBody::new(reader, size as u64, streaming.chunk_size, event).counted();
        return response
            .status(StatusCode::OK)
            .header(header::CONTENT_LENGTH, size.to_string())
            .body(Body::from_stream(body))
            .map_err(|e| EncoreError::Internal(e.to_string()));
    };

    // An end past the resource is clamped; a start past it stays unsatisfiable.
    let mut range = parse_range(Some(raw_range), size);
    range.end = range.end.min(size - 1);
    if !range.is_satisfiable() {
        log::debug!(
            "[Stream] Unsatisfiable range '{}' for song {} ({} bytes)",
            raw_range,
            song_id,
            size
        );
        return Err(EncoreError::RangeNotSatisfiable { size });
    }

    reader
        .seek(SeekFrom::Start(range.start as u64))
        .await
        .map_err(|e| EncoreError::Internal(format!("seek to {} failed: {}", range.start, e)))?;

    log::debug!(
        "[Stream] Partial response: user={}, song={}, range={}-{}/{}",
        principal.user_id,
        song_id,
        range.start,
        range.end,
        size
    );

    let threshold = PlayThreshold::new(range.start, size, streaming.play_threshold);
    let trigger_state = state.clone();
    let body = PlayTrackingBody::new(reader, range.len() as u64, streaming.chunk_size, event)
        .with_trigger(threshold, move || dispatch_play_event(&trigger_state, event));

    response
        .status(StatusCode::PARTIAL_CONTENT)
        .header(header::CONTENT_RANGE, range.content_range())
        .header(header::CONTENT_LENGTH, range.len().to_string())
        .body(Body::from_stream(body))
        .map_err(|e| EncoreError::Internal(e.to_string()))
}

fn parse_song_id(raw: Option<&str>) -> EncoreResult<u64> {
    let raw = raw
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| EncoreError::BadRequest("song id is required".to_string()))?;
    raw.parse()
        .map_err(|_| EncoreError::BadRequest(format!("invalid song id '{}'", raw)))
}

/// Publishes in the background; failures are logged and go no further.
fn dispatch_play_event(state: &AppState, event: PlayEvent) {
    let publisher = state.publisher.clone();
    state.spawner.spawn(async move {
        match publisher.publish(event).await {
            Ok(()) => log::info!(
                "[Stream] Play counted: user={}, song={}",
                event.user_id,
                event.song_id
            ),
            Err(e) => log::warn!(
                "[Stream] Failed to publish play event (user={}, song={}): {}",
                event.user_id,
                event.song_id,
                e
            ),
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::io::Cursor;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn body_over(data: Vec<u8>, chunk_size: usize) -> PlayTrackingBody {
        let len = data.len() as u64;
        PlayTrackingBody::new(Box::new(Cursor::new(data)), len, chunk_size, PlayEvent::new(1, 2))
    }

    #[test]
    fn threshold_fires_once_on_crossing_chunk() {
        let mut threshold = PlayThreshold::new(0, 1000, 0.30);
        assert!(!threshold.advance(100));
        assert!(!threshold.advance(199));
        assert!(threshold.advance(1));
        assert!(!threshold.advance(500));
        assert!(threshold.reached());
        assert_eq!(threshold.sent(), 800);
    }

    #[test]
    fn threshold_counts_range_offset() {
        let mut threshold = PlayThreshold::new(500, 1000, 0.30);
        assert!(threshold.advance(1));
    }

    #[test]
    fn threshold_never_fires_for_empty_resource() {
        let mut threshold = PlayThreshold::new(0, 0, 0.30);
        assert!(!threshold.advance(10));
    }

    #[test]
    fn configured_fraction_is_respected() {
        let mut threshold = PlayThreshold::new(0, 100, 0.5);
        assert!(!threshold.advance(49));
        assert!(threshold.advance(1));
    }

    #[test]
    fn song_id_must_be_present_and_numeric() {
        assert_eq!(parse_song_id(Some("42")).unwrap(), 42);
        assert!(matches!(parse_song_id(None), Err(EncoreError::BadRequest(_))));
        assert!(matches!(parse_song_id(Some("")), Err(EncoreError::BadRequest(_))));
        assert!(matches!(parse_song_id(Some("abc")), Err(EncoreError::BadRequest(_))));
        assert!(matches!(parse_song_id(Some("-1")), Err(EncoreError::BadRequest(_))));
    }

    #[tokio::test]
    async fn body_yields_requested_length_in_chunks() {
        let data: Vec<u8> = (0..=255).cycle().take(1000).collect();
        let body = PlayTrackingBody::new(
            Box::new(Cursor::new(data.clone())),
            300,
            128,
            PlayEvent::new(1, 2),
        );
        let chunks: Vec<Bytes> = body.map(|c| c.unwrap()).collect().await;
        assert_eq!(chunks.iter().map(Bytes::len).collect::<Vec<_>>(), vec![128, 128, 44]);
        assert_eq!(chunks.concat(), data[..300]);
    }

    #[tokio::test]
    async fn trigger_runs_once_when_threshold_crossed() {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let mut body = body_over(vec![0; 1000], 100).with_trigger(
            PlayThreshold::new(0, 1000, 0.30),
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
            },
        );

        // The crossing chunk counts once the next one is requested.
        for _ in 0..3 {
            body.next().await.unwrap().unwrap();
        }
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        body.next().await.unwrap().unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        while body.next().await.is_some() {}
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dropped_body_below_threshold_never_fires() {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let mut body = body_over(vec![0; 1000], 100).with_trigger(
            PlayThreshold::new(0, 1000, 0.30),
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
            },
        );

        body.next().await.unwrap().unwrap();
        drop(body);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    fn counting_trigger(fraction: f64, total: i64) -> (Arc<AtomicUsize>, PlayThreshold, impl FnOnce() + Send + 'static) {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        (fired, PlayThreshold::new(0, total, fraction), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[tokio::test]
    async fn last_chunk_counts_at_end_of_body() {
        let (fired, threshold, on_played) = counting_trigger(1.0, 300);
        let mut body = body_over(vec![0; 300], 100).with_trigger(threshold, on_played);

        for _ in 0..3 {
            body.next().await.unwrap().unwrap();
        }
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        assert!(body.next().await.is_none());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn fully_handed_out_body_counts_when_dropped() {
        let (fired, threshold, on_played) = counting_trigger(1.0, 300);
        let mut body = body_over(vec![0; 300], 100).with_trigger(threshold, on_played);

        for _ in 0..3 {
            body.next().await.unwrap().unwrap();
        }
        drop(body);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unaccepted_chunk_of_partial_body_is_not_counted() {
        let (fired, threshold, on_played) = counting_trigger(0.30, 1000);
        let mut body = body_over(vec![0; 1000], 300).with_trigger(threshold, on_played);

        body.next().await.unwrap().unwrap();
        drop(body);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    /// Serves `data` up to `fail_at`, then fails every read.
    struct FailingDisk {
        data: Cursor<Vec<u8>>,
        fail_at: u64,
    }

    impl tokio::io::AsyncRead for FailingDisk {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut tokio::io::ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            let remaining = self.fail_at.saturating_sub(self.data.position());
            if remaining == 0 {
                return Poll::Ready(Err(std::io::Error::other("disk read failed")));
            }
            let limit = buf.remaining().min(remaining as usize);
            let mut part = tokio::io::ReadBuf::new(buf.initialize_unfilled_to(limit));
            ready!(Pin::new(&mut self.data).poll_read(cx, &mut part))?;
            let n = part.filled().len();
            buf.advance(n);
            Poll::Ready(Ok(()))
        }
    }

    impl tokio::io::AsyncSeek for FailingDisk {
        fn start_seek(mut self: Pin<&mut Self>, position: SeekFrom) -> std::io::Result<()> {
            Pin::new(&mut self.data).start_seek(position)
        }

        fn poll_complete(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<u64>> {
            Pin::new(&mut self.data).poll_complete(cx)
        }
    }

    #[tokio::test]
    async fn read_error_below_threshold_ends_body_without_counting() {
        let (fired, threshold, on_played) = counting_trigger(0.30, 1000);
        let disk = FailingDisk {
            data: Cursor::new(vec![7; 1000]),
            fail_at: 250,
        };
        let mut body = PlayTrackingBody::new(Box::new(disk), 1000, 100, PlayEvent::new(1, 2))
            .with_trigger(threshold, on_played);

        let mut received = 0;
        let error = loop {
            match body.next().await {
                Some(Ok(chunk)) => received += chunk.len(),
                Some(Err(e)) => break e,
                None => panic!("body ended without surfacing the read error"),
            }
        };
        assert_eq!(received, 250);
        assert_eq!(error.to_string(), "disk read failed");

        assert!(body.next().await.is_none());
        drop(body);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
