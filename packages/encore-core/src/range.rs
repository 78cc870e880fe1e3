//! HTTP `Range` header resolution.
//!
//! Resolution is permissive: a header that cannot be parsed
//! degrades to "serve everything" on the affected side instead of failing
//! the request. Satisfiability is checked by the caller.

/// A concrete, inclusive byte interval of a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: i64,
    /// Inclusive end offset.
    pub end: i64,
    /// Total resource size in bytes.
    pub total: i64,
}

impl ByteRange {
    /// The whole resource: `0..=total-1`.
    #[must_use]
    pub const fn full(total: i64) -> Self {
        Self {
            start: 0,
            end: total - 1,
            total,
        }
    }

    /// Returns true when `0 <= start <= end < total`.
    #[must_use]
    pub const fn is_satisfiable(&self) -> bool {
        self.start >= 0 && self.start <= self.end && self.end < self.total
    }

    /// Number of bytes covered by the range.
    #[must_use]
    pub const fn len(&self) -> i64 {
        self.end - self.start + 1
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len() <= 0
    }

    /// Value for the `Content-Range` response header.
    #[must_use]
    pub fn content_range(&self) -> String {
        format!("bytes {}-{}/{}", self.start, self.end, self.total)
    }
}

/// Turns a raw `Range` header and the resource size into a [`ByteRange`].
///
/// - No header (or an empty one) yields the whole resource.
/// - `bytes=<start>-<end>`, either side optional. A missing or unparsable
///   start falls back to 0; a missing or unparsable end falls back to
///   `total - 1`.
///
/// The suffix form `bytes=-N` is not treated as "last N bytes": its start is
/// empty and resolves to 0.
pub fn parse_range(header: Option<&str>, total: i64) -> ByteRange {
    let mut range = ByteRange::full(total);

    let header = match header {
        Some(h) if !h.is_empty() => h,
        _ => return range,
    };

    let spec = header.replacen("bytes=", "", 1);
    let mut parts = spec.split('-');

    if let Some(start) = parts.next().filter(|s| !s.is_empty()) {
        range.start = start.trim().parse().unwrap_or(0);
    }
    if let Some(end) = parts.next().filter(|s| !s.is_empty()) {
        range.end = end.trim().parse().unwrap_or(total - 1);
    }

    range
}
