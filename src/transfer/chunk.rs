//! Chunk sizing and per-request byte windows.

use std::fmt;

use crate::error::{ApiError, ErrorKind};

/// Upload chunks must be a multiple of this many bytes (320 KiB).
pub const UPLOAD_CHUNK_ALIGNMENT: u64 = 327_680;

/// Largest upload chunk the service accepts (60 MiB, a multiple of the alignment).
pub const MAX_UPLOAD_CHUNK_SIZE: u64 = 192 * UPLOAD_CHUNK_ALIGNMENT;

/// Default upload chunk size (10 MiB).
pub const DEFAULT_UPLOAD_CHUNK_SIZE: u64 = 32 * UPLOAD_CHUNK_ALIGNMENT;

/// Default download chunk size (10 MiB).
pub const DEFAULT_DOWNLOAD_CHUNK_SIZE: u64 = 10 * 1024 * 1024;

/// A validated upload chunk size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadChunkSize(u64);

impl UploadChunkSize {
    /// Validates `bytes` against the alignment and maximum.
    ///
    /// # Errors
    ///
    /// [`ErrorKind::InvalidRequest`] if `bytes` is zero, not a multiple of
    /// [`UPLOAD_CHUNK_ALIGNMENT`], or above [`MAX_UPLOAD_CHUNK_SIZE`].
    pub fn new(bytes: u64) -> Result<Self, ApiError> {
        if bytes == 0 || bytes % UPLOAD_CHUNK_ALIGNMENT != 0 || bytes > MAX_UPLOAD_CHUNK_SIZE {
            return Err(ApiError::new(
                ErrorKind::InvalidRequest,
                format!(
                    "upload chunk size {bytes} must be a non-zero multiple of {UPLOAD_CHUNK_ALIGNMENT} no larger than {MAX_UPLOAD_CHUNK_SIZE}"
                ),
            ));
        }
        Ok(Self(bytes))
    }

    /// Rounds `bytes` down to the nearest valid size, clamped to the bounds.
    #[must_use]
    pub fn aligned_down(bytes: u64) -> Self {
        let aligned = (bytes / UPLOAD_CHUNK_ALIGNMENT) * UPLOAD_CHUNK_ALIGNMENT;
        Self(aligned.clamp(UPLOAD_CHUNK_ALIGNMENT, MAX_UPLOAD_CHUNK_SIZE))
    }

    /// Size in bytes.
    #[must_use]
    pub fn get(self) -> u64 {
        self.0
    }
}

impl Default for UploadChunkSize {
    fn default() -> Self {
        Self(DEFAULT_UPLOAD_CHUNK_SIZE)
    }
}

/// One request's byte window: `start..=end` of a `total`-byte file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPlan {
    /// First byte.
    pub start: u64,
    /// Last byte, inclusive.
    pub end: u64,
    /// File size.
    pub total: u64,
}

impl ChunkPlan {
    /// Plans the window following `offset`, or `None` when nothing remains.
    #[must_use]
    pub fn next(offset: u64, chunk_size: u64, total: u64) -> Option<Self> {
        if offset >= total || chunk_size == 0 {
            return None;
        }
        let end = offset.saturating_add(chunk_size).min(total) - 1;
        Some(Self {
            start: offset,
            end,
            total,
        })
    }

    /// Bytes in the window.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// Always false: a plan covers at least one byte.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Whether this window ends at the last byte of the file.
    #[must_use]
    pub fn is_final(&self) -> bool {
        self.end + 1 == self.total
    }

    /// Offset just past this window.
    #[must_use]
    pub fn next_offset(&self) -> u64 {
        self.end + 1
    }

    /// Upload header value: `bytes {start}-{end}/{total}`.
    #[must_use]
    pub fn content_range(&self) -> String {
        format!("bytes {}-{}/{}", self.start, self.end, self.total)
    }

    /// Download header value: `bytes={start}-{end}`.
    #[must_use]
    pub fn range(&self) -> String {
        format!("bytes={}-{}", self.start, self.end)
    }
}

impl fmt::Display for ChunkPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}/{}", self.start, self.end, self.total)
    }
}

/// Parses a `Content-Range: bytes {start}-{end}/{total|*}` response header.
#[must_use]
pub fn parse_content_range(value: &str) -> Option<(u64, u64, Option<u64>)> {
    let rest = value.trim().strip_prefix("bytes")?.trim_start();
    let (window, total) = rest.split_once('/')?;
    let (start, end) = window.split_once('-')?;
    let total = match total.trim() {
        "*" => None,
        other => Some(other.parse().ok()?),
    };
    Some((start.trim().parse().ok()?, end.trim().parse().ok()?, total))
}

/// Parses the start of a `nextExpectedRanges` entry (`"{start}-"` or `"{start}-{end}"`).
#[must_use]
pub fn parse_range_start(range: &str) -> Option<u64> {
    let start = range.split('-').next()?;
    start.trim().parse().ok()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_upload_chunk_size_validation() {
        assert!(UploadChunkSize::new(UPLOAD_CHUNK_ALIGNMENT).is_ok());
        assert!(UploadChunkSize::new(MAX_UPLOAD_CHUNK_SIZE).is_ok());
        assert!(UploadChunkSize::new(0).is_err());
        assert!(UploadChunkSize::new(UPLOAD_CHUNK_ALIGNMENT + 1).is_err());
        assert!(UploadChunkSize::new(MAX_UPLOAD_CHUNK_SIZE + UPLOAD_CHUNK_ALIGNMENT).is_err());
        assert_eq!(MAX_UPLOAD_CHUNK_SIZE, 60 * 1024 * 1024);
        assert_eq!(UploadChunkSize::default().get() % UPLOAD_CHUNK_ALIGNMENT, 0);
    }

    #[test]
    fn test_aligned_down_clamps() {
        assert_eq!(UploadChunkSize::aligned_down(1).get(), UPLOAD_CHUNK_ALIGNMENT);
        assert_eq!(
            UploadChunkSize::aligned_down(3 * UPLOAD_CHUNK_ALIGNMENT + 17).get(),
            3 * UPLOAD_CHUNK_ALIGNMENT
        );
        assert_eq!(UploadChunkSize::aligned_down(u64::MAX).get(), MAX_UPLOAD_CHUNK_SIZE);
    }

    #[test]
    fn test_plans_cover_file_with_aligned_non_final_chunks() {
        let chunk = 4 * UPLOAD_CHUNK_ALIGNMENT;
        for total in [1, 327_679, 327_680, 1_310_720, 10_000_000, 10_485_761] {
            let mut offset = 0;
            let mut plans = Vec::new();
            while let Some(plan) = ChunkPlan::next(offset, chunk, total) {
                assert_eq!(plan.start, offset);
                offset = plan.next_offset();
                plans.push(plan);
            }
            assert_eq!(offset, total, "plans must cover the whole file");
            let (last, rest) = plans.split_last().unwrap();
            assert!(last.is_final());
            for plan in rest {
                assert_eq!(plan.len() % UPLOAD_CHUNK_ALIGNMENT, 0, "{plan}");
                assert!(!plan.is_final());
            }
        }
    }

    #[test]
    fn test_header_values() {
        let plan = ChunkPlan::next(0, 1_310_720, 10_000_000).unwrap();
        assert_eq!(plan.content_range(), "bytes 0-1310719/10000000");
        assert_eq!(plan.range(), "bytes=0-1310719");
        assert_eq!(plan.len(), 1_310_720);

        let last = ChunkPlan::next(9_175_040, 1_310_720, 10_000_000).unwrap();
        assert_eq!(last.content_range(), "bytes 9175040-9999999/10000000");
        assert_eq!(last.len(), 824_960);
    }

    #[test]
    fn test_no_plan_past_end() {
        assert!(ChunkPlan::next(10, 5, 10).is_none());
        assert!(ChunkPlan::next(0, 5, 0).is_none());
    }

    #[test]
    fn test_parse_content_range() {
        assert_eq!(
            parse_content_range("bytes 0-999/5000"),
            Some((0, 999, Some(5000)))
        );
        assert_eq!(parse_content_range("bytes 10-20/*"), Some((10, 20, None)));
        assert_eq!(parse_content_range("items 0-1/2"), None);
        assert_eq!(parse_content_range("bytes x-1/2"), None);
    }

    #[test]
    fn test_parse_range_start() {
        assert_eq!(parse_range_start("26214400-"), Some(26_214_400));
        assert_eq!(parse_range_start("0-99"), Some(0));
        assert_eq!(parse_range_start("-"), None);
    }
}
