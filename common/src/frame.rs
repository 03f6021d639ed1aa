use bytes::Bytes;

/// JPEG start-of-image marker.
const JPEG_SOI: [u8; 2] = [0xFF, 0xD8];

/// One encoded still image (JPEG) with capture metadata.
///
/// The payload is an immutable, reference-counted buffer: a sink that needs
/// the bytes after `push` returns clones the handle rather than borrowing
/// producer memory.
#[derive(Debug, Clone)]
pub struct Frame {
    pub data: Bytes,
    pub captured_at_ms: i64,
    pub seq: u64,
}

impl Frame {
    pub fn new(data: impl Into<Bytes>, captured_at_ms: i64, seq: u64) -> Self {
        Self {
            data: data.into(),
            captured_at_ms,
            seq,
        }
    }

    /// Stamp `data` with the current wall-clock time.
    pub fn now(data: impl Into<Bytes>, seq: u64) -> Self {
        Self::new(data, chrono::Utc::now().timestamp_millis(), seq)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Returns true if the payload starts with a JPEG SOI marker.
    pub fn looks_like_jpeg(&self) -> bool {
        self.data.starts_with(&JPEG_SOI)
    }
}
