//! `multipart/x-mixed-replace` framing shared by the broadcast server (encode)
//! and the upstream MJPEG source (decode).
//!
//! Wire layout of one part, as written to viewers:
//!
//! ```text
//! \r\n--frame\r\n
//! Content-Type: image/jpeg\r\n
//! Content-Length: <n>\r\n
//! \r\n
//! <n bytes>\r\n
//! ```

use bytes::{BufMut, Bytes, BytesMut};

/// Boundary token used on every stream this service emits.
pub const BOUNDARY: &str = "frame";

/// Response sent once per viewer after its request has been drained.
pub const RESPONSE_PREAMBLE: &[u8] = b"HTTP/1.1 200 OK\r\n\
Content-Type: multipart/x-mixed-replace; boundary=frame\r\n\
Cache-Control: no-cache, no-store, must-revalidate\r\n\
Connection: close\r\n\
\r\n";

const CRLF: &[u8] = b"\r\n";
const HEADER_END: &[u8] = b"\r\n\r\n";
const MAX_HEADER_LEN: usize = 8 * 1024;
const DEFAULT_MAX_PART_LEN: usize = 16 * 1024 * 1024;

/// Header block preceding a payload of `len` bytes, boundary marker included.
pub fn part_header(len: usize) -> String {
    format!("\r\n--{BOUNDARY}\r\nContent-Type: image/jpeg\r\nContent-Length: {len}\r\n\r\n")
}

/// Encode one complete part into a single contiguous buffer.
///
/// The whole part goes out in one write per viewer, so header and payload of
/// one frame can never be separated by bytes of another.
pub fn encode_part(payload: &[u8]) -> Bytes {
    let header = part_header(payload.len());
    let mut buf = BytesMut::with_capacity(header.len() + payload.len() + CRLF.len());
    buf.put_slice(header.as_bytes());
    buf.put_slice(payload);
    buf.put_slice(CRLF);
    buf.freeze()
}

/// Extract the boundary parameter from a `Content-Type` header value.
pub fn boundary_from_content_type(value: &str) -> Option<String> {
    value
        .split(';')
        .map(str::trim)
        .find_map(|param| {
            let (key, val) = param.split_once('=')?;
            key.trim()
                .eq_ignore_ascii_case("boundary")
                .then(|| val.trim().trim_matches('"').to_string())
        })
        .filter(|b| !b.is_empty())
}

#[derive(Debug, thiserror::Error)]
pub enum MultipartError {
    #[error("part headers exceed {0} bytes")]
    HeaderTooLarge(usize),
    #[error("part body exceeds {0} bytes")]
    PartTooLarge(usize),
    #[error("invalid Content-Length header: {0}")]
    InvalidContentLength(String),
}

/// Parse state for an incoming multipart stream.
enum ParseState {
    /// Looking for the boundary marker `--<boundary>\r\n`.
    SeekingBoundary,
    /// Found boundary, now looking for end of headers `\r\n\r\n`.
    SeekingHeaderEnd,
    /// Collecting body bytes, either a known length or up to the next boundary.
    CollectingBody {
        content_length: Option<usize>,
        scan_from: usize,
    },
}

/// Incremental decoder for `multipart/x-mixed-replace` bodies.
///
/// Feed network chunks with [`push`](Self::push) and drain complete payloads
/// with [`next_part`](Self::next_part). A part whose headers carry
/// `Content-Length` is cut at exactly that length; otherwise the body runs to
/// the next boundary marker with its trailing CRLF stripped.
pub struct MultipartDecoder {
    delimiter: Vec<u8>,
    buffer: BytesMut,
    state: ParseState,
    max_part_len: usize,
}

impl MultipartDecoder {
    pub fn new(boundary: &str) -> Self {
        let boundary = boundary.trim_start_matches("--");
        Self {
            delimiter: format!("--{boundary}\r\n").into_bytes(),
            buffer: BytesMut::with_capacity(256 * 1024),
            state: ParseState::SeekingBoundary,
            max_part_len: DEFAULT_MAX_PART_LEN,
        }
    }

    pub fn with_max_part_len(mut self, max_part_len: usize) -> Self {
        self.max_part_len = max_part_len;
        self
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Return the next complete payload, if one is buffered.
    ///
    /// On error the decoder resynchronises on the next boundary, so callers can
    /// log and keep going.
    pub fn next_part(&mut self) -> Result<Option<Bytes>, MultipartError> {
        loop {
            match self.state {
                ParseState::SeekingBoundary => {
                    let Some(pos) = find_subsequence(&self.buffer, &self.delimiter) else {
                        // Keep a tail in case the boundary spans chunks
                        let keep = self.delimiter.len() - 1;
                        if self.buffer.len() > keep {
                            let _ = self.buffer.split_to(self.buffer.len() - keep);
                        }
                        return Ok(None);
                    };
                    let _ = self.buffer.split_to(pos + self.delimiter.len());
                    self.state = ParseState::SeekingHeaderEnd;
                }
                ParseState::SeekingHeaderEnd => {
                    // A part with no headers at all starts with the blank line.
                    let (headers_len, skip) = if self.buffer.starts_with(CRLF) {
                        (0, CRLF.len())
                    } else if let Some(pos) = find_subsequence(&self.buffer, HEADER_END) {
                        (pos, pos + HEADER_END.len())
                    } else {
                        if self.buffer.len() > MAX_HEADER_LEN {
                            self.state = ParseState::SeekingBoundary;
                            return Err(MultipartError::HeaderTooLarge(MAX_HEADER_LEN));
                        }
                        return Ok(None);
                    };

                    let headers = String::from_utf8_lossy(&self.buffer[..headers_len]).into_owned();
                    let _ = self.buffer.split_to(skip);

                    let content_length = match content_length(&headers) {
                        Ok(len) => len,
                        Err(e) => {
                            self.state = ParseState::SeekingBoundary;
                            return Err(e);
                        }
                    };
                    if content_length.is_some_and(|len| len > self.max_part_len) {
                        self.state = ParseState::SeekingBoundary;
                        return Err(MultipartError::PartTooLarge(self.max_part_len));
                    }
                    self.state = ParseState::CollectingBody {
                        content_length,
                        scan_from: 0,
                    };
                }
                ParseState::CollectingBody {
                    content_length: Some(len),
                    ..
                } => {
                    if self.buffer.len() < len {
                        return Ok(None);
                    }
                    let body = self.buffer.split_to(len).freeze();
                    self.state = ParseState::SeekingBoundary;
                    return Ok(Some(body));
                }
                ParseState::CollectingBody {
                    content_length: None,
                    scan_from,
                } => {
                    let Some(pos) = find_subsequence(&self.buffer[scan_from..], &self.delimiter)
                    else {
                        if self.buffer.len() > self.max_part_len {
                            self.buffer.clear();
                            self.state = ParseState::SeekingBoundary;
                            return Err(MultipartError::PartTooLarge(self.max_part_len));
                        }
                        // Avoid re-scanning old data
                        self.state = ParseState::CollectingBody {
                            content_length: None,
                            scan_from: self.buffer.len().saturating_sub(self.delimiter.len()),
                        };
                        return Ok(None);
                    };

                    let delimiter_at = scan_from + pos;
                    // Strip trailing \r\n before boundary
                    let end = if self.buffer[..delimiter_at].ends_with(CRLF) {
                        delimiter_at - CRLF.len()
                    } else {
                        delimiter_at
                    };
                    let body = self.buffer.split_to(end).freeze();
                    let _ = self.buffer.split_to(delimiter_at - end + self.delimiter.len());
                    // Already past boundary, go to header parsing
                    self.state = ParseState::SeekingHeaderEnd;
                    return Ok(Some(body));
                }
            }
        }
    }
}

fn content_length(headers: &str) -> Result<Option<usize>, MultipartError> {
    for line in headers.split("\r\n") {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        if name.trim().eq_ignore_ascii_case("content-length") {
            let value = value.trim();
            return value
                .parse()
                .map(Some)
                .map_err(|_| MultipartError::InvalidContentLength(value.to_string()));
        }
    }
    Ok(None)
}

/// Find the position of `needle` in `haystack`.
fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
