//! JSON-RPC framing over stdio.
//!
//! Wire format: `Content-Length: <N>\r\n\r\n<N bytes of JSON>`. The length
//! counts bytes of the body, never characters; bodies routinely contain
//! non-ASCII text. A malformed frame (missing `Content-Length`, unparseable
//! body) is drained from the buffer and reported, and parsing continues
//! with the next frame.

use serde_json::Value;

use super::LspError;

const HEADER_SEPARATOR: &[u8] = b"\r\n\r\n";

/// Encode one outgoing message with its `Content-Length` preamble.
pub fn encode_frame(msg: &Value) -> Vec<u8> {
    let body = serde_json::to_vec(msg).expect("JSON value serializes");
    let mut out = Vec::with_capacity(body.len() + 32);
    out.extend_from_slice(format!("Content-Length: {}\r\n\r\n", body.len()).as_bytes());
    out.extend_from_slice(&body);
    out
}

/// Accumulates incoming bytes and yields complete frames.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: Vec<u8>,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Try to parse the next complete frame.
    ///
    /// `Ok(None)` means more bytes are needed. `Err` means a malformed frame
    /// was discarded; the buffer has advanced past it and the caller should
    /// keep polling.
    pub fn next_frame(&mut self) -> Result<Option<Value>, LspError> {
        let Some(header_end) = find(&self.buf, HEADER_SEPARATOR) else {
            return Ok(None);
        };
        let body_start = header_end + HEADER_SEPARATOR.len();

        let headers = String::from_utf8_lossy(&self.buf[..header_end]).to_string();
        let Some(content_length) = parse_content_length(&headers) else {
            // Drop the bad header block and resynchronize.
            self.buf.drain(..body_start);
            return Err(LspError::Protocol(
                "frame header missing Content-Length".to_string(),
            ));
        };

        if self.buf.len() < body_start + content_length {
            return Ok(None);
        }

        let body = self.buf[body_start..body_start + content_length].to_vec();
        self.buf.drain(..body_start + content_length);

        match serde_json::from_slice::<Value>(&body) {
            Ok(msg) => Ok(Some(msg)),
            Err(e) => Err(LspError::Protocol(format!("unparseable frame body: {e}"))),
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn parse_content_length(headers: &str) -> Option<usize> {
    headers.split("\r\n").find_map(|line| {
        let (name, value) = line.split_once(':')?;
        if name.trim().eq_ignore_ascii_case("content-length") {
            value.trim().parse().ok()
        } else {
            None
        }
    })
}
