//! JSON text framing for terminal and control connections.
//!
//! One message per WebSocket frame. Decoding is strict: an unknown `type`, a
//! missing required field, or a wrongly typed field is an
//! [`TermError::InvalidMessage`].

use crate::error::{TermError, TermResult};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Encode a message as a JSON text frame.
pub fn encode<T: Serialize>(value: &T) -> TermResult<String> {
    serde_json::to_string(value).map_err(|e| TermError::Other(format!("encode failed: {e}")))
}

/// Decode a JSON text frame.
pub fn decode<T: DeserializeOwned>(text: &str) -> TermResult<T> {
    Ok(serde_json::from_str(text)?)
}

/// Decode a frame delivered as raw bytes (e.g. a binary WebSocket frame).
pub fn decode_bytes<T: DeserializeOwned>(data: &[u8]) -> TermResult<T> {
    Ok(serde_json::from_slice(data)?)
}

/// Splits a byte stream into valid UTF-8 text without breaking multi-byte
/// characters across chunk boundaries.
///
/// An incomplete sequence at the end of a chunk is held back and prepended to
/// the next one. Bytes that can never form valid UTF-8 are replaced with
/// U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return all text that is complete so far.
    pub fn push(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        let keep = incomplete_tail(&self.pending);
        let split = self.pending.len() - keep;
        let text = String::from_utf8_lossy(&self.pending[..split]).into_owned();
        self.pending.drain(..split);
        text
    }

    /// Flush any held-back bytes (lossily).
    pub fn finish(&mut self) -> String {
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        text
    }
}

/// Length of a trailing, still-incomplete UTF-8 sequence in `buf`.
fn incomplete_tail(buf: &[u8]) -> usize {
    // A UTF-8 sequence is at most 4 bytes, so only the last 3 can be pending.
    let start = buf.len().saturating_sub(3);
    for i in (start..buf.len()).rev() {
        let b = buf[i];
        if b & 0xC0 == 0x80 {
            continue;
        }
        let needed = match b {
            0xC2..=0xDF => 2,
            0xE0..=0xEF => 3,
            0xF0..=0xF4 => 4,
            _ => return 0,
        };
        let have = buf.len() - i;
        return if have < needed { have } else { 0 };
    }
    0
}
