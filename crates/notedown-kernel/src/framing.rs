//! Reassembling NDJSON responses from arbitrarily split reads.

use bytes::BytesMut;
use log::{debug, warn};
use serde_json::Value;

use crate::error::KernelError;
use crate::protocol::Response;

/// Maximum size of a pending partial message: 16 MiB.
pub const MAX_PENDING: usize = 16 * 1024 * 1024;

/// Incremental line reader for the response stream.
///
/// Bytes are buffered until a newline arrives. A complete line that is not
/// valid JSON is kept as a leftover prefix and joined with the next line,
/// since some kernels emit payloads with embedded newlines. Valid JSON with
/// an unknown `type` is passed on as data.
#[derive(Debug, Default)]
pub struct FrameReader {
    buffer: BytesMut,
    leftover: String,
}

impl FrameReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a chunk and return every message it completes.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<Response>, KernelError> {
        self.buffer.extend_from_slice(chunk);

        let mut responses = Vec::new();
        while let Some(newline) = self.buffer.iter().position(|b| *b == b'\n') {
            let line = self.buffer.split_to(newline + 1);
            let line = std::str::from_utf8(&line)
                .map_err(|e| KernelError::ProtocolFraming(format!("invalid UTF-8: {}", e)))?;
            if let Some(response) = self.accept(line.trim_end_matches(['\n', '\r']))? {
                responses.push(response);
            }
        }

        if self.buffer.len() + self.leftover.len() > MAX_PENDING {
            return Err(KernelError::ProtocolFraming(format!(
                "pending message exceeds {} bytes",
                MAX_PENDING
            )));
        }
        Ok(responses)
    }

    /// Signal end of stream. An unterminated final message is still
    /// accepted; anything else left unparsed is an error.
    pub fn finish(mut self) -> Result<Option<Response>, KernelError> {
        let tail = std::mem::take(&mut self.buffer);
        let tail = std::str::from_utf8(&tail)
            .map_err(|e| KernelError::ProtocolFraming(format!("invalid UTF-8: {}", e)))?;
        let tail = tail.trim_end();
        if tail.is_empty() && self.leftover.is_empty() {
            return Ok(None);
        }

        let candidate = std::mem::take(&mut self.leftover) + tail;
        match serde_json::from_str::<Value>(candidate.trim()) {
            Ok(value) => Ok(decode(value)),
            Err(e) => Err(KernelError::ProtocolFraming(format!(
                "incomplete message at end of stream ({} bytes): {}",
                candidate.len(),
                e
            ))),
        }
    }

    /// Whether a partial message is waiting for more input.
    pub fn is_pending(&self) -> bool {
        !self.buffer.is_empty() || !self.leftover.is_empty()
    }

    fn accept(&mut self, line: &str) -> Result<Option<Response>, KernelError> {
        if line.trim().is_empty() && self.leftover.is_empty() {
            return Ok(None);
        }

        let candidate = if self.leftover.is_empty() {
            line.to_string()
        } else {
            std::mem::take(&mut self.leftover) + line
        };
        match serde_json::from_str::<Value>(candidate.trim()) {
            Ok(value) => Ok(decode(value)),
            Err(e) => {
                debug!(
                    "[kernel-client] Holding {} unparsed bytes: {}",
                    candidate.len(),
                    e
                );
                if candidate.len() > MAX_PENDING {
                    return Err(KernelError::ProtocolFraming(format!(
                        "pending message exceeds {} bytes",
                        MAX_PENDING
                    )));
                }
                self.leftover = candidate;
                Ok(None)
            }
        }
    }
}

/// Interpret one complete JSON message. Messages of an unknown type still
/// carry user-facing text in `data`; anything without it is dropped.
fn decode(value: Value) -> Option<Response> {
    let data = value.get("data").and_then(Value::as_str).map(str::to_string);
    match serde_json::from_value::<Response>(value) {
        Ok(response) => Some(response),
        Err(e) => match data {
            Some(data) => {
                debug!("[kernel-client] Treating unknown message as data: {}", e);
                Some(Response::data(data))
            }
            None => {
                warn!("[kernel-client] Ignoring unrecognized message: {}", e);
                None
            }
        },
    }
}
