//! Decoder for upstream server-sent event streams.
//!
//! Both vendors answer streaming requests with `text/event-stream` bodies:
//!
//! ```text
//! data: {"candidates":[...]}
//!
//! data: {"candidates":[...]}
//!
//! ```
//!
//! Network reads split that text at arbitrary byte offsets, so bytes are
//! buffered until a full line is available. Only `data` fields matter to the
//! relay; `event`, `id`, `retry` and comment lines are dropped.

use bytes::Bytes;
use futures::stream::{Stream, StreamExt};

use super::ProviderError;

/// Longest line accepted before the stream is treated as broken.
pub const DEFAULT_MAX_LINE_BYTES: usize = 1024 * 1024;

/// Incremental SSE parser yielding the `data` payload of each event.
#[derive(Debug)]
pub struct SseDecoder {
    /// Bytes of the current, not yet terminated line.
    line_buf: Vec<u8>,

    /// Prefix of `line_buf` already known to contain no newline.
    scan_from: usize,

    max_line_bytes: usize,

    /// `data` lines of the event being assembled.
    data_lines: Vec<String>,
}

impl Default for SseDecoder {
    fn default() -> Self {
        Self::with_max_line_bytes(DEFAULT_MAX_LINE_BYTES)
    }
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_line_bytes(max_line_bytes: usize) -> Self {
        Self {
            line_buf: Vec::new(),
            scan_from: 0,
            max_line_bytes,
            data_lines: Vec::new(),
        }
    }

    /// Feed raw bytes and return the payloads of every event they complete.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<String>, ProviderError> {
        self.line_buf.extend_from_slice(bytes);

        let mut payloads = Vec::new();
        let mut line_start = 0;
        while let Some(offset) = self.line_buf[self.scan_from..].iter().position(|b| *b == b'\n') {
            let line_end = self.scan_from + offset;
            let line = decode_line(&self.line_buf[line_start..=line_end])?;
            if let Some(payload) = process_line(&mut self.data_lines, line) {
                payloads.push(payload);
            }
            line_start = line_end + 1;
            self.scan_from = line_start;
        }

        self.line_buf.drain(..line_start);
        self.scan_from = self.line_buf.len();

        if self.line_buf.len() > self.max_line_bytes {
            return Err(ProviderError::Stream(format!(
                "SSE line exceeds {} bytes",
                self.max_line_bytes
            )));
        }
        Ok(payloads)
    }

    /// Flush at end of input: an unterminated last line and an event that
    /// never saw its blank line are still delivered.
    pub fn finish(&mut self) -> Result<Option<String>, ProviderError> {
        self.scan_from = 0;
        if !self.line_buf.is_empty() {
            let raw = std::mem::take(&mut self.line_buf);
            let line = decode_line(&raw)?;
            if let Some(payload) = process_line(&mut self.data_lines, line) {
                return Ok(Some(payload));
            }
        }
        Ok(dispatch(&mut self.data_lines))
    }
}

fn process_line(data_lines: &mut Vec<String>, line: &str) -> Option<String> {
    if line.is_empty() {
        return dispatch(data_lines);
    }
    if line.starts_with(':') {
        return None;
    }

    let (field, value) = match line.split_once(':') {
        Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
        None => (line, ""),
    };
    if field == "data" {
        data_lines.push(value.to_string());
    }
    None
}

fn dispatch(data_lines: &mut Vec<String>) -> Option<String> {
    if data_lines.is_empty() {
        return None;
    }
    let payload = data_lines.join("\n");
    data_lines.clear();
    Some(payload)
}

fn decode_line(raw: &[u8]) -> Result<&str, ProviderError> {
    let line = std::str::from_utf8(raw)
        .map_err(|e| ProviderError::Stream(format!("UTF-8 decode error: {e}")))?;
    Ok(line.trim_end_matches(['\n', '\r']))
}

/// Turn a response body into a stream of event payloads.
///
/// The stream ends after the first error.
pub fn sse_payloads<S, E>(byte_stream: S) -> impl Stream<Item = Result<String, ProviderError>> + Send + 'static
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Into<ProviderError> + Send + 'static,
{
    async_stream::stream! {
        let mut decoder = SseDecoder::new();
        let mut byte_stream = std::pin::pin!(byte_stream);

        while let Some(chunk) = byte_stream.next().await {
            let chunk = match chunk {
                Ok(b) => b,
                Err(e) => {
                    yield Err(e.into());
                    return;
                }
            };

            match decoder.feed(&chunk) {
                Ok(payloads) => {
                    for payload in payloads {
                        yield Ok(payload);
                    }
                }
                Err(e) => {
                    yield Err(e);
                    return;
                }
            }
        }

        match decoder.finish() {
            Ok(Some(payload)) => {
                yield Ok(payload);
            }
            Ok(None) => {}
            Err(e) => {
                yield Err(e);
            }
        }
    }
}
