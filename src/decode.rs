//! Buffered decoding of newline-delimited JSON byte streams.
//!
//! Transports hand over bytes at arbitrary boundaries; a single JSON line
//! is routinely split across chunks. [`NdjsonDecoder`] accumulates bytes,
//! yields complete lines as values, and can recover a truncated trailing
//! object at flush time. [`ndjson_producer`] packages the decoder as a
//! [`ProducerStream`] for byte-based transports.

use futures::Stream;
use serde_json::Value;

use crate::error::Result;
use crate::producer::ProducerStream;
use crate::repair::auto_correct;

/// Buffered decoder for NDJSON streams.
///
/// # Example
///
/// ```
/// use streamguard::decode::NdjsonDecoder;
///
/// let mut decoder = NdjsonDecoder::new();
/// assert!(decoder.decode(b"{\"response\":").is_empty());
/// let values = decoder.decode(b"\"hello\"}\n");
/// assert_eq!(values[0]["response"], "hello");
/// ```
#[derive(Debug, Default)]
pub struct NdjsonDecoder {
    buffer: String,
}

impl NdjsonDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a raw chunk and return any complete JSON lines.
    ///
    /// Incomplete lines stay buffered; lines that fail to parse are
    /// dropped.
    pub fn decode(&mut self, chunk: &[u8]) -> Vec<Value> {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));

        let mut values = Vec::new();
        while let Some(pos) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=pos).collect();
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if let Ok(value) = serde_json::from_str::<Value>(line) {
                values.push(value);
            }
        }
        values
    }

    /// Parse whatever remains after the stream ended.
    ///
    /// Tries a direct parse first, then the auto-correction pipeline for
    /// truncated trailing objects.
    pub fn flush(&mut self) -> Option<Value> {
        let remaining = std::mem::take(&mut self.buffer);
        let remaining = remaining.trim();
        if remaining.is_empty() {
            return None;
        }
        if let Ok(value) = serde_json::from_str::<Value>(remaining) {
            return Some(value);
        }
        let (corrected, corrections) = auto_correct(remaining);
        if corrections.is_empty() {
            return None;
        }
        serde_json::from_str::<Value>(&corrected).ok()
    }
}

/// Wrap a byte stream into a [`ProducerStream`] of decoded NDJSON values.
pub fn ndjson_producer<S>(bytes: S) -> ProducerStream
where
    S: Stream<Item = Result<Vec<u8>>> + Send + 'static,
{
    Box::pin(async_stream::stream! {
        use futures::StreamExt;
        futures::pin_mut!(bytes);
        let mut decoder = NdjsonDecoder::new();
        while let Some(chunk) = bytes.next().await {
            match chunk {
                Ok(chunk) => {
                    for value in decoder.decode(&chunk) {
                        yield Ok(value);
                    }
                }
                Err(e) => {
                    yield Err(e);
                    return;
                }
            }
        }
        if let Some(value) = decoder.flush() {
            yield Ok(value);
        }
    })
}
