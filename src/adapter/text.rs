//! Adapter for streams of bare string chunks.

use serde_json::Value;

use super::{EventStream, StreamAdapter};
use crate::event::{now_ms, StreamEvent};
use crate::producer::ProducerStream;

/// Treats every string chunk as one token.
///
/// Non-string chunks are skipped. Stream end is the completion signal; no
/// usage accounting is available in this shape.
pub struct TextAdapter;

impl StreamAdapter for TextAdapter {
    fn name(&self) -> &str {
        "text"
    }

    fn has_detector(&self) -> bool {
        true
    }

    fn detect(&self, probe: &Value) -> bool {
        probe.is_string()
    }

    fn wrap(&self, mut raw: ProducerStream) -> EventStream {
        Box::pin(async_stream::stream! {
            use futures::StreamExt;
            while let Some(chunk) = raw.next().await {
                match chunk {
                    Ok(Value::String(value)) => {
                        yield Ok(StreamEvent::Token { value, ts: now_ms() });
                    }
                    Ok(other) => {
                        tracing::debug!(chunk = %other, "text adapter skipping non-string chunk");
                    }
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                }
            }
            yield Ok(StreamEvent::Complete { ts: now_ms(), usage: None });
        })
    }
}
