//! Passthrough adapter for chunks that already carry the canonical event
//! shape (tagged with a `type` field).

use serde_json::Value;

use super::{EventStream, StreamAdapter};
use crate::event::StreamEvent;
use crate::producer::ProducerStream;

const EVENT_TAGS: &[&str] = &["token", "tool_call", "data", "progress", "complete", "error"];

/// Deserializes each chunk directly as a [`StreamEvent`].
pub struct CanonicalAdapter;

impl StreamAdapter for CanonicalAdapter {
    fn name(&self) -> &str {
        "canonical"
    }

    fn has_detector(&self) -> bool {
        true
    }

    fn detect(&self, probe: &Value) -> bool {
        probe
            .get("type")
            .and_then(Value::as_str)
            .is_some_and(|tag| EVENT_TAGS.contains(&tag))
    }

    fn wrap(&self, mut raw: ProducerStream) -> EventStream {
        Box::pin(async_stream::stream! {
            use futures::StreamExt;
            while let Some(chunk) = raw.next().await {
                match chunk {
                    Ok(value) => match serde_json::from_value::<StreamEvent>(value) {
                        Ok(event) => yield Ok(event),
                        Err(e) => {
                            tracing::debug!(error = %e, "canonical adapter skipping malformed chunk");
                        }
                    },
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use serde_json::json;

    #[tokio::test]
    async fn test_canonical_round_trips_events() {
        let raw: ProducerStream = Box::pin(futures::stream::iter(vec![
            Ok(json!({"type": "token", "value": "hey", "ts": 1})),
            Ok(json!({"type": "progress", "percent": 50.0, "ts": 2})),
            Ok(json!({"type": "complete", "ts": 3})),
        ]));

        let events: Vec<_> = CanonicalAdapter.wrap(raw).collect().await;
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].as_ref().unwrap().token(), Some("hey"));
        assert!(events[2].as_ref().unwrap().is_terminal());
    }

    #[tokio::test]
    async fn test_canonical_skips_unknown_tags() {
        let raw: ProducerStream = Box::pin(futures::stream::iter(vec![
            Ok(json!({"type": "mystery"})),
            Ok(json!({"type": "token", "value": "x", "ts": 1})),
        ]));
        let events: Vec<_> = CanonicalAdapter.wrap(raw).collect().await;
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn test_canonical_detect() {
        let adapter = CanonicalAdapter;
        assert!(adapter.detect(&json!({"type": "token", "value": "x", "ts": 1})));
        assert!(!adapter.detect(&json!({"type": "mystery"})));
        assert!(!adapter.detect(&json!("plain")));
    }
}
