//! Adapter for OpenAI-style chat completion delta chunks.
//!
//! Chunk shape: `{"choices": [{"delta": {"content": "..."}, "finish_reason": null}]}`,
//! with tool calls carried in `delta.tool_calls` and token accounting in a
//! trailing `usage` object.

use serde_json::Value;

use super::{EventStream, StreamAdapter};
use crate::event::{now_ms, StreamEvent, TokenUsage};
use crate::producer::ProducerStream;

/// Translates OpenAI `/v1/chat/completions` stream chunks.
pub struct OpenAiAdapter;

impl OpenAiAdapter {
    fn usage_of(chunk: &Value) -> Option<TokenUsage> {
        let usage = chunk.get("usage")?;
        Some(TokenUsage {
            prompt_tokens: usage.get("prompt_tokens").and_then(Value::as_u64)?,
            completion_tokens: usage
                .get("completion_tokens")
                .and_then(Value::as_u64)
                .unwrap_or(0),
        })
    }
}

impl StreamAdapter for OpenAiAdapter {
    fn name(&self) -> &str {
        "openai"
    }

    fn has_detector(&self) -> bool {
        true
    }

    fn detect(&self, probe: &Value) -> bool {
        probe
            .get("choices")
            .and_then(Value::as_array)
            .is_some_and(|choices| !choices.is_empty())
    }

    fn wrap(&self, mut raw: ProducerStream) -> EventStream {
        Box::pin(async_stream::stream! {
            use futures::StreamExt;
            let mut usage: Option<TokenUsage> = None;

            while let Some(chunk) = raw.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                };

                if let Some(u) = Self::usage_of(&chunk) {
                    usage = Some(u);
                }

                let Some(choice) = chunk
                    .get("choices")
                    .and_then(Value::as_array)
                    .and_then(|c| c.first())
                else {
                    continue;
                };

                if let Some(delta) = choice.get("delta") {
                    if let Some(text) = delta.get("content").and_then(Value::as_str) {
                        if !text.is_empty() {
                            yield Ok(StreamEvent::Token {
                                value: text.to_string(),
                                ts: now_ms(),
                            });
                        }
                    }
                    if let Some(calls) = delta.get("tool_calls").and_then(Value::as_array) {
                        for call in calls {
                            let name = call
                                .pointer("/function/name")
                                .and_then(Value::as_str)
                                .unwrap_or_default()
                                .to_string();
                            let id = call
                                .get("id")
                                .and_then(Value::as_str)
                                .unwrap_or_default()
                                .to_string();
                            let args = call
                                .pointer("/function/arguments")
                                .cloned()
                                .unwrap_or(Value::Null);
                            yield Ok(StreamEvent::ToolCall {
                                name,
                                id,
                                args,
                                ts: now_ms(),
                            });
                        }
                    }
                }

            }

            // finish_reason may arrive before the usage-only trailer chunk,
            // so Complete is emitted at stream end rather than on the marker.
            yield Ok(StreamEvent::Complete { ts: now_ms(), usage });
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use serde_json::json;

    fn raw(chunks: Vec<Value>) -> ProducerStream {
        Box::pin(futures::stream::iter(chunks.into_iter().map(Ok)))
    }

    #[tokio::test]
    async fn test_openai_deltas_and_usage() {
        let events: Vec<_> = OpenAiAdapter
            .wrap(raw(vec![
                json!({"choices": [{"delta": {"content": "Hi"}, "finish_reason": null}]}),
                json!({"choices": [{"delta": {}, "finish_reason": "stop"}]}),
                json!({"choices": [], "usage": {"prompt_tokens": 3, "completion_tokens": 1}}),
            ]))
            .collect()
            .await;

        // usage-only trailer has no choices; Complete still carries it
        let tokens: Vec<&str> = events
            .iter()
            .filter_map(|e| e.as_ref().unwrap().token())
            .collect();
        assert_eq!(tokens, vec!["Hi"]);
        match events.last().unwrap().as_ref().unwrap() {
            StreamEvent::Complete { usage, .. } => {
                assert_eq!(usage.unwrap().prompt_tokens, 3);
            }
            other => panic!("expected Complete, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_openai_tool_calls() {
        let events: Vec<_> = OpenAiAdapter
            .wrap(raw(vec![json!({
                "choices": [{"delta": {"tool_calls": [{
                    "id": "call_1",
                    "function": {"name": "lookup", "arguments": "{\"q\": \"rust\"}"}
                }]}, "finish_reason": null}]
            })]))
            .collect()
            .await;

        match events[0].as_ref().unwrap() {
            StreamEvent::ToolCall { name, id, .. } => {
                assert_eq!(name, "lookup");
                assert_eq!(id, "call_1");
            }
            other => panic!("expected ToolCall, got {other:?}"),
        }
    }

    #[test]
    fn test_openai_detect_requires_nonempty_choices() {
        let adapter = OpenAiAdapter;
        assert!(adapter.detect(&json!({"choices": [{"delta": {}}]})));
        assert!(!adapter.detect(&json!({"choices": []})));
        assert!(!adapter.detect(&json!({"response": "hi"})));
    }
}
