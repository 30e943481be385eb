//! Adapter for Ollama-style NDJSON chunks.
//!
//! Chunk shape: `{"response": "...", "done": bool}` with optional
//! `eval_count` / `prompt_eval_count` on the final chunk.

use serde_json::Value;

use super::{EventStream, StreamAdapter};
use crate::event::{now_ms, StreamEvent, TokenUsage};
use crate::producer::ProducerStream;

/// Translates Ollama `/api/generate` stream chunks.
pub struct OllamaAdapter;

impl StreamAdapter for OllamaAdapter {
    fn name(&self) -> &str {
        "ollama"
    }

    fn has_detector(&self) -> bool {
        true
    }

    fn detect(&self, probe: &Value) -> bool {
        probe.is_object() && probe.get("response").is_some()
    }

    fn wrap(&self, mut raw: ProducerStream) -> EventStream {
        Box::pin(async_stream::stream! {
            use futures::StreamExt;
            while let Some(chunk) = raw.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                };

                if let Some(text) = chunk.get("response").and_then(Value::as_str) {
                    if !text.is_empty() {
                        yield Ok(StreamEvent::Token {
                            value: text.to_string(),
                            ts: now_ms(),
                        });
                    }
                }

                if chunk.get("done").and_then(Value::as_bool) == Some(true) {
                    let usage = match (
                        chunk.get("prompt_eval_count").and_then(Value::as_u64),
                        chunk.get("eval_count").and_then(Value::as_u64),
                    ) {
                        (None, None) => None,
                        (prompt, completion) => Some(TokenUsage {
                            prompt_tokens: prompt.unwrap_or(0),
                            completion_tokens: completion.unwrap_or(0),
                        }),
                    };
                    yield Ok(StreamEvent::Complete { ts: now_ms(), usage });
                    return;
                }
            }
            // Stream ended without a done marker; complete anyway.
            yield Ok(StreamEvent::Complete { ts: now_ms(), usage: None });
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
    async fn test_ollama_tokens_and_done() {
        let events: Vec<_> = OllamaAdapter
            .wrap(raw(vec![
                json!({"response": "Hello"}),
                json!({"response": " world"}),
                json!({"response": "", "done": true, "eval_count": 2, "prompt_eval_count": 5}),
            ]))
            .collect()
            .await;

        assert_eq!(events.len(), 3);
        assert_eq!(events[0].as_ref().unwrap().token(), Some("Hello"));
        assert_eq!(events[1].as_ref().unwrap().token(), Some(" world"));
        match events[2].as_ref().unwrap() {
            StreamEvent::Complete { usage, .. } => {
                let usage = usage.unwrap();
                assert_eq!(usage.completion_tokens, 2);
                assert_eq!(usage.prompt_tokens, 5);
            }
            other => panic!("expected Complete, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_ollama_completes_on_stream_end_without_done() {
        let events: Vec<_> = OllamaAdapter
            .wrap(raw(vec![json!({"response": "partial"})]))
            .collect()
            .await;

        assert_eq!(events.len(), 2);
        assert!(matches!(
            events[1].as_ref().unwrap(),
            StreamEvent::Complete { usage: None, .. }
        ));
    }

    #[tokio::test]
    async fn test_ollama_final_token_on_done_chunk() {
        let events: Vec<_> = OllamaAdapter
            .wrap(raw(vec![json!({"response": "!", "done": true})]))
            .collect()
            .await;

        assert_eq!(events.len(), 2);
        assert_eq!(events[0].as_ref().unwrap().token(), Some("!"));
        assert!(events[1].as_ref().unwrap().is_terminal());
    }
}
