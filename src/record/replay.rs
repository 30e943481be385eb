//! Deterministic replay of recorded sessions.
//!
//! Replay folds the event log back into session state. Retry events reset
//! accumulated content the same way the live orchestrator does, so the
//! reconstructed content matches the originating session byte-for-byte.
//! Sessions missing a terminal event replay to a partial state with
//! `completed = false`.

use std::sync::Arc;

use super::{EventStore, RecordPayload, RecordedEvent};
use crate::error::Result;
use crate::guardrail::Violation;
use crate::session::Checkpoint;

/// State reconstructed from a recorded stream.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionState {
    pub content: String,
    pub checkpoint: Option<Checkpoint>,
    pub token_count: usize,
    pub retry_attempts: u32,
    pub fallback_index: usize,
    pub violations: Vec<Violation>,
    pub completed: bool,
    pub start_ts: Option<u64>,
}

/// What a corruption check found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CorruptionKind {
    SeqGap,
    MissingStart,
    DuplicateStart,
    TokenIndexRegression,
}

/// One corruption finding, anchored to a sequence number when possible.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorruptionFinding {
    pub kind: CorruptionKind,
    pub seq: Option<u64>,
    pub detail: String,
}

/// The reading half of the event-sourcing layer.
#[derive(Clone)]
pub struct Replayer {
    store: Arc<dyn EventStore>,
}

impl Replayer {
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self { store }
    }

    /// Raw events in `[from_seq, to_seq]` (both inclusive, both optional).
    pub async fn replay(
        &self,
        stream_id: &str,
        from_seq: Option<u64>,
        to_seq: Option<u64>,
    ) -> Result<Vec<RecordedEvent>> {
        let events = self.store.events(stream_id).await?;
        Ok(events
            .into_iter()
            .filter(|e| from_seq.map_or(true, |from| e.seq >= from))
            .filter(|e| to_seq.map_or(true, |to| e.seq <= to))
            .collect())
    }

    /// Fold the full log into a [`SessionState`].
    pub async fn replay_to_state(&self, stream_id: &str) -> Result<SessionState> {
        let events = self.store.events(stream_id).await?;
        let mut state = SessionState::default();

        for event in events {
            match event.event {
                RecordPayload::Start { .. } => {
                    state.start_ts = Some(event.ts);
                }
                RecordPayload::Token { value, index } => {
                    state.content.push_str(&value);
                    state.token_count = index + 1;
                }
                RecordPayload::Checkpoint { index, content } => {
                    state.checkpoint = Some(Checkpoint {
                        content,
                        token_index: index,
                        ts: event.ts,
                    });
                }
                RecordPayload::Complete {
                    content,
                    token_count,
                } => {
                    state.content = content;
                    state.token_count = token_count;
                    state.completed = true;
                }
                RecordPayload::Error { .. } => {}
                RecordPayload::Retry { will_retry, .. } => {
                    state.retry_attempts += 1;
                    if will_retry {
                        // The live session discards the attempt's content.
                        state.content.clear();
                        state.token_count = 0;
                    }
                }
                RecordPayload::Fallback { index } => {
                    state.fallback_index = index;
                }
                RecordPayload::Continuation {
                    token_index,
                    content,
                } => {
                    state.content = content;
                    state.token_count = token_index;
                }
                RecordPayload::Guardrail { violations, .. } => {
                    state.violations.extend(violations);
                }
            }
        }

        Ok(state)
    }

    /// Tokens surviving to the final content, in insertion order, bounded
    /// by an optional inclusive sequence range.
    ///
    /// A continuation contributes its checkpoint prefix as one element, so
    /// joining the yielded strings always reproduces the replayed content.
    pub async fn replay_tokens(
        &self,
        stream_id: &str,
        from_seq: Option<u64>,
        to_seq: Option<u64>,
    ) -> Result<impl Iterator<Item = String>> {
        let events = self.replay(stream_id, from_seq, to_seq).await?;
        let mut tokens: Vec<String> = Vec::new();

        for event in events {
            match event.event {
                RecordPayload::Token { value, .. } => tokens.push(value),
                RecordPayload::Retry { will_retry, .. } if will_retry => tokens.clear(),
                RecordPayload::Continuation { content, .. } => {
                    tokens.clear();
                    if !content.is_empty() {
                        tokens.push(content);
                    }
                }
                _ => {}
            }
        }

        Ok(tokens.into_iter())
    }

    /// Run the corruption checks: sequence contiguity, exactly one start,
    /// token index monotonicity (reset across retries and continuations).
    pub async fn verify(&self, stream_id: &str) -> Result<Vec<CorruptionFinding>> {
        let events = self.store.events(stream_id).await?;
        let mut findings = Vec::new();

        let mut starts = 0usize;
        let mut expected_seq = 0u64;
        let mut last_token_index: Option<usize> = None;

        for event in &events {
            if event.seq != expected_seq {
                findings.push(CorruptionFinding {
                    kind: CorruptionKind::SeqGap,
                    seq: Some(event.seq),
                    detail: format!("expected seq {}, found {}", expected_seq, event.seq),
                });
                expected_seq = event.seq;
            }
            expected_seq += 1;

            match &event.event {
                RecordPayload::Start { .. } => {
                    starts += 1;
                    if starts > 1 {
                        findings.push(CorruptionFinding {
                            kind: CorruptionKind::DuplicateStart,
                            seq: Some(event.seq),
                            detail: "second start event".into(),
                        });
                    }
                }
                RecordPayload::Token { index, .. } => {
                    if let Some(last) = last_token_index {
                        if *index <= last {
                            findings.push(CorruptionFinding {
                                kind: CorruptionKind::TokenIndexRegression,
                                seq: Some(event.seq),
                                detail: format!("token index {} after {}", index, last),
                            });
                        }
                    }
                    last_token_index = Some(*index);
                }
                RecordPayload::Retry { will_retry, .. } if *will_retry => {
                    last_token_index = None;
                }
                RecordPayload::Continuation { token_index, .. } => {
                    last_token_index = token_index.checked_sub(1);
                }
                _ => {}
            }
        }

        if starts == 0 && !events.is_empty() {
            findings.push(CorruptionFinding {
                kind: CorruptionKind::MissingStart,
                seq: None,
                detail: "no start event".into(),
            });
        }

        Ok(findings)
    }
}

impl std::fmt::Debug for Replayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Replayer").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{RetryReason, StreamError};
    use crate::record::{MemoryStore, Recorder};
    use serde_json::json;

    fn fixture() -> (Arc<MemoryStore>, Recorder, Replayer) {
        let store = Arc::new(MemoryStore::new());
        let recorder = Recorder::new(store.clone(), "s1");
        let replayer = Replayer::new(store.clone());
        (store, recorder, replayer)
    }

    #[tokio::test]
    async fn test_replay_to_state_simple_session() {
        let (_, recorder, replayer) = fixture();
        recorder.record_start(json!({})).await.unwrap();
        for (i, t) in ["He", "llo"].iter().enumerate() {
            recorder.record_token(*t, i).await.unwrap();
        }
        recorder.record_complete("Hello", 2).await.unwrap();

        let state = replayer.replay_to_state("s1").await.unwrap();
        assert_eq!(state.content, "Hello");
        assert_eq!(state.token_count, 2);
        assert!(state.completed);
        assert!(state.start_ts.is_some());
    }

    #[tokio::test]
    async fn test_replay_partial_session_not_completed() {
        let (_, recorder, replayer) = fixture();
        recorder.record_start(json!({})).await.unwrap();
        recorder.record_token("half", 0).await.unwrap();

        let state = replayer.replay_to_state("s1").await.unwrap();
        assert_eq!(state.content, "half");
        assert!(!state.completed);
    }

    #[tokio::test]
    async fn test_replay_retry_discards_attempt_content() {
        let (_, recorder, replayer) = fixture();
        recorder.record_start(json!({})).await.unwrap();
        recorder.record_token("garbage", 0).await.unwrap();
        recorder
            .record_error(&StreamError::Network("reset".into()), true)
            .await
            .unwrap();
        recorder
            .record_retry(RetryReason::NetworkError, 1, true)
            .await
            .unwrap();
        recorder.record_token("good", 0).await.unwrap();
        recorder.record_complete("good", 1).await.unwrap();

        let state = replayer.replay_to_state("s1").await.unwrap();
        assert_eq!(state.content, "good");
        assert_eq!(state.retry_attempts, 1);
    }

    #[tokio::test]
    async fn test_replay_continuation_resumes_from_checkpoint() {
        let (_, recorder, replayer) = fixture();
        recorder.record_start(json!({})).await.unwrap();
        for (i, t) in ["The", " ", "quick"].iter().enumerate() {
            recorder.record_token(*t, i).await.unwrap();
        }
        recorder.record_checkpoint(2, "The ").await.unwrap();
        recorder
            .record_retry(RetryReason::NetworkError, 1, true)
            .await
            .unwrap();
        let checkpoint = Checkpoint {
            content: "The ".into(),
            token_index: 2,
            ts: 0,
        };
        recorder.record_continuation(&checkpoint).await.unwrap();
        recorder.record_token("fast", 2).await.unwrap();
        recorder.record_complete("The fast", 3).await.unwrap();

        let state = replayer.replay_to_state("s1").await.unwrap();
        assert_eq!(state.content, "The fast");
        assert_eq!(state.checkpoint.unwrap().content, "The ");
    }

    #[tokio::test]
    async fn test_replay_tokens_identity() {
        let (_, recorder, replayer) = fixture();
        recorder.record_start(json!({})).await.unwrap();
        let tokens = ["He", "llo", " ", "Wo", "rld"];
        for (i, t) in tokens.iter().enumerate() {
            recorder.record_token(*t, i).await.unwrap();
        }
        recorder.record_complete("Hello World", 5).await.unwrap();

        let joined: String = replayer
            .replay_tokens("s1", None, None)
            .await
            .unwrap()
            .collect();
        assert_eq!(joined, "Hello World");
    }

    #[tokio::test]
    async fn test_replay_halfway_by_seq() {
        // START at seq 0, tokens at seqs 1..=7.
        let (_, recorder, replayer) = fixture();
        recorder.record_start(json!({})).await.unwrap();
        let tokens = ["One", " ", "Two", " ", "Three", " ", "Four"];
        for (i, t) in tokens.iter().enumerate() {
            recorder.record_token(*t, i).await.unwrap();
        }

        let replayed: Vec<String> = replayer
            .replay_tokens("s1", None, Some(3))
            .await
            .unwrap()
            .collect();
        assert_eq!(replayed, vec!["One", " ", "Two"]);
        assert_eq!(replayed.concat(), "One Two");
    }

    #[tokio::test]
    async fn test_replay_range_from_and_to() {
        let (_, recorder, replayer) = fixture();
        recorder.record_start(json!({})).await.unwrap();
        for i in 0..5 {
            recorder.record_token(format!("t{i}"), i).await.unwrap();
        }

        let events = replayer.replay("s1", Some(2), Some(4)).await.unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].seq, 2);
        assert_eq!(events[2].seq, 4);
    }

    #[tokio::test]
    async fn test_verify_clean_session() {
        let (_, recorder, replayer) = fixture();
        recorder.record_start(json!({})).await.unwrap();
        recorder.record_token("a", 0).await.unwrap();
        recorder.record_token("b", 1).await.unwrap();
        recorder.record_complete("ab", 2).await.unwrap();

        assert!(replayer.verify("s1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_verify_detects_seq_gap() {
        let store = Arc::new(MemoryStore::new());
        // A store view that drops seq 1, simulating a lost record.
        struct GappyStore(Arc<MemoryStore>);
        #[async_trait::async_trait]
        impl EventStore for GappyStore {
            async fn append(
                &self,
                stream_id: &str,
                payload: RecordPayload,
            ) -> Result<RecordedEvent> {
                self.0.append(stream_id, payload).await
            }
            async fn events(&self, stream_id: &str) -> Result<Vec<RecordedEvent>> {
                let mut events = self.0.events(stream_id).await?;
                events.retain(|e| e.seq != 1);
                Ok(events)
            }
            async fn stream_ids(&self) -> Vec<String> {
                self.0.stream_ids().await
            }
        }

        let recorder = Recorder::new(store.clone(), "s1");
        recorder.record_start(json!({})).await.unwrap();
        recorder.record_token("a", 0).await.unwrap();
        recorder.record_token("b", 1).await.unwrap();

        let replayer = Replayer::new(Arc::new(GappyStore(store)));
        let findings = replayer.verify("s1").await.unwrap();
        assert!(findings.iter().any(|f| f.kind == CorruptionKind::SeqGap));
    }

    #[tokio::test]
    async fn test_verify_detects_duplicate_start() {
        let (_, recorder, replayer) = fixture();
        recorder.record_start(json!({})).await.unwrap();
        recorder.record_start(json!({})).await.unwrap();

        let findings = replayer.verify("s1").await.unwrap();
        assert!(findings
            .iter()
            .any(|f| f.kind == CorruptionKind::DuplicateStart));
    }

    #[tokio::test]
    async fn test_verify_detects_token_regression() {
        let (_, recorder, replayer) = fixture();
        recorder.record_start(json!({})).await.unwrap();
        recorder.record_token("a", 3).await.unwrap();
        recorder.record_token("b", 2).await.unwrap();

        let findings = replayer.verify("s1").await.unwrap();
        assert!(findings
            .iter()
            .any(|f| f.kind == CorruptionKind::TokenIndexRegression));
    }

    #[tokio::test]
    async fn test_verify_token_reset_after_retry_is_clean() {
        let (_, recorder, replayer) = fixture();
        recorder.record_start(json!({})).await.unwrap();
        recorder.record_token("a", 0).await.unwrap();
        recorder.record_token("b", 1).await.unwrap();
        recorder
            .record_retry(RetryReason::ServerError, 1, true)
            .await
            .unwrap();
        recorder.record_token("c", 0).await.unwrap();

        assert!(replayer.verify("s1").await.unwrap().is_empty());
    }
}
