//! In-process implementation of the shared cache: per-generation state with
//! a broadcast channel per entry for streaming fan-out and reconnect.

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::StreamExt;
use tokio::sync::{broadcast, Mutex};
use tokio::time::Instant;
use tracing::debug;

use cortex_core::error::{CortexError, Result};
use cortex_core::traits::SharedCache;
use cortex_core::types::{
    GenerationState, GenerationStatus, StreamEvent, ToolEvent,
};

/// Entries live this long after their last write.
const ENTRY_TTL: Duration = Duration::from_secs(3600);
/// Event buffer per generation; slow subscribers miss events past this.
const CHANNEL_CAPACITY: usize = 256;

struct Entry {
    state: GenerationState,
    expires_at: Instant,
    events: broadcast::Sender<StreamEvent>,
}

impl Entry {
    fn touch(&mut self) {
        self.expires_at = Instant::now() + ENTRY_TTL;
    }

    fn publish(&self, event: StreamEvent) {
        // No receivers is fine; the entry itself is the durable record.
        let _ = self.events.send(event);
    }
}

/// The in-process shared cache. All mutations lock the whole table, which
/// keeps every publish single-key atomic and totally ordered per entry.
#[derive(Default)]
pub struct MemorySharedCache {
    entries: Mutex<HashMap<String, Entry>>,
    /// conversation id → its single generating message id.
    active: Mutex<HashMap<String, String>>,
}

impl MemorySharedCache {
    pub fn new() -> Self {
        Self::default()
    }

    async fn with_entry<T>(
        &self,
        message_id: &str,
        f: impl FnOnce(&mut Entry) -> T,
    ) -> Result<T> {
        let mut entries = self.entries.lock().await;
        purge_expired(&mut entries);
        let entry = entries
            .get_mut(message_id)
            .ok_or_else(|| CortexError::Store(format!("no generation for message {}", message_id)))?;
        entry.touch();
        Ok(f(entry))
    }

    async fn finish(
        &self,
        message_id: &str,
        status: GenerationStatus,
        error: Option<String>,
        event: StreamEvent,
    ) -> Result<()> {
        let conversation_id = self
            .with_entry(message_id, |entry| {
                entry.state.status = status;
                entry.state.completed_at = Some(Utc::now());
                entry.state.error = error;
                entry.publish(event);
                entry.state.conversation_id.clone()
            })
            .await?;

        let mut active = self.active.lock().await;
        if active.get(&conversation_id).map(String::as_str) == Some(message_id) {
            active.remove(&conversation_id);
        }
        Ok(())
    }
}

fn purge_expired(entries: &mut HashMap<String, Entry>) {
    let now = Instant::now();
    entries.retain(|_, e| e.expires_at > now);
}

impl SharedCache for MemorySharedCache {
    fn start_generation(
        &self,
        conversation_id: &str,
        message_id: &str,
    ) -> BoxFuture<'_, Result<()>> {
        let conversation_id = conversation_id.to_string();
        let message_id = message_id.to_string();
        Box::pin(async move {
            let mut entries = self.entries.lock().await;
            purge_expired(&mut entries);
            let mut active = self.active.lock().await;

            // At most one generating entry per conversation.
            if let Some(existing) = active.get(&conversation_id) {
                let still_generating = entries
                    .get(existing)
                    .map(|e| e.state.status == GenerationStatus::Generating)
                    .unwrap_or(false);
                if still_generating {
                    return Err(CortexError::AlreadyInProgress(conversation_id));
                }
            }

            let (events, _) = broadcast::channel(CHANNEL_CAPACITY);
            entries.insert(
                message_id.clone(),
                Entry {
                    state: GenerationState::started(&conversation_id, &message_id),
                    expires_at: Instant::now() + ENTRY_TTL,
                    events,
                },
            );
            active.insert(conversation_id, message_id);
            Ok(())
        })
    }

    fn append_content(&self, message_id: &str, chunk: &str) -> BoxFuture<'_, Result<()>> {
        let message_id = message_id.to_string();
        let chunk = chunk.to_string();
        Box::pin(async move {
            self.with_entry(&message_id, |entry| {
                entry.state.content.push_str(&chunk);
                entry.publish(StreamEvent::Chunk { content: chunk });
            })
            .await
        })
    }

    fn publish_chunk(&self, message_id: &str, chunk: &str) -> BoxFuture<'_, Result<()>> {
        let message_id = message_id.to_string();
        let chunk = chunk.to_string();
        Box::pin(async move {
            self.with_entry(&message_id, |entry| {
                entry.publish(StreamEvent::Chunk { content: chunk });
            })
            .await
        })
    }

    fn publish_status(
        &self,
        message_id: &str,
        action: &str,
        description: Option<&str>,
    ) -> BoxFuture<'_, Result<()>> {
        let message_id = message_id.to_string();
        let action = action.to_string();
        let description = description.map(str::to_string);
        Box::pin(async move {
            self.with_entry(&message_id, |entry| {
                entry.state.current_status = Some(action.clone());
                entry.publish(StreamEvent::Status {
                    action,
                    description,
                });
            })
            .await
        })
    }

    fn publish_tool_event(&self, message_id: &str, event: ToolEvent) -> BoxFuture<'_, Result<()>> {
        let message_id = message_id.to_string();
        Box::pin(async move {
            self.with_entry(&message_id, |entry| {
                entry.state.tool_events.push(event.clone());
                entry.publish(StreamEvent::ToolEvent { event });
            })
            .await
        })
    }

    fn publish_tool_status(
        &self,
        message_id: &str,
        status: &str,
        action: &str,
    ) -> BoxFuture<'_, Result<()>> {
        let message_id = message_id.to_string();
        let status = status.to_string();
        let action = action.to_string();
        Box::pin(async move {
            self.with_entry(&message_id, |entry| {
                entry.publish(StreamEvent::ToolStatus { status, action });
            })
            .await
        })
    }

    fn publish_thinking_chunk(
        &self,
        message_id: &str,
        chunk: &str,
    ) -> BoxFuture<'_, Result<()>> {
        let message_id = message_id.to_string();
        let chunk = chunk.to_string();
        Box::pin(async move {
            self.with_entry(&message_id, |entry| {
                entry.state.thinking.push_str(&chunk);
                entry.publish(StreamEvent::ThinkingChunk { content: chunk });
            })
            .await
        })
    }

    fn complete_generation(
        &self,
        message_id: &str,
        metadata: Option<serde_json::Value>,
    ) -> BoxFuture<'_, Result<()>> {
        let message_id = message_id.to_string();
        Box::pin(async move {
            if let Some(tokens) = metadata
                .as_ref()
                .and_then(|m| m.get("tokens"))
                .and_then(serde_json::Value::as_u64)
            {
                self.with_entry(&message_id, |entry| entry.state.tokens = Some(tokens))
                    .await?;
            }
            self.finish(
                &message_id,
                GenerationStatus::Completed,
                None,
                StreamEvent::Complete { metadata },
            )
            .await
        })
    }

    fn fail_generation(&self, message_id: &str, error: &str) -> BoxFuture<'_, Result<()>> {
        let message_id = message_id.to_string();
        let error = error.to_string();
        Box::pin(async move {
            self.finish(
                &message_id,
                GenerationStatus::Error,
                Some(error.clone()),
                StreamEvent::Error { error },
            )
            .await
        })
    }

    fn subscribe(
        &self,
        message_id: &str,
    ) -> BoxFuture<'_, Result<BoxStream<'static, StreamEvent>>> {
        let message_id = message_id.to_string();
        Box::pin(async move {
            // Snapshot and subscribe under the same lock the publishers take,
            // so nothing lands between the snapshot and the subscription.
            let (head, receiver) = {
                let mut entries = self.entries.lock().await;
                purge_expired(&mut entries);
                let entry = entries.get(&message_id).ok_or_else(|| {
                    CortexError::Store(format!("no generation for message {}", message_id))
                })?;

                let mut head = vec![StreamEvent::Init {
                    existing_content: if entry.state.content.is_empty() {
                        None
                    } else {
                        Some(entry.state.content.clone())
                    },
                }];

                match entry.state.status {
                    GenerationStatus::Generating => (head, Some(entry.events.subscribe())),
                    GenerationStatus::Completed => {
                        head.push(StreamEvent::Complete { metadata: None });
                        (head, None)
                    }
                    GenerationStatus::Error => {
                        head.push(StreamEvent::Error {
                            error: entry
                                .state
                                .error
                                .clone()
                                .unwrap_or_else(|| "generation failed".into()),
                        });
                        (head, None)
                    }
                }
            };

            debug!(message_id = %message_id, live = receiver.is_some(), "Subscriber attached");

            let head_stream = futures::stream::iter(head);
            match receiver {
                None => Ok(head_stream.boxed()),
                Some(receiver) => {
                    let live = tokio_stream::wrappers::BroadcastStream::new(receiver)
                        .filter_map(|item| async move { item.ok() });
                    let mut done = false;
                    let live = live.take_while(move |event| {
                        let keep = !done;
                        if event.is_terminal() {
                            done = true;
                        }
                        futures::future::ready(keep)
                    });
                    Ok(head_stream.chain(live).boxed())
                }
            }
        })
    }

    fn generation_state(&self, message_id: &str) -> BoxFuture<'_, Option<GenerationState>> {
        let message_id = message_id.to_string();
        Box::pin(async move {
            let mut entries = self.entries.lock().await;
            purge_expired(&mut entries);
            entries.get(&message_id).map(|e| e.state.clone())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cortex_core::types::ToolEventKind;

    #[tokio::test]
    async fn test_lifecycle_accumulates_content() {
        let cache = MemorySharedCache::new();
        cache.start_generation("c1", "m1").await.unwrap();
        cache.append_content("m1", "Hel").await.unwrap();
        cache.append_content("m1", "lo").await.unwrap();
        cache
            .complete_generation("m1", Some(serde_json::json!({"tokens": 7})))
            .await
            .unwrap();

        let state = cache.generation_state("m1").await.unwrap();
        assert_eq!(state.content, "Hello");
        assert_eq!(state.status, GenerationStatus::Completed);
        assert_eq!(state.tokens, Some(7));
        assert!(state.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_second_generation_same_conversation_conflicts() {
        let cache = MemorySharedCache::new();
        cache.start_generation("c1", "m1").await.unwrap();
        let err = cache.start_generation("c1", "m2").await.unwrap_err();
        assert!(matches!(err, CortexError::AlreadyInProgress(_)));

        // After completion the conversation is free again.
        cache.complete_generation("m1", None).await.unwrap();
        cache.start_generation("c1", "m2").await.unwrap();
    }

    #[tokio::test]
    async fn test_subscriber_receives_init_then_live_events() {
        eprintln!("A");
        let cache = MemorySharedCache::new();
        cache.start_generation("c1", "m1").await.unwrap();
        eprintln!("B");
        cache.append_content("m1", "early ").await.unwrap();
        eprintln!("C");

        let mut stream = cache.subscribe("m1").await.unwrap();
        eprintln!("D");
        cache.append_content("m1", "late").await.unwrap();
        eprintln!("E");
        cache.complete_generation("m1", None).await.unwrap();
        eprintln!("F");

        let mut events = Vec::new();
        while let Some(event) = stream.next().await {
            eprintln!("event: {:?}", event);
            events.push(event);
        }
        eprintln!("G");

        assert!(
            matches!(&events[0], StreamEvent::Init { existing_content: Some(c) } if c == "early ")
        );
        assert!(matches!(&events[1], StreamEvent::Chunk { content } if content == "late"));
        assert!(matches!(events.last().unwrap(), StreamEvent::Complete { .. }));
    }

    #[tokio::test]
    async fn test_late_subscriber_gets_full_content() {
        let cache = MemorySharedCache::new();
        cache.start_generation("c1", "m1").await.unwrap();
        cache.append_content("m1", "all of it").await.unwrap();
        cache.complete_generation("m1", None).await.unwrap();

        let events: Vec<StreamEvent> = cache.subscribe("m1").await.unwrap().collect().await;
        assert_eq!(events.len(), 2);
        assert!(
            matches!(&events[0], StreamEvent::Init { existing_content: Some(c) } if c == "all of it")
        );
        assert!(matches!(&events[1], StreamEvent::Complete { .. }));
    }

    #[tokio::test]
    async fn test_failed_generation_reports_error() {
        let cache = MemorySharedCache::new();
        cache.start_generation("c1", "m1").await.unwrap();
        cache.fail_generation("m1", "LM unavailable").await.unwrap();

        let events: Vec<StreamEvent> = cache.subscribe("m1").await.unwrap().collect().await;
        assert!(matches!(&events[1], StreamEvent::Error { error } if error == "LM unavailable"));
    }

    #[tokio::test]
    async fn test_tool_events_ordered() {
        let cache = MemorySharedCache::new();
        cache.start_generation("c1", "m1").await.unwrap();
        for kind in [ToolEventKind::Start, ToolEventKind::Progress, ToolEventKind::Complete] {
            cache
                .publish_tool_event(
                    "m1",
                    ToolEvent::new("t1", "web_search", kind, serde_json::Value::Null),
                )
                .await
                .unwrap();
        }

        let state = cache.generation_state("m1").await.unwrap();
        assert_eq!(state.tool_events.len(), 3);
        assert_eq!(state.tool_events[0].kind, ToolEventKind::Start);
        assert_eq!(state.tool_events[2].kind, ToolEventKind::Complete);
    }

    #[tokio::test]
    async fn test_thinking_accumulates() {
        let cache = MemorySharedCache::new();
        cache.start_generation("c1", "m1").await.unwrap();
        for c in ["p", "l", "a", "n"] {
            cache.publish_thinking_chunk("m1", c).await.unwrap();
        }
        let state = cache.generation_state("m1").await.unwrap();
        assert_eq!(state.thinking, "plan");
    }
}
