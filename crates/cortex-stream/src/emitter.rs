//! The per-request token pipeline: think-tag extraction, batching, and
//! delivery into the shared cache, behind the `TokenSink` seam.

use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::time::Instant;
use tracing::info;

use cortex_core::error::Result;
use cortex_core::traits::{SharedCache, TokenSink};

use crate::batch::ChunkBatcher;
use crate::tokens::{ThinkTagFilter, TokenEvent};

pub struct StreamEmitter {
    cache: Arc<dyn SharedCache>,
    message_id: String,
    state: tokio::sync::Mutex<EmitterState>,
}

struct EmitterState {
    filter: ThinkTagFilter,
    batcher: ChunkBatcher,
    chunks_in: u64,
    chunks_out: u64,
    bytes_out: u64,
    started: Instant,
}

impl StreamEmitter {
    pub fn new(cache: Arc<dyn SharedCache>, message_id: &str) -> Self {
        Self {
            cache,
            message_id: message_id.to_string(),
            state: tokio::sync::Mutex::new(EmitterState {
                filter: ThinkTagFilter::new(),
                batcher: ChunkBatcher::new(),
                chunks_in: 0,
                chunks_out: 0,
                bytes_out: 0,
                started: Instant::now(),
            }),
        }
    }

    async fn dispatch(&self, state: &mut EmitterState, events: Vec<TokenEvent>) -> Result<()> {
        for event in events {
            match event {
                TokenEvent::BeginThinking => {
                    // Any buffered content goes out before the status switch.
                    if let Some(batch) = state.batcher.take() {
                        self.emit(state, &batch).await?;
                    }
                    self.cache
                        .publish_status(&self.message_id, "thinking", None)
                        .await?;
                }
                TokenEvent::Thinking(c) => {
                    self.cache
                        .publish_thinking_chunk(&self.message_id, &c.to_string())
                        .await?;
                }
                TokenEvent::EndThinking => {}
                TokenEvent::ContentSeparator => {
                    // Delivered immediately, outside the batcher, so the
                    // client observes a content event right as thinking
                    // ends. Transport-only: it never enters the durable
                    // content a reconnecting subscriber would snapshot.
                    state.chunks_out += 1;
                    state.bytes_out += 1;
                    self.cache.publish_chunk(&self.message_id, " ").await?;
                }
                TokenEvent::Content(text) => {
                    if let Some(batch) = state.batcher.push(&text) {
                        self.emit(state, &batch).await?;
                    }
                }
            }
        }
        Ok(())
    }

    async fn emit(&self, state: &mut EmitterState, content: &str) -> Result<()> {
        state.chunks_out += 1;
        state.bytes_out += content.len() as u64;
        self.cache.append_content(&self.message_id, content).await
    }
}

impl TokenSink for StreamEmitter {
    fn push(&self, chunk: &str) -> BoxFuture<'_, Result<()>> {
        let chunk = chunk.to_string();
        Box::pin(async move {
            let mut state = self.state.lock().await;
            state.chunks_in += 1;
            let events = state.filter.feed(&chunk);
            self.dispatch(&mut state, events).await
        })
    }

    fn flush(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            let events = state.filter.finish();
            self.dispatch(&mut state, events).await?;
            if let Some(batch) = state.batcher.take() {
                self.emit(&mut state, &batch).await?;
            }

            info!(
                message_id = %self.message_id,
                chunks_in = state.chunks_in,
                chunks_out = state.chunks_out,
                bytes_out = state.bytes_out,
                elapsed_ms = state.started.elapsed().as_millis() as u64,
                "Token stream flushed"
            );
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemorySharedCache;
    use cortex_core::types::StreamEvent;
    use futures::StreamExt;

    async fn run_chunks(chunks: &[&str]) -> (Vec<StreamEvent>, String, String) {
        let cache = Arc::new(MemorySharedCache::new());
        cache.start_generation("c1", "m1").await.unwrap();
        let mut subscription = cache.subscribe("m1").await.unwrap();

        let emitter = StreamEmitter::new(cache.clone(), "m1");
        for chunk in chunks {
            emitter.push(chunk).await.unwrap();
        }
        emitter.flush().await.unwrap();
        cache.complete_generation("m1", None).await.unwrap();

        let mut events = Vec::new();
        while let Some(event) = subscription.next().await {
            events.push(event);
        }
        let state = cache.generation_state("m1").await.unwrap();
        (events, state.content, state.thinking)
    }

    #[tokio::test(start_paused = true)]
    async fn test_thinking_then_content() {
        let (events, content, thinking) = run_chunks(&["<think>plan</think> answer"]).await;

        // Durable content excludes the transport-only separator chunk.
        assert_eq!(content, "answer");
        assert_eq!(thinking, "plan");

        // status{thinking} precedes the four single-char thinking chunks,
        // which precede the first content chunk.
        let status_pos = events
            .iter()
            .position(|e| matches!(e, StreamEvent::Status { action, .. } if action == "thinking"))
            .unwrap();
        let thinking_chunks: Vec<&StreamEvent> = events
            .iter()
            .filter(|e| matches!(e, StreamEvent::ThinkingChunk { .. }))
            .collect();
        assert_eq!(thinking_chunks.len(), 4);
        let first_chunk_pos = events
            .iter()
            .position(|e| matches!(e, StreamEvent::Chunk { .. }))
            .unwrap();
        assert!(status_pos < first_chunk_pos);

        // The first content event is the synthetic single space.
        match &events[first_chunk_pos] {
            StreamEvent::Chunk { content } => assert_eq!(content, " "),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_content_equivalence_without_thinking() {
        let (_, content, thinking) = run_chunks(&["  Hello", " world", "!"]).await;
        assert_eq!(content, "Hello world!");
        assert!(thinking.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_small_chunks_are_batched() {
        let (events, content, _) = run_chunks(&["abcdefghij", "klmnopqrst"]).await;
        assert_eq!(content, "abcdefghijklmnopqrst");
        let chunk_count = events
            .iter()
            .filter(|e| matches!(e, StreamEvent::Chunk { .. }))
            .count();
        // Two ten-byte batches, not twenty single characters.
        assert_eq!(chunk_count, 2);
    }
}
