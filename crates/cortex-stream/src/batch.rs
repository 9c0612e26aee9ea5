//! Latency-bounded batching of transport-bound content chunks.

use std::time::Duration;

use tokio::time::Instant;

/// Yield once this many bytes are buffered…
const MIN_BATCH_BYTES: usize = 10;
/// …or this long after the last yield, whichever comes first.
const MAX_BATCH_LATENCY: Duration = Duration::from_millis(50);

pub struct ChunkBatcher {
    buffer: String,
    last_yield: Instant,
}

impl ChunkBatcher {
    pub fn new() -> Self {
        Self {
            buffer: String::new(),
            last_yield: Instant::now(),
        }
    }

    /// Buffer `text`; returns a batch when the size or latency bound is hit.
    pub fn push(&mut self, text: &str) -> Option<String> {
        self.buffer.push_str(text);
        if self.buffer.len() >= MIN_BATCH_BYTES
            || self.last_yield.elapsed() >= MAX_BATCH_LATENCY
        {
            return self.take();
        }
        None
    }

    /// Drain whatever is buffered.
    pub fn take(&mut self) -> Option<String> {
        self.last_yield = Instant::now();
        if self.buffer.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.buffer))
        }
    }
}

impl Default for ChunkBatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_small_chunks_accumulate() {
        let mut batcher = ChunkBatcher::new();
        assert_eq!(batcher.push("ab"), None);
        assert_eq!(batcher.push("cd"), None);
        // Crossing the byte bound yields everything buffered.
        assert_eq!(batcher.push("efghij").as_deref(), Some("abcdefghij"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_latency_bound_flushes() {
        let mut batcher = ChunkBatcher::new();
        assert_eq!(batcher.push("ab"), None);
        tokio::time::advance(Duration::from_millis(60)).await;
        assert_eq!(batcher.push("c").as_deref(), Some("abc"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_take_drains_and_resets() {
        let mut batcher = ChunkBatcher::new();
        batcher.push("ab");
        assert_eq!(batcher.take().as_deref(), Some("ab"));
        assert_eq!(batcher.take(), None);
    }
}
