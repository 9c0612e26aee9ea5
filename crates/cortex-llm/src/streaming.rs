//! Incremental server-sent-events decoding for provider byte streams.

use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::stream::Stream;

/// One decoded SSE event.
#[derive(Debug, Clone)]
pub struct SseEvent {
    pub event_type: Option<String>,
    pub data: String,
}

/// Stateful decoder fed with arbitrary byte-chunk boundaries.
/// Events are `event:`/`data:` line groups separated by a blank line.
#[derive(Default)]
pub struct SseDecoder {
    buffer: String,
    ready: VecDeque<SseEvent>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk; completed events become available via [`Self::next_event`].
    pub fn feed(&mut self, chunk: &str) {
        self.buffer.push_str(chunk);

        loop {
            // An event ends at a blank line; tolerate CRLF framing.
            let boundary = match (self.buffer.find("\n\n"), self.buffer.find("\r\n\r\n")) {
                (Some(a), Some(b)) if b < a => (b, 4),
                (None, Some(b)) => (b, 4),
                (Some(a), _) => (a, 2),
                (None, None) => break,
            };

            let block: String = self.buffer.drain(..boundary.0 + boundary.1).collect();
            if let Some(event) = Self::decode_block(block.trim_end()) {
                self.ready.push_back(event);
            }
        }
    }

    pub fn next_event(&mut self) -> Option<SseEvent> {
        self.ready.pop_front()
    }

    fn decode_block(block: &str) -> Option<SseEvent> {
        let mut event_type = None;
        let mut data_lines: Vec<&str> = Vec::new();

        for line in block.lines() {
            let line = line.trim_end_matches('\r');
            if line.starts_with(':') {
                continue; // comment / keep-alive
            }
            if let Some(value) = line.strip_prefix("event:") {
                event_type = Some(value.trim_start().to_string());
            } else if let Some(value) = line.strip_prefix("data:") {
                data_lines.push(value.strip_prefix(' ').unwrap_or(value));
            }
        }

        if data_lines.is_empty() {
            return None;
        }
        Some(SseEvent {
            event_type,
            data: data_lines.join("\n"),
        })
    }
}

/// Adapts a `reqwest` byte stream into a stream of SSE events.
pub struct SseStream<S> {
    inner: S,
    decoder: SseDecoder,
}

impl<S> SseStream<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            decoder: SseDecoder::new(),
        }
    }
}

impl<S> Stream for SseStream<S>
where
    S: Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Unpin,
{
    type Item = SseEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        loop {
            if let Some(event) = this.decoder.next_event() {
                return Poll::Ready(Some(event));
            }

            match Pin::new(&mut this.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(bytes))) => {
                    if let Ok(text) = std::str::from_utf8(&bytes) {
                        this.decoder.feed(text);
                    }
                    // Loop: the chunk may or may not have completed an event.
                }
                Poll::Ready(Some(Err(_))) | Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(decoder: &mut SseDecoder) -> Vec<SseEvent> {
        std::iter::from_fn(|| decoder.next_event()).collect()
    }

    #[test]
    fn test_decode_single_event() {
        let mut decoder = SseDecoder::new();
        decoder.feed("event: delta\ndata: {\"text\":\"hi\"}\n\n");
        let events = drain(&mut decoder);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type.as_deref(), Some("delta"));
        assert_eq!(events[0].data, "{\"text\":\"hi\"}");
    }

    #[test]
    fn test_decode_across_chunk_boundary() {
        let mut decoder = SseDecoder::new();
        decoder.feed("data: {\"n\":");
        assert!(drain(&mut decoder).is_empty());
        decoder.feed("1}\n\n");
        let events = drain(&mut decoder);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "{\"n\":1}");
    }

    #[test]
    fn test_decode_multiple_and_crlf() {
        let mut decoder = SseDecoder::new();
        decoder.feed("data: one\n\ndata: two\r\n\r\ndata: three\n\n");
        let events = drain(&mut decoder);
        assert_eq!(events.len(), 3);
        assert_eq!(events[1].data, "two");
    }

    #[test]
    fn test_comments_and_empty_blocks_skipped() {
        let mut decoder = SseDecoder::new();
        decoder.feed(": keep-alive\n\nevent: only-type\n\ndata: real\n\n");
        let events = drain(&mut decoder);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "real");
    }
}
