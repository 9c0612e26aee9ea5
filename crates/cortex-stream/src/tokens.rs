//! Boundary-safe extraction of inline `<think>…</think>` reasoning from a
//! token stream.
//!
//! Tags can straddle chunk boundaries, so the filter keeps a rolling tail of
//! fewer than eight characters (the longest tag) unprocessed until more
//! input or the end of the stream arrives.

/// The longest tag; the rolling window never holds this many processed
/// characters.
const TAG_WINDOW: usize = 8;
const OPEN_TAG: &str = "<think>";
const CLOSE_TAG: &str = "</think>";

/// What the filter saw, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum TokenEvent {
    /// A `<think>` tag opened.
    BeginThinking,
    /// One character of reasoning.
    Thinking(char),
    /// A `</think>` tag closed.
    EndThinking,
    /// A run of user-visible content.
    Content(String),
    /// Synthetic single space emitted when content begins after a thinking
    /// block, so the client sees a content event before whitespace filtering.
    ContentSeparator,
}

#[derive(Default)]
pub struct ThinkTagFilter {
    pending: String,
    in_thinking: bool,
    content_started: bool,
    needs_separator: bool,
}

impl ThinkTagFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one stream chunk.
    pub fn feed(&mut self, chunk: &str) -> Vec<TokenEvent> {
        self.pending.push_str(chunk);
        self.drain(false)
    }

    /// End of stream: process the remaining window.
    pub fn finish(&mut self) -> Vec<TokenEvent> {
        self.drain(true)
    }

    fn drain(&mut self, flush: bool) -> Vec<TokenEvent> {
        let mut out = Vec::new();
        let mut content_run = String::new();

        loop {
            let available = self.pending.chars().count();
            if available == 0 {
                break;
            }
            // Keep a tail that could still grow into a tag.
            if !flush && available < TAG_WINDOW {
                break;
            }

            if !self.in_thinking && self.pending.starts_with(OPEN_TAG) {
                flush_run(&mut out, &mut content_run);
                self.pending.drain(..OPEN_TAG.len());
                self.in_thinking = true;
                out.push(TokenEvent::BeginThinking);
                continue;
            }
            if self.in_thinking && self.pending.starts_with(CLOSE_TAG) {
                self.pending.drain(..CLOSE_TAG.len());
                self.in_thinking = false;
                self.needs_separator = true;
                out.push(TokenEvent::EndThinking);
                continue;
            }

            let c = self.pending.chars().next().unwrap();
            self.pending.drain(..c.len_utf8());

            if self.in_thinking {
                flush_run(&mut out, &mut content_run);
                out.push(TokenEvent::Thinking(c));
                continue;
            }

            // Leading whitespace before the first real content is dropped.
            if !self.content_started && c.is_whitespace() {
                continue;
            }
            if self.needs_separator {
                flush_run(&mut out, &mut content_run);
                out.push(TokenEvent::ContentSeparator);
                self.needs_separator = false;
            }
            self.content_started = true;
            content_run.push(c);
        }

        flush_run(&mut out, &mut content_run);
        out
    }
}

fn flush_run(out: &mut Vec<TokenEvent>, run: &mut String) {
    if !run.is_empty() {
        out.push(TokenEvent::Content(std::mem::take(run)));
    }
}
