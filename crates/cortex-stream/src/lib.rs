//! Generation and streaming pipeline: per-request lifecycle over the shared
//! cache, boundary-safe think-tag extraction, chunk batching, and
//! cancellation handles.

pub mod batch;
pub mod cancel;
pub mod emitter;
pub mod memory;
pub mod tokens;

pub use batch::ChunkBatcher;
pub use cancel::CancelRegistry;
pub use emitter::StreamEmitter;
pub use memory::MemorySharedCache;
pub use tokens::{ThinkTagFilter, TokenEvent};
