//! Per-generation cancellation handles.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Registry of in-flight generations' cancel handles, keyed by generation id.
#[derive(Default)]
pub struct CancelRegistry {
    tokens: Mutex<HashMap<String, CancellationToken>>,
}

impl CancelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create and register a token for a generation.
    pub fn register(&self, generation_id: &str) -> CancellationToken {
        let token = CancellationToken::new();
        self.tokens
            .lock()
            .unwrap()
            .insert(generation_id.to_string(), token.clone());
        token
    }

    /// Cancel a generation's in-flight work. Returns false when the
    /// generation is unknown or already finished.
    pub fn abort(&self, generation_id: &str) -> bool {
        let tokens = self.tokens.lock().unwrap();
        match tokens.get(generation_id) {
            Some(token) => {
                debug!(generation_id, "Aborting stream");
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Drop the handle once the generation reached a terminal state.
    pub fn release(&self, generation_id: &str) {
        self.tokens.lock().unwrap().remove(generation_id);
    }

    pub fn active(&self) -> usize {
        self.tokens.lock().unwrap().len()
    }
}
