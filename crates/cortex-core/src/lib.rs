pub mod config;
pub mod error;
pub mod model;
pub mod state;
pub mod traits;
pub mod types;

pub use config::RuntimeConfig;
pub use error::{CortexError, Result};
pub use state::{apply_delta, RuntimeState, StateDelta};
pub use types::*;
