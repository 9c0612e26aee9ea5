//! Orchestration runtime: the front door that turns a user query into a
//! graph run with streaming delivery and durable conversation state.

pub mod background;
pub mod history;
pub mod orchestrator;

pub use orchestrator::{Orchestrator, Reply, RespondOptions, TransportItem};
