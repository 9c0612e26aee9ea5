//! Supervised tool subprocess pool. Children speak JSON-RPC 2.0 over
//! newline-delimited JSON on their standard streams; the pool routes calls
//! to the first child exposing the requested tool.

pub mod child;
pub mod pool;
pub mod rpc;

pub use child::ToolChild;
pub use pool::{ToolPool, ToolServer};
