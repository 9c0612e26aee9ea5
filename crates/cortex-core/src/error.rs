use thiserror::Error;

#[derive(Debug, Error)]
pub enum CortexError {
    // Registry errors
    #[error("Graph not found: {0}")]
    GraphNotFound(String),

    #[error("Neuron not found: {0}")]
    NeuronNotFound(String),

    #[error("Access denied to {resource} for user {user_id}")]
    AccessDenied { resource: String, user_id: String },

    // Compiler errors
    #[error("Graph '{graph_id}' failed to compile: {message}")]
    CompilationFailed { graph_id: String, message: String },

    #[error("Graph validation failed: {0}")]
    Validation(String),

    // Tool pool errors
    #[error("No tool server exposes tool: {0}")]
    ToolRouting(String),

    #[error("Tool request timed out after {timeout_secs}s: {method}")]
    ToolTimeout { method: String, timeout_secs: u64 },

    #[error("Tool server '{0}' exited with requests pending")]
    ToolChildExit(String),

    #[error("Tool call failed: {tool}: {message}")]
    ToolExecution { tool: String, message: String },

    // Provider errors
    #[error("LM request failed: {0}")]
    Provider(String),

    #[error("LM streaming error: {0}")]
    ProviderStream(String),

    #[error("Unknown LM provider: {0}")]
    UnknownProvider(String),

    // Generation lifecycle
    #[error("Generation already in progress for conversation {0}")]
    AlreadyInProgress(String),

    #[error("Stream timed out after {0}s")]
    StreamTimeout(u64),

    #[error("Generation cancelled")]
    Cancelled,

    // Expression / template / step errors
    #[error("Expression rejected: {0}")]
    ExpressionUnsafe(String),

    #[error("Malformed template: {0}")]
    Template(String),

    #[error("Step '{step}' failed: {message}")]
    Step { step: String, message: String },

    // Storage errors
    #[error("Store error: {0}")]
    Store(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CortexError>;
