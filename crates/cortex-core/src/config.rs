use std::collections::HashMap;
use std::env;

use serde::{Deserialize, Serialize};

/// Default system prompt when `SYSTEM_PROMPT` is unset.
const DEFAULT_SYSTEM_PROMPT: &str =
    "You are a helpful assistant. Answer using the conversation context and any tool results provided.";

/// Process configuration, read from the environment at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Shared-cache URL; unset means the in-process cache.
    #[serde(default)]
    pub shared_cache_url: Option<String>,
    /// Persistent-store location (SQLite path).
    #[serde(default = "default_store_path")]
    pub store_path: String,
    #[serde(default)]
    pub vector_store_url: Option<String>,
    #[serde(default)]
    pub chat_lm_url: Option<String>,
    #[serde(default)]
    pub worker_lm_url: Option<String>,
    #[serde(default)]
    pub search_api_key: Option<String>,

    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
    #[serde(default = "default_max_context_tokens")]
    pub max_context_tokens: usize,
    #[serde(default = "default_summary_cushion_tokens")]
    pub summary_cushion_tokens: usize,

    /// Per-stream wall-clock timeout, seconds.
    #[serde(default = "default_stream_timeout")]
    pub stream_timeout_secs: u64,

    #[serde(default = "ToolServerConfig::defaults")]
    pub tool_servers: Vec<ToolServerConfig>,
}

/// One supervised tool server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolServerConfig {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl ToolServerConfig {
    /// The standard server set: history, web search, shell, vector store.
    /// Commands are env-overridable (`CORTEX_TOOL_<NAME>`).
    pub fn defaults() -> Vec<Self> {
        ["history", "web-search", "shell", "vector-store"]
            .iter()
            .map(|name| {
                let env_key = format!("CORTEX_TOOL_{}", name.replace('-', "_").to_uppercase());
                let command = env::var(&env_key)
                    .unwrap_or_else(|_| format!("cortex-tool-{}", name));
                Self {
                    name: name.to_string(),
                    command,
                    args: Vec::new(),
                    env: HashMap::new(),
                    enabled: true,
                }
            })
            .collect()
    }
}

fn default_enabled() -> bool {
    true
}

fn default_store_path() -> String {
    "cortex.db".to_string()
}

fn default_system_prompt() -> String {
    DEFAULT_SYSTEM_PROMPT.to_string()
}

fn default_max_context_tokens() -> usize {
    24_000
}

fn default_summary_cushion_tokens() -> usize {
    2_000
}

fn default_stream_timeout() -> u64 {
    60
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            shared_cache_url: None,
            store_path: default_store_path(),
            vector_store_url: None,
            chat_lm_url: None,
            worker_lm_url: None,
            search_api_key: None,
            system_prompt: default_system_prompt(),
            max_context_tokens: default_max_context_tokens(),
            summary_cushion_tokens: default_summary_cushion_tokens(),
            stream_timeout_secs: default_stream_timeout(),
            tool_servers: ToolServerConfig::defaults(),
        }
    }
}

impl RuntimeConfig {
    /// Build the configuration from process environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(v) = env::var("CORTEX_SHARED_CACHE_URL") {
            config.shared_cache_url = Some(v);
        }
        if let Ok(v) = env::var("CORTEX_STORE_PATH") {
            config.store_path = v;
        }
        if let Ok(v) = env::var("CORTEX_VECTOR_STORE_URL") {
            config.vector_store_url = Some(v);
        }
        if let Ok(v) = env::var("CORTEX_CHAT_LM_URL") {
            config.chat_lm_url = Some(v);
        }
        if let Ok(v) = env::var("CORTEX_WORKER_LM_URL") {
            config.worker_lm_url = Some(v);
        }
        if let Ok(v) = env::var("CORTEX_SEARCH_API_KEY") {
            config.search_api_key = Some(v);
        }
        if let Ok(v) = env::var("SYSTEM_PROMPT") {
            if !v.trim().is_empty() {
                config.system_prompt = v;
            }
        }
        if let Ok(v) = env::var("MAX_CONTEXT_TOKENS") {
            if let Ok(n) = v.parse() {
                config.max_context_tokens = n;
            }
        }
        if let Ok(v) = env::var("SUMMARY_CUSHION_TOKENS") {
            if let Ok(n) = v.parse() {
                config.summary_cushion_tokens = n;
            }
        }
        if let Ok(v) = env::var("CORTEX_STREAM_TIMEOUT_SECS") {
            if let Ok(n) = v.parse() {
                config.stream_timeout_secs = n;
            }
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RuntimeConfig::default();
        assert_eq!(config.stream_timeout_secs, 60);
        assert_eq!(config.tool_servers.len(), 4);
        assert!(config.tool_servers.iter().all(|s| s.enabled));
        assert!(config.system_prompt.contains("assistant"));
    }

    #[test]
    fn test_tool_server_names() {
        let names: Vec<String> = ToolServerConfig::defaults()
            .into_iter()
            .map(|s| s.name)
            .collect();
        assert_eq!(names, vec!["history", "web-search", "shell", "vector-store"]);
    }
}
