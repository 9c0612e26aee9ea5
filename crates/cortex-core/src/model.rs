//! Persisted configuration documents: workflow graphs, neurons, and the
//! universal-node step lists injected into compiled graphs.

use serde::{Deserialize, Serialize};

/// Node types recognized by the graph compiler. Every one of them executes
/// through the universal node; the type is a routing/validation label.
pub const NODE_TYPES: &[&str] = &[
    "precheck",
    "fastpath",
    "context",
    "classifier",
    "router",
    "planner",
    "executor",
    "responder",
    "search",
    "scrape",
    "command",
    "universal",
];

/// A persisted workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphConfig {
    pub graph_id: String,
    pub owner_id: String,
    #[serde(default = "crate::types::default_lowest_tier")]
    pub tier: u8,
    #[serde(default)]
    pub is_default: bool,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub nodes: Vec<NodeSpec>,
    pub edges: Vec<EdgeSpec>,
    #[serde(default)]
    pub global_config: GlobalConfig,
}

/// One node of a stored graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeSpec {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<NodeConfig>,
}

/// One edge of a stored graph. Simple edges carry `to`; conditional edges
/// carry `condition` + `targets` and an optional `fallback`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EdgeSpec {
    pub from: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub targets: Option<std::collections::BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback: Option<String>,
}

/// Graph-wide execution limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalConfig {
    #[serde(default = "default_max_replans")]
    pub max_replans: u32,
    #[serde(default = "default_max_search_iterations")]
    pub max_search_iterations: u32,
    /// Wall-clock budget for one graph run, in seconds.
    #[serde(default = "default_graph_timeout")]
    pub timeout: u64,
    #[serde(default)]
    pub enable_fastpath: bool,
}

fn default_max_replans() -> u32 {
    2
}

fn default_max_search_iterations() -> u32 {
    3
}

fn default_graph_timeout() -> u64 {
    60
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            max_replans: default_max_replans(),
            max_search_iterations: default_max_search_iterations(),
            timeout: default_graph_timeout(),
            enable_fastpath: false,
        }
    }
}

/// Universal-node configuration: either a single step or an explicit step
/// list, or a reference to a reusable node stored in `universal_nodes`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NodeConfig {
    Reference {
        #[serde(rename = "nodeId")]
        node_id: String,
    },
    Steps {
        steps: Vec<StepSpec>,
    },
    Single {
        #[serde(rename = "type")]
        step_type: StepKind,
        config: serde_json::Value,
    },
}

impl NodeConfig {
    /// Normalize to the step list this node executes. References must be
    /// resolved before calling this.
    pub fn steps(&self) -> Vec<StepSpec> {
        match self {
            NodeConfig::Steps { steps } => steps.clone(),
            NodeConfig::Single { step_type, config } => vec![StepSpec {
                step_type: *step_type,
                config: config.clone(),
                condition: None,
            }],
            NodeConfig::Reference { .. } => Vec::new(),
        }
    }
}

/// The five step primitives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepKind {
    Neuron,
    Tool,
    Transform,
    Conditional,
    Loop,
}

/// One step inside a universal node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepSpec {
    #[serde(rename = "type")]
    pub step_type: StepKind,
    pub config: serde_json::Value,
    /// Optional guard expression; a falsy or malformed condition skips the step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

/// LM provider families the registry can instantiate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderKind {
    Local,
    OpenaiCompatible,
    AnthropicCompatible,
    GoogleCompatible,
    Custom,
}

/// Role a neuron plays in workflows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NeuronRole {
    Chat,
    Worker,
    Specialist,
}

/// A persisted LM endpoint definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NeuronConfig {
    pub neuron_id: String,
    pub owner_id: String,
    #[serde(default = "crate::types::default_lowest_tier")]
    pub tier: u8,
    pub name: String,
    pub role: NeuronRole,
    pub provider: ProviderKind,
    pub endpoint: String,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// When set, `api_key` names a process environment variable holding the
    /// actual key rather than the key itself.
    #[serde(default)]
    pub api_key_encrypted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
}
