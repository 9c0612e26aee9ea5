//! Executable graphs: edge-following execution over universal nodes.

use std::collections::{BTreeMap, HashMap};

use tracing::{debug, info, warn};

use cortex_core::error::{CortexError, Result};
use cortex_core::model::{GlobalConfig, NodeConfig};
use cortex_core::state::{apply_delta, RuntimeState};
use cortex_core::types::{END_NODE, FALLBACK_KEY, START_NODE};

use crate::context::RunContext;
use crate::expr;
use crate::node::run_node;

/// Per-node visit cap; exceeding it terminates the run rather than spin.
const MAX_NODE_VISITS: u32 = 8;

#[derive(Debug, Clone)]
pub struct CompiledNode {
    pub id: String,
    pub node_type: String,
    pub config: Option<NodeConfig>,
}

#[derive(Debug, Clone)]
pub enum CompiledEdge {
    Direct {
        to: String,
    },
    Branch {
        condition: String,
        targets: BTreeMap<String, String>,
        fallback: Option<String>,
    },
}

/// A validated, executable workflow graph.
#[derive(Debug, Clone)]
pub struct CompiledGraph {
    graph_id: String,
    global: GlobalConfig,
    nodes: HashMap<String, CompiledNode>,
    outgoing: HashMap<String, Vec<CompiledEdge>>,
}

impl CompiledGraph {
    pub(crate) fn new(
        graph_id: String,
        global: GlobalConfig,
        nodes: HashMap<String, CompiledNode>,
        outgoing: HashMap<String, Vec<CompiledEdge>>,
    ) -> Self {
        Self {
            graph_id,
            global,
            nodes,
            outgoing,
        }
    }

    pub fn graph_id(&self) -> &str {
        &self.graph_id
    }

    pub fn global_config(&self) -> &GlobalConfig {
        &self.global
    }

    /// Execute the graph to completion, returning the final state.
    ///
    /// Node failures never abort the run directly; they route through the
    /// graph's own `error_handler` path (or end it). Cancellation is checked
    /// between nodes and inside each step.
    pub async fn run(&self, ctx: &RunContext, mut state: RuntimeState) -> Result<RuntimeState> {
        let mut visits: HashMap<String, u32> = HashMap::new();
        let mut current = START_NODE.to_string();

        loop {
            if ctx.cancelled() {
                return Err(CortexError::Cancelled);
            }
            if current == END_NODE {
                break;
            }

            if current != START_NODE {
                let node = self.nodes.get(&current).ok_or_else(|| {
                    CortexError::Validation(format!(
                        "graph '{}' routed to unknown node '{}'",
                        self.graph_id, current
                    ))
                })?;

                let count = visits.entry(current.clone()).or_insert(0);
                *count += 1;
                if *count > MAX_NODE_VISITS {
                    warn!(
                        graph_id = %self.graph_id,
                        node_id = %current,
                        "Node visited more than {} times, terminating graph",
                        MAX_NODE_VISITS
                    );
                    break;
                }

                info!(graph_id = %self.graph_id, node_id = %node.id, node_type = %node.node_type, "Executing node");
                let delta = run_node(ctx, &state, &node.id, node.config.as_ref()).await;
                apply_delta(&mut state, &delta);

                // A short-circuit answer ends the run regardless of edges.
                if state.final_response.is_some() {
                    debug!(graph_id = %self.graph_id, node_id = %current, "Final response set, ending run");
                    break;
                }
            }

            match self.next_node(&current, &state) {
                Some(next) => {
                    debug!(from = %current, to = %next, "Following edge");
                    current = next;
                }
                None => {
                    debug!(node_id = %current, "No outgoing edges, graph complete");
                    break;
                }
            }
        }

        Ok(state)
    }

    /// Pick the next node from `current`'s outgoing edges. The first edge
    /// decides: simple edges directly, conditional edges through the safe
    /// evaluator and their targets table.
    fn next_node(&self, current: &str, state: &RuntimeState) -> Option<String> {
        let edges = self.outgoing.get(current)?;
        for edge in edges {
            match edge {
                CompiledEdge::Direct { to } => return Some(to.clone()),
                CompiledEdge::Branch {
                    condition,
                    targets,
                    fallback,
                } => {
                    let key = expr::resolve_branch(condition, state, targets);
                    let target = if key == FALLBACK_KEY {
                        fallback.clone().unwrap_or_else(|| END_NODE.to_string())
                    } else {
                        targets.get(&key).cloned()?
                    };
                    return Some(target);
                }
            }
        }
        None
    }
}
