//! Validation and assembly of stored graph configs into executable graphs.

use std::collections::{BTreeMap, HashMap, HashSet};

use tracing::warn;

use cortex_core::error::{CortexError, Result};
use cortex_core::model::{EdgeSpec, GraphConfig, NODE_TYPES};
use cortex_core::types::{END_NODE, START_NODE};

use crate::graph::{CompiledEdge, CompiledGraph, CompiledNode};

/// Node-count threshold above which compilation warns.
const LARGE_GRAPH_NODES: usize = 50;
/// Tier values run 0 (highest privilege) to 4 (lowest).
const MAX_TIER: u8 = 4;

/// Compile a stored graph config. All validation failures are aggregated
/// into a single error keyed by the graph id.
pub fn compile(config: &GraphConfig) -> Result<CompiledGraph> {
    let mut errors: Vec<String> = Vec::new();

    if config.nodes.is_empty() {
        errors.push("graph has no nodes".into());
    }
    if config.edges.is_empty() {
        errors.push("graph has no edges".into());
    }
    if config.tier > MAX_TIER {
        errors.push(format!("tier {} out of range 0..={}", config.tier, MAX_TIER));
    }

    let mut node_ids: HashSet<&str> = HashSet::new();
    for node in &config.nodes {
        if !node_ids.insert(node.id.as_str()) {
            errors.push(format!("duplicate node id '{}'", node.id));
        }
        if node.id == START_NODE || node.id == END_NODE {
            errors.push(format!("node id '{}' is reserved", node.id));
        }
        if !NODE_TYPES.contains(&node.node_type.as_str()) {
            errors.push(format!(
                "node '{}' has unknown type '{}'",
                node.id, node.node_type
            ));
        }
    }

    let resolves = |id: &str| id == START_NODE || id == END_NODE || node_ids.contains(id);

    let mut has_entry = false;
    for (index, edge) in config.edges.iter().enumerate() {
        if !resolves(&edge.from) {
            errors.push(format!("edge {} references unknown node '{}'", index, edge.from));
        }
        if edge.from == START_NODE {
            has_entry = true;
        }

        match (&edge.to, &edge.condition) {
            (Some(to), None) => {
                if !resolves(to) {
                    errors.push(format!("edge {} references unknown node '{}'", index, to));
                }
            }
            (None, Some(_)) => {
                let targets = edge.targets.as_ref().filter(|t| !t.is_empty());
                match targets {
                    None => errors.push(format!(
                        "conditional edge {} from '{}' has no targets",
                        index, edge.from
                    )),
                    Some(targets) => {
                        for (key, target) in targets {
                            if !resolves(target) {
                                errors.push(format!(
                                    "edge {} target '{}' ({}) is not a node",
                                    index, target, key
                                ));
                            }
                        }
                    }
                }
                if let Some(fallback) = &edge.fallback {
                    if !resolves(fallback) {
                        errors.push(format!(
                            "edge {} fallback '{}' is not a node",
                            index, fallback
                        ));
                    }
                }
            }
            (Some(_), Some(_)) => errors.push(format!(
                "edge {} from '{}' has both 'to' and 'condition'",
                index, edge.from
            )),
            (None, None) => errors.push(format!(
                "edge {} from '{}' has neither 'to' nor 'condition'",
                index, edge.from
            )),
        }
    }

    if !has_entry && !config.edges.is_empty() {
        errors.push(format!("no edge from {}", START_NODE));
    }

    if !errors.is_empty() {
        return Err(CortexError::CompilationFailed {
            graph_id: config.graph_id.clone(),
            message: errors.join("; "),
        });
    }

    // Non-fatal findings.
    warn_orphans(config);
    if config.nodes.len() > LARGE_GRAPH_NODES {
        warn!(
            graph_id = %config.graph_id,
            nodes = config.nodes.len(),
            "Compiling a very large graph"
        );
    }

    let nodes: HashMap<String, CompiledNode> = config
        .nodes
        .iter()
        .map(|n| {
            (
                n.id.clone(),
                CompiledNode {
                    id: n.id.clone(),
                    node_type: n.node_type.clone(),
                    config: n.config.clone(),
                },
            )
        })
        .collect();

    let mut outgoing: HashMap<String, Vec<CompiledEdge>> = HashMap::new();
    for edge in &config.edges {
        outgoing
            .entry(edge.from.clone())
            .or_default()
            .push(compile_edge(edge));
    }

    Ok(CompiledGraph::new(
        config.graph_id.clone(),
        config.global_config.clone(),
        nodes,
        outgoing,
    ))
}

fn compile_edge(edge: &EdgeSpec) -> CompiledEdge {
    match (&edge.to, &edge.condition) {
        (Some(to), _) => CompiledEdge::Direct { to: to.clone() },
        (None, Some(condition)) => CompiledEdge::Branch {
            condition: condition.clone(),
            targets: edge.targets.clone().unwrap_or_else(BTreeMap::new),
            fallback: edge.fallback.clone(),
        },
        // Unreachable after validation.
        (None, None) => CompiledEdge::Direct { to: END_NODE.to_string() },
    }
}

fn warn_orphans(config: &GraphConfig) {
    let mut incoming: HashSet<&str> = HashSet::new();
    for edge in &config.edges {
        if let Some(to) = &edge.to {
            incoming.insert(to);
        }
        if let Some(targets) = &edge.targets {
            incoming.extend(targets.values().map(String::as_str));
        }
        if let Some(fallback) = &edge.fallback {
            incoming.insert(fallback);
        }
    }
    for node in &config.nodes {
        if !incoming.contains(node.id.as_str()) {
            warn!(graph_id = %config.graph_id, node_id = %node.id, "Orphan node has no incoming edge");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn valid_config() -> GraphConfig {
        serde_json::from_value(json!({
            "graphId": "g",
            "ownerId": "system",
            "tier": 3,
            "name": "test",
            "nodes": [
                {"id": "classify", "type": "classifier"},
                {"id": "respond", "type": "responder"},
                {"id": "plan", "type": "planner"}
            ],
            "edges": [
                {"from": "__start__", "to": "classify"},
                {"from": "classify", "condition": "state.data.routeDecision",
                 "targets": {"direct": "respond", "plan": "plan"}, "fallback": "plan"},
                {"from": "plan", "to": "respond"},
                {"from": "respond", "to": "__end__"}
            ]
        }))
        .unwrap()
    }

    #[test]
    fn test_valid_graph_compiles() {
        let compiled = compile(&valid_config()).unwrap();
        assert_eq!(compiled.graph_id(), "g");
    }

    #[test]
    fn test_duplicate_node_ids_fail() {
        let mut config = valid_config();
        config.nodes.push(config.nodes[0].clone());
        let err = compile(&config).unwrap_err();
        assert!(err.to_string().contains("duplicate node id"));
    }

    #[test]
    fn test_unknown_node_type_fails() {
        let mut config = valid_config();
        config.nodes[0].node_type = "mystery".into();
        let err = compile(&config).unwrap_err();
        assert!(err.to_string().contains("unknown type"));
    }

    #[test]
    fn test_missing_edge_endpoint_fails() {
        let mut config = valid_config();
        config.edges[0].to = Some("ghost".into());
        assert!(compile(&config).is_err());
    }

    #[test]
    fn test_unreachable_branch_target_fails() {
        let mut config = valid_config();
        config.edges[1]
            .targets
            .as_mut()
            .unwrap()
            .insert("extra".into(), "ghost".into());
        let err = compile(&config).unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn test_tier_out_of_range_fails() {
        let mut config = valid_config();
        config.tier = 9;
        assert!(compile(&config).is_err());
    }

    #[test]
    fn test_empty_nodes_and_edges_fail() {
        let mut config = valid_config();
        config.nodes.clear();
        config.edges.clear();
        let err = compile(&config).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("no nodes"));
        assert!(message.contains("no edges"));
    }

    #[test]
    fn test_errors_are_aggregated() {
        let mut config = valid_config();
        config.tier = 9;
        config.nodes[0].node_type = "mystery".into();
        config.edges[0].to = Some("ghost".into());
        let err = compile(&config).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("tier"));
        assert!(message.contains("mystery"));
        assert!(message.contains("ghost"));
    }

    #[test]
    fn test_edge_with_both_to_and_condition_fails() {
        let mut config = valid_config();
        config.edges[0].condition = Some("state.data.x".into());
        assert!(compile(&config).is_err());
    }
}
