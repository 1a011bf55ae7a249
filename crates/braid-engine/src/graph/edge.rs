use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

/// Dependency edges keyed by target: `to -> [from, ...]`.
pub type EdgeMap = HashMap<String, Vec<String>>;

/// A directed edge: `to` depends on `from`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Edge {
    /// Source node id.
    pub from: String,
    /// Target node id.
    pub to: String,
}

impl Edge {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
        }
    }
}

/// Group edges by target, keeping declaration order and dropping duplicates.
pub fn edges_by_target(edges: &[Edge]) -> EdgeMap {
    let mut map: EdgeMap = HashMap::new();
    for edge in edges {
        let sources = map.entry(edge.to.clone()).or_default();
        if !sources.contains(&edge.from) {
            sources.push(edge.from.clone());
        }
    }
    map
}

/// Invert a target-keyed map into `from -> [to, ...]`.
pub fn forward_adjacency(edges: &EdgeMap) -> HashMap<String, Vec<String>> {
    let mut forward: HashMap<String, Vec<String>> = HashMap::new();
    for (to, sources) in edges {
        for from in sources {
            forward.entry(from.clone()).or_default().push(to.clone());
        }
    }
    for targets in forward.values_mut() {
        targets.sort();
    }
    forward
}

/// Whether `target` can be reached from `start` following forward edges.
pub fn is_reachable(forward: &HashMap<String, Vec<String>>, start: &str, target: &str) -> bool {
    if start == target {
        return true;
    }
    let mut stack = vec![start];
    let mut seen: HashSet<&str> = HashSet::new();
    while let Some(node) = stack.pop() {
        if !seen.insert(node) {
            continue;
        }
        for next in forward.get(node).into_iter().flatten() {
            if next == target {
                return true;
            }
            stack.push(next.as_str());
        }
    }
    false
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Done,
}

/// Find one cycle, returned as the path that closes it (first id repeated
/// at the end). `None` means the graph is a DAG.
pub fn find_cycle(node_ids: &[String], edges: &EdgeMap) -> Option<Vec<String>> {
    let forward = forward_adjacency(edges);
    let mut marks: HashMap<String, Mark> = HashMap::new();
    let mut path: Vec<String> = Vec::new();

    for id in node_ids {
        if marks.contains_key(id) {
            continue;
        }
        if let Some(cycle) = visit(id, &forward, &mut marks, &mut path) {
            return Some(cycle);
        }
    }
    None
}

fn visit(
    node: &str,
    forward: &HashMap<String, Vec<String>>,
    marks: &mut HashMap<String, Mark>,
    path: &mut Vec<String>,
) -> Option<Vec<String>> {
    marks.insert(node.to_string(), Mark::Visiting);
    path.push(node.to_string());

    for next in forward.get(node).into_iter().flatten() {
        match marks.get(next) {
            Some(Mark::Visiting) => {
                let start = path.iter().position(|p| p == next).unwrap_or(0);
                let mut cycle = path[start..].to_vec();
                cycle.push(next.clone());
                return Some(cycle);
            }
            Some(Mark::Done) => {}
            None => {
                if let Some(cycle) = visit(next, forward, marks, path) {
                    return Some(cycle);
                }
            }
        }
    }

    path.pop();
    marks.insert(node.to_string(), Mark::Done);
    None
}

/// Nodes that no other node depends on, in declaration order.
pub fn terminal_nodes(node_ids: &[String], edges: &EdgeMap) -> Vec<String> {
    let has_dependents: HashSet<&str> = edges
        .values()
        .flat_map(|sources| sources.iter().map(String::as_str))
        .collect();
    node_ids
        .iter()
        .filter(|id| !has_dependents.contains(id.as_str()))
        .cloned()
        .collect()
}
