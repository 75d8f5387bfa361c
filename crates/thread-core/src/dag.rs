//! Pure graph algorithms over a thread's dependency edges.
//!
//! An edge `from -> to` means `to` depends on `from`: `from` has to complete before `to` is
//! eligible to run. Every function here is deterministic in the order edges are given.

use crate::thread_contracts::{ContractError, DagEdge, DagStructure, Edge};
use std::collections::{BTreeMap, BTreeSet, VecDeque};

pub fn dag_structure(edges: &[Edge]) -> DagStructure {
    DagStructure {
        nodes: node_order(edges),
        edges: edges
            .iter()
            .map(|edge| DagEdge {
                from: edge.from_item_id.clone(),
                to: edge.to_item_id.clone(),
                edge_type: edge.edge_type,
            })
            .collect(),
    }
}

/// True when every dependency source is in `completed`. Vacuously true without dependencies.
pub fn dependencies_satisfied(dependencies: &[Edge], completed: &BTreeSet<String>) -> bool {
    dependencies
        .iter()
        .all(|edge| completed.contains(&edge.from_item_id))
}

/// Graph nodes that have not completed yet but whose dependencies all have.
pub fn ready_nodes(edges: &[Edge], completed: &BTreeSet<String>) -> Vec<String> {
    let mut incoming: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for edge in edges {
        incoming
            .entry(edge.to_item_id.as_str())
            .or_default()
            .push(edge.from_item_id.as_str());
    }

    node_order(edges)
        .into_iter()
        .filter(|node| !completed.contains(node))
        .filter(|node| {
            incoming
                .get(node.as_str())
                .map(|sources| sources.iter().all(|source| completed.contains(*source)))
                .unwrap_or(true)
        })
        .collect()
}

/// Whether inserting `from -> to` on top of `edges` would close a cycle.
pub fn would_create_cycle(edges: &[Edge], from: &str, to: &str) -> bool {
    from == to || reaches(edges, to, from)
}

/// Kahn's algorithm. Ties are broken by first appearance so the result is stable.
pub fn topological_order(edges: &[Edge]) -> Result<Vec<String>, ContractError> {
    let nodes = node_order(edges);
    let mut in_degree: BTreeMap<&str, usize> =
        nodes.iter().map(|node| (node.as_str(), 0)).collect();
    let mut outgoing: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for edge in edges {
        outgoing
            .entry(edge.from_item_id.as_str())
            .or_default()
            .push(edge.to_item_id.as_str());
        if let Some(degree) = in_degree.get_mut(edge.to_item_id.as_str()) {
            *degree += 1;
        }
    }

    let mut queue: VecDeque<&str> = nodes
        .iter()
        .map(String::as_str)
        .filter(|node| in_degree.get(node).copied() == Some(0))
        .collect();
    let mut ordered = Vec::with_capacity(nodes.len());

    while let Some(node) = queue.pop_front() {
        ordered.push(node.to_string());
        for next in outgoing.get(node).into_iter().flatten() {
            if let Some(degree) = in_degree.get_mut(next) {
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(*next);
                }
            }
        }
    }

    if ordered.len() < nodes.len() {
        let placed: BTreeSet<&str> = ordered.iter().map(String::as_str).collect();
        let remaining = nodes
            .iter()
            .filter(|node| !placed.contains(node.as_str()))
            .cloned()
            .collect();
        return Err(ContractError::DependencyCycle { nodes: remaining });
    }

    Ok(ordered)
}

fn node_order(edges: &[Edge]) -> Vec<String> {
    let mut seen = BTreeSet::new();
    let mut nodes = Vec::new();
    for edge in edges {
        for id in [&edge.from_item_id, &edge.to_item_id] {
            if seen.insert(id.as_str()) {
                nodes.push(id.clone());
            }
        }
    }
    nodes
}

fn reaches(edges: &[Edge], start: &str, target: &str) -> bool {
    let mut outgoing: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for edge in edges {
        outgoing
            .entry(edge.from_item_id.as_str())
            .or_default()
            .push(edge.to_item_id.as_str());
    }

    let mut visited = BTreeSet::new();
    let mut stack = vec![start];
    while let Some(node) = stack.pop() {
        if node == target {
            return true;
        }
        if !visited.insert(node) {
            continue;
        }
        stack.extend(outgoing.get(node).into_iter().flatten().copied());
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread_contracts::EdgeType;
    use chrono::{TimeZone, Utc};

    fn edge(from: &str, to: &str) -> Edge {
        Edge {
            id: format!("edge-{from}-{to}"),
            thread_id: "thread-1".to_string(),
            from_item_id: from.to_string(),
            to_item_id: to.to_string(),
            edge_type: EdgeType::DependsOn,
            request_id: "r1".to_string(),
            created_at: Utc
                .with_ymd_and_hms(2026, 3, 2, 9, 30, 0)
                .single()
                .expect("valid timestamp"),
        }
    }

    fn set(ids: &[&str]) -> BTreeSet<String> {
        ids.iter().map(|id| id.to_string()).collect()
    }

    #[test]
    fn fan_in_requires_every_source() {
        let deps = vec![edge("A", "C"), edge("B", "C")];
        assert!(!dependencies_satisfied(&deps, &set(&["A"])));
        assert!(dependencies_satisfied(&deps, &set(&["A", "B"])));
        assert!(dependencies_satisfied(&[], &set(&[])));
    }

    #[test]
    fn structure_dedupes_nodes_in_first_seen_order() {
        let mut caused = edge("B", "C");
        caused.edge_type = EdgeType::CausedBy;
        let structure = dag_structure(&[edge("A", "B"), caused]);

        assert_eq!(structure.nodes, vec!["A", "B", "C"]);
        assert_eq!(structure.edges.len(), 2);
        assert_eq!(structure.edges[1].edge_type, EdgeType::CausedBy);
    }

    #[test]
    fn ready_nodes_is_the_fan_out_frontier() {
        let edges = vec![edge("A", "B"), edge("A", "C"), edge("B", "D"), edge("C", "D")];

        assert_eq!(ready_nodes(&edges, &set(&[])), vec!["A"]);
        assert_eq!(ready_nodes(&edges, &set(&["A"])), vec!["B", "C"]);
        assert_eq!(ready_nodes(&edges, &set(&["A", "B"])), vec!["C"]);
        assert_eq!(ready_nodes(&edges, &set(&["A", "B", "C"])), vec!["D"]);
        assert!(ready_nodes(&edges, &set(&["A", "B", "C", "D"])).is_empty());
    }

    #[test]
    fn cycle_check_follows_edge_direction() {
        let edges = vec![edge("A", "B"), edge("B", "C")];
        assert!(would_create_cycle(&edges, "C", "A"));
        assert!(would_create_cycle(&edges, "B", "B"));
        assert!(!would_create_cycle(&edges, "A", "C"));
        assert!(!would_create_cycle(&edges, "C", "D"));
    }

    #[test]
    fn topological_order_respects_dependencies_and_reports_cycles() {
        let edges = vec![edge("B", "C"), edge("A", "B"), edge("A", "C")];
        assert_eq!(
            topological_order(&edges).expect("acyclic"),
            vec!["A", "B", "C"]
        );

        let cyclic = vec![edge("X", "Y"), edge("Y", "Z"), edge("Z", "Y")];
        match topological_order(&cyclic) {
            Err(ContractError::DependencyCycle { nodes }) => {
                assert_eq!(nodes, vec!["Y", "Z"]);
            }
            other => panic!("expected cycle, got {other:?}"),
        }
    }
}
