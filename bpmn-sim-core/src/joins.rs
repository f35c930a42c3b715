//! Inclusive Join Resolution
//!
//! An inclusive split with partial fan-out must tell the downstream join how
//! many branches to wait for. This module finds that join: the nearest
//! converging inclusive gateway reachable from *all* chosen branches,
//! measured by breadth-first distance over the sequence-flow topology.
//! Candidates at equal (minimal) maximum distance are all returned, and the
//! caller records an expectation for each rather than guessing between them.

use crate::graph::{Element, ElementKind, ElementRegistry, GatewayDirection};
use petgraph::algo::dijkstra;
use petgraph::graphmap::DiGraphMap;
use std::collections::HashMap;
use std::sync::Arc;

/// True for an inclusive gateway that can act as a join target.
fn is_converging_inclusive(e: &Element) -> bool {
    e.kind == ElementKind::InclusiveGateway
        && (e.gateway_direction == Some(GatewayDirection::Converging)
            || e.incoming_sequence_count() > 1)
}

/// Ids of the join gateway(s) the chosen branches should synchronize at.
///
/// `branch_entries` are the elements each chosen outgoing flow leads to.
/// Empty result means no common join exists; the split then records no
/// expectation and downstream convergence falls back to static incoming
/// counts.
pub fn common_join_targets(
    registry: &dyn ElementRegistry,
    branch_entries: &[String],
) -> Vec<String> {
    if branch_entries.is_empty() {
        return Vec::new();
    }

    let elements: Vec<Arc<Element>> = registry.filter(&|_| true);
    let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();
    for element in &elements {
        graph.add_node(element.id.as_str());
        for flow in element.outgoing_sequence() {
            graph.add_edge(flow.source.as_str(), flow.target.as_str(), ());
        }
    }

    // Unit-weight dijkstra == BFS distance, one map per branch.
    let distances: Vec<HashMap<&str, usize>> = branch_entries
        .iter()
        .map(|entry| {
            if graph.contains_node(entry.as_str()) {
                dijkstra(&graph, entry.as_str(), None, |_| 1usize)
            } else {
                HashMap::new()
            }
        })
        .collect();

    let mut best: usize = usize::MAX;
    let mut winners: Vec<String> = Vec::new();
    for element in &elements {
        if !is_converging_inclusive(element) {
            continue;
        }
        let reach: Option<usize> = distances
            .iter()
            .map(|d| d.get(element.id.as_str()).copied())
            .try_fold(0usize, |acc, d| d.map(|d| acc.max(d)));
        let Some(score) = reach else { continue };
        match score.cmp(&best) {
            std::cmp::Ordering::Less => {
                best = score;
                winners = vec![element.id.clone()];
            }
            std::cmp::Ordering::Equal => winners.push(element.id.clone()),
            std::cmp::Ordering::Greater => {}
        }
    }
    winners.sort();
    winners
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::DiagramBuilder;

    fn split_join_diagram() -> crate::graph::DiagramRegistry {
        // split ─ a ─┐
        //            join ─ end
        // split ─ b ─┘
        DiagramBuilder::new()
            .gateway("split", ElementKind::InclusiveGateway, GatewayDirection::Diverging)
            .element("a", ElementKind::Task)
            .element("b", ElementKind::Task)
            .gateway("join", ElementKind::InclusiveGateway, GatewayDirection::Converging)
            .element("end", ElementKind::EndEvent)
            .flow("fa", "split", "a")
            .flow("fb", "split", "b")
            .flow("fa2", "a", "join")
            .flow("fb2", "b", "join")
            .flow("fe", "join", "end")
            .build()
    }

    #[test]
    fn finds_common_join_across_branches() {
        let reg = split_join_diagram();
        let joins = common_join_targets(&reg, &["a".into(), "b".into()]);
        assert_eq!(joins, vec!["join".to_string()]);
    }

    #[test]
    fn single_branch_still_resolves_downstream_join() {
        let reg = split_join_diagram();
        let joins = common_join_targets(&reg, &["a".into()]);
        assert_eq!(joins, vec!["join".to_string()]);
    }

    #[test]
    fn no_join_yields_empty() {
        let reg = DiagramBuilder::new()
            .element("a", ElementKind::Task)
            .element("b", ElementKind::Task)
            .flow("f", "a", "b")
            .build();
        assert!(common_join_targets(&reg, &["a".into()]).is_empty());
    }

    #[test]
    fn nearer_join_wins_over_farther_one() {
        // a ─ near ─ x ─ far ; both joins converging, near is closer.
        let reg = DiagramBuilder::new()
            .element("a", ElementKind::Task)
            .element("b", ElementKind::Task)
            .gateway("near", ElementKind::InclusiveGateway, GatewayDirection::Converging)
            .gateway("far", ElementKind::InclusiveGateway, GatewayDirection::Converging)
            .element("x", ElementKind::Task)
            .flow("f1", "a", "near")
            .flow("f2", "b", "near")
            .flow("f3", "near", "x")
            .flow("f4", "x", "far")
            .flow("f5", "b", "far")
            .build();
        let joins = common_join_targets(&reg, &["a".into(), "b".into()]);
        assert_eq!(joins, vec!["near".to_string()]);
    }
}
