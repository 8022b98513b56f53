//! Property tests for topology validation: any generated DAG sorts with
//! dependencies first, and closing a chain always surfaces the cycle.

use std::collections::HashMap;
use std::sync::Arc;

use flowgraph_engine::{compute_fn, NodeCompute, TaskGraph};
use proptest::prelude::*;
use serde_json::Value;

fn noop() -> Arc<dyn NodeCompute> {
    compute_fn(|_, _| async { Ok(Value::Null) })
}

/// Forward-only edges (`a < b`) keep the generated graph acyclic.
fn build_dag(n: usize, edges: &[(usize, usize)]) -> TaskGraph {
    let mut graph = TaskGraph::new();
    for i in 0..n {
        graph.add_node(format!("n{}", i), noop()).unwrap();
    }
    for (a, b) in edges {
        graph
            .connect(format!("n{}", a), format!("n{}", b))
            .unwrap();
    }
    graph
}

proptest! {
    #[test]
    fn topological_order_places_dependencies_first(
        n in 1usize..16,
        raw_edges in prop::collection::vec((0usize..64, 0usize..64), 0..48),
    ) {
        let edges: Vec<(usize, usize)> = raw_edges
            .into_iter()
            .map(|(a, b)| (a % n, b % n))
            .filter(|(a, b)| a < b)
            .collect();
        let graph = build_dag(n, &edges);

        prop_assert!(graph.detect_cycles().is_empty());

        let order = graph.topological_order().unwrap();
        prop_assert_eq!(order.len(), n);

        let position: HashMap<&String, usize> =
            order.iter().enumerate().map(|(i, id)| (id, i)).collect();
        for id in graph.ids() {
            for dep in graph.dependencies_of(id) {
                prop_assert!(position[dep] < position[id]);
            }
        }
    }

    #[test]
    fn topological_levels_partition_all_nodes(
        n in 1usize..16,
        raw_edges in prop::collection::vec((0usize..64, 0usize..64), 0..48),
    ) {
        let edges: Vec<(usize, usize)> = raw_edges
            .into_iter()
            .map(|(a, b)| (a % n, b % n))
            .filter(|(a, b)| a < b)
            .collect();
        let graph = build_dag(n, &edges);

        let levels = graph.topological_levels().unwrap();
        let flat: Vec<&String> = levels.iter().flatten().collect();
        prop_assert_eq!(flat.len(), n);

        // Every dependency sits in a strictly earlier level.
        let level_of: HashMap<&String, usize> = levels
            .iter()
            .enumerate()
            .flat_map(|(i, group)| group.iter().map(move |id| (id, i)))
            .collect();
        for id in graph.ids() {
            for dep in graph.dependencies_of(id) {
                prop_assert!(level_of[dep] < level_of[id]);
            }
        }
    }

    #[test]
    fn closing_a_chain_creates_a_detectable_cycle(n in 2usize..12) {
        let mut graph = TaskGraph::new();
        for i in 0..n {
            graph.add_node(format!("n{}", i), noop()).unwrap();
        }
        for i in 0..n - 1 {
            graph
                .connect(format!("n{}", i), format!("n{}", i + 1))
                .unwrap();
        }
        graph.connect(format!("n{}", n - 1), "n0").unwrap();

        let cycle = graph.detect_cycles();
        prop_assert_eq!(cycle.len(), n);
        for i in 0..cycle.len() {
            let from = &cycle[i];
            let to = &cycle[(i + 1) % cycle.len()];
            prop_assert!(graph.dependents_of(from).contains(to));
        }
        prop_assert!(graph.topological_order().is_err());
    }
}
