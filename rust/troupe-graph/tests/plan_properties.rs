//! Property tests for plan compilation

use proptest::prelude::*;
use troupe_graph::{Graph, Task};

/// Build a random DAG: task `i` may only depend on tasks `< i`, so the
/// generated graph is acyclic by construction.
fn arb_dag() -> impl Strategy<Value = Vec<Vec<usize>>> {
    prop::collection::vec(
        prop::collection::vec(any::<prop::sample::Index>(), 0..4),
        1..24,
    )
    .prop_map(|raw| {
        raw.into_iter()
            .enumerate()
            .map(|(i, picks)| {
                if i == 0 {
                    return Vec::new();
                }
                let mut deps: Vec<usize> = picks.into_iter().map(|p| p.index(i)).collect();
                deps.sort_unstable();
                deps.dedup();
                deps
            })
            .collect()
    })
}

fn build(dag: &[Vec<usize>]) -> Graph {
    let mut graph = Graph::new();
    for (i, deps) in dag.iter().enumerate() {
        let task = Task::new(format!("t{:03}", i), format!("task {}", i))
            .with_deps(deps.iter().map(|d| format!("t{:03}", d)));
        graph.add_task(task).unwrap();
    }
    graph
}

proptest! {
    #[test]
    fn acyclic_graphs_always_compile(dag in arb_dag()) {
        let mut graph = build(&dag);
        prop_assert!(graph.compile().is_ok());
    }

    #[test]
    fn layer_is_one_plus_max_dep_layer(dag in arb_dag()) {
        let mut graph = build(&dag);
        let plan = graph.compile().unwrap();
        for (i, deps) in dag.iter().enumerate() {
            let id = format!("t{:03}", i);
            let layer = plan.layer_of(&id).unwrap();
            if deps.is_empty() {
                prop_assert_eq!(layer, 0);
            } else {
                let max_dep = deps
                    .iter()
                    .map(|d| plan.layer_of(&format!("t{:03}", d)).unwrap())
                    .max()
                    .unwrap();
                prop_assert_eq!(layer, max_dep + 1);
            }
        }
    }

    #[test]
    fn dependencies_sit_in_strictly_earlier_layers(dag in arb_dag()) {
        let mut graph = build(&dag);
        let plan = graph.compile().unwrap();
        for (i, deps) in dag.iter().enumerate() {
            let layer = plan.layer_of(&format!("t{:03}", i)).unwrap();
            for d in deps {
                let dep_layer = plan.layer_of(&format!("t{:03}", d)).unwrap();
                prop_assert!(dep_layer < layer);
            }
        }
    }

    #[test]
    fn every_task_appears_in_exactly_one_layer(dag in arb_dag()) {
        let mut graph = build(&dag);
        let plan = graph.compile().unwrap();
        let mut seen = std::collections::HashSet::new();
        for layer in plan.layers() {
            for id in layer {
                prop_assert!(seen.insert(id.clone()));
            }
        }
        prop_assert_eq!(seen.len(), dag.len());
    }

    #[test]
    fn recompile_is_deterministic(dag in arb_dag()) {
        let mut graph = build(&dag);
        let first = graph.compile().unwrap();
        let second = graph.compile().unwrap();
        prop_assert_eq!(first.layers(), second.layers());
        prop_assert_eq!(first.critical_path(), second.critical_path());
    }

    #[test]
    fn critical_path_length_equals_depth(dag in arb_dag()) {
        let mut graph = build(&dag);
        let plan = graph.compile().unwrap();
        prop_assert_eq!(plan.critical_path().len(), plan.depth());
    }
}
