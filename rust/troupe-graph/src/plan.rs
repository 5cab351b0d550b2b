//! Compilation: validation, cycle detection, layering, critical path

use std::collections::{BTreeMap, HashMap, VecDeque};

use crate::error::{GraphError, GraphResult};
use crate::task::Task;

/// Immutable compilation artifact
///
/// Layer `k` depends only on tasks in layers `< k`; tasks within a
/// layer are mutually independent and eligible for parallel dispatch.
/// The critical path is the longest dependency chain and is advisory
/// metadata only.
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    layers: Vec<Vec<String>>,
    critical_path: Vec<String>,
    tasks: HashMap<String, Task>,
    layer_index: HashMap<String, usize>,
}

impl ExecutionPlan {
    /// Ordered layers of task identifiers
    pub fn layers(&self) -> &[Vec<String>] {
        &self.layers
    }

    /// The longest dependency chain, root first
    pub fn critical_path(&self) -> &[String] {
        &self.critical_path
    }

    /// Number of layers
    pub fn depth(&self) -> usize {
        self.layers.len()
    }

    /// Number of tasks in the plan
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Whether the plan holds no tasks
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Look up a task by identifier
    pub fn task(&self, id: &str) -> Option<&Task> {
        self.tasks.get(id)
    }

    /// The layer a task was placed in
    pub fn layer_of(&self, id: &str) -> Option<usize> {
        self.layer_index.get(id).copied()
    }

    /// Task identifiers in a given layer
    pub fn tasks_in_layer(&self, layer: usize) -> &[String] {
        self.layers.get(layer).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Iterate all tasks in the plan
    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }
}

/// Validate and layer a task set into an execution plan
pub(crate) fn compile(tasks: &BTreeMap<String, Task>) -> GraphResult<ExecutionPlan> {
    // Every referenced dependency must exist.
    for task in tasks.values() {
        for dep in &task.deps {
            if !tasks.contains_key(dep) {
                return Err(GraphError::MissingDependency {
                    task: task.id.clone(),
                    dependency: dep.clone(),
                });
            }
        }
    }

    detect_cycle(tasks)?;

    let layer_index = layer(tasks);
    let depth = layer_index.values().copied().max().map_or(0, |d| d + 1);
    let mut layers: Vec<Vec<String>> = vec![Vec::new(); depth];
    for (id, layer) in &layer_index {
        layers[*layer].push(id.clone());
    }
    for layer in &mut layers {
        layer.sort();
    }

    let critical_path = critical_path(tasks, &layer_index);

    Ok(ExecutionPlan {
        layers,
        critical_path,
        tasks: tasks.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        layer_index,
    })
}

#[derive(Clone, Copy, PartialEq)]
enum Color {
    White,
    Gray,
    Black,
}

/// Three-color DFS over each task's dependency list.
///
/// A gray -> gray edge closes a cycle; the reported path is the DFS
/// stack sliced from the first occurrence of the back-edge target,
/// with the target appended so the path reads as a closed loop.
fn detect_cycle(tasks: &BTreeMap<String, Task>) -> GraphResult<()> {
    let mut colors: HashMap<&str, Color> =
        tasks.keys().map(|id| (id.as_str(), Color::White)).collect();
    let mut stack: Vec<&str> = Vec::new();

    // Iterative DFS; roots visited in identifier order for determinism.
    for start in tasks.keys() {
        if colors[start.as_str()] != Color::White {
            continue;
        }
        // Each frame tracks the next dependency index to descend into.
        let mut frames: Vec<(&str, usize)> = vec![(start.as_str(), 0)];
        colors.insert(start.as_str(), Color::Gray);
        stack.push(start.as_str());

        loop {
            let descend = {
                let Some((id, next)) = frames.last_mut() else {
                    break;
                };
                let deps = &tasks[*id].deps;
                if *next < deps.len() {
                    let dep = deps[*next].as_str();
                    *next += 1;
                    Some(dep)
                } else {
                    colors.insert(*id, Color::Black);
                    stack.pop();
                    None
                }
            };
            match descend {
                Some(dep) => match colors[dep] {
                    Color::White => {
                        colors.insert(dep, Color::Gray);
                        stack.push(dep);
                        frames.push((dep, 0));
                    }
                    Color::Gray => {
                        let first = stack.iter().position(|s| *s == dep).unwrap_or(0);
                        let mut path: Vec<String> =
                            stack[first..].iter().map(|s| s.to_string()).collect();
                        path.push(dep.to_string());
                        return Err(GraphError::CyclicDependency { path });
                    }
                    Color::Black => {}
                },
                None => {
                    frames.pop();
                }
            }
        }
    }
    Ok(())
}

/// Kahn's algorithm on in-degrees.
///
/// `layer(t) = 0` for roots, else `1 + max(layer(d) for d in deps)`.
fn layer(tasks: &BTreeMap<String, Task>) -> HashMap<String, usize> {
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    let mut remaining: HashMap<&str, usize> = HashMap::new();
    for task in tasks.values() {
        remaining.insert(task.id.as_str(), task.deps.len());
        for dep in &task.deps {
            dependents
                .entry(dep.as_str())
                .or_default()
                .push(task.id.as_str());
        }
    }

    let mut layers: HashMap<String, usize> = HashMap::new();
    let mut queue: VecDeque<&str> = tasks
        .values()
        .filter(|t| t.deps.is_empty())
        .map(|t| t.id.as_str())
        .collect();
    for root in &queue {
        layers.insert(root.to_string(), 0);
    }

    while let Some(id) = queue.pop_front() {
        let depth = layers[id];
        for dependent in dependents.get(id).into_iter().flatten() {
            let entry = layers.entry(dependent.to_string()).or_insert(0);
            *entry = (*entry).max(depth + 1);
            let left = remaining
                .get_mut(dependent)
                .map(|r| {
                    *r -= 1;
                    *r
                })
                .unwrap_or(0);
            if left == 0 {
                queue.push_back(dependent);
            }
        }
    }
    layers
}

/// Longest-path DP in topological (layer) order with back-pointers.
fn critical_path(
    tasks: &BTreeMap<String, Task>,
    layer_index: &HashMap<String, usize>,
) -> Vec<String> {
    if tasks.is_empty() {
        return Vec::new();
    }

    // Process in layer order; identifier order within a layer keeps
    // tie-breaks deterministic.
    let mut order: Vec<&str> = tasks.keys().map(String::as_str).collect();
    order.sort_by_key(|id| (layer_index.get(*id).copied().unwrap_or(0), *id));

    let mut dist: HashMap<&str, usize> = HashMap::new();
    let mut back: HashMap<&str, &str> = HashMap::new();
    for id in &order {
        let mut best = 0usize;
        let mut best_dep: Option<&str> = None;
        let mut deps: Vec<&str> = tasks[*id].deps.iter().map(String::as_str).collect();
        deps.sort();
        for dep in deps {
            let d = dist.get(dep).copied().unwrap_or(0);
            if d > best || best_dep.is_none() {
                best = d;
                best_dep = Some(dep);
            }
        }
        if let Some(dep) = best_dep {
            dist.insert(id, best + 1);
            back.insert(id, dep);
        } else {
            dist.insert(id, 1);
        }
    }

    let end = order
        .iter()
        .max_by_key(|id| (dist.get(**id).copied().unwrap_or(0), std::cmp::Reverse(**id)))
        .copied();
    let Some(mut cursor) = end else {
        return Vec::new();
    };

    let mut path = vec![cursor.to_string()];
    while let Some(prev) = back.get(cursor).copied() {
        path.push(prev.to_string());
        cursor = prev;
    }
    path.reverse();
    path
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Graph;

    fn graph_of(specs: &[(&str, &[&str])]) -> Graph {
        let mut graph = Graph::new();
        for (id, deps) in specs {
            graph
                .add_task(Task::new(*id, *id).with_deps(deps.iter().copied()))
                .unwrap();
        }
        graph
    }

    #[test]
    fn test_empty_graph_compiles_to_empty_plan() {
        let plan = Graph::new().compile().unwrap();
        assert!(plan.layers().is_empty());
        assert!(plan.critical_path().is_empty());
        assert!(plan.is_empty());
    }

    #[test]
    fn test_single_task_plan() {
        let plan = graph_of(&[("a", &[])]).compile().unwrap();
        assert_eq!(plan.layers(), &[vec!["a".to_string()]]);
        assert_eq!(plan.critical_path(), &["a".to_string()]);
    }

    #[test]
    fn test_diamond_layers() {
        let plan = graph_of(&[
            ("a", &[]),
            ("b", &["a"]),
            ("c", &["a"]),
            ("d", &["b", "c"]),
        ])
        .compile()
        .unwrap();
        assert_eq!(
            plan.layers(),
            &[
                vec!["a".to_string()],
                vec!["b".to_string(), "c".to_string()],
                vec!["d".to_string()],
            ]
        );
        assert_eq!(plan.critical_path().len(), 3);
    }

    #[test]
    fn test_linear_chain_layers_and_critical_path() {
        let plan = graph_of(&[("a", &[]), ("b", &["a"]), ("c", &["b"])])
            .compile()
            .unwrap();
        assert_eq!(
            plan.layers(),
            &[
                vec!["a".to_string()],
                vec!["b".to_string()],
                vec!["c".to_string()],
            ]
        );
        assert_eq!(
            plan.critical_path(),
            &["a".to_string(), "b".to_string(), "c".to_string()]
        );
    }

    #[test]
    fn test_missing_dependency_rejected() {
        let err = graph_of(&[("a", &["ghost"])]).compile().unwrap_err();
        assert_eq!(
            err,
            GraphError::MissingDependency {
                task: "a".to_string(),
                dependency: "ghost".to_string(),
            }
        );
    }

    #[test]
    fn test_cycle_path_closes_on_first_node() {
        let err = graph_of(&[("a", &["c"]), ("b", &["a"]), ("c", &["b"])])
            .compile()
            .unwrap_err();
        let GraphError::CyclicDependency { path } = err else {
            panic!("expected cycle error");
        };
        assert_eq!(path, vec!["a", "c", "b", "a"]);
    }

    #[test]
    fn test_two_node_cycle() {
        let err = graph_of(&[("x", &["y"]), ("y", &["x"])]).compile().unwrap_err();
        let GraphError::CyclicDependency { path } = err else {
            panic!("expected cycle error");
        };
        assert_eq!(path.first(), path.last());
        assert_eq!(path.len(), 3);
    }

    #[test]
    fn test_layer_of_and_lookup() {
        let mut graph = graph_of(&[("a", &[]), ("b", &["a"])]);
        let plan = graph.compile().unwrap();
        assert_eq!(plan.layer_of("a"), Some(0));
        assert_eq!(plan.layer_of("b"), Some(1));
        assert!(plan.task("b").is_some());
        assert_eq!(plan.tasks_in_layer(1), &["b".to_string()]);
        assert!(plan.tasks_in_layer(7).is_empty());
    }

    #[test]
    fn test_wide_graph_in_layer_order_is_lexicographic() {
        let plan = graph_of(&[("m", &[]), ("z", &[]), ("a", &[])]).compile().unwrap();
        assert_eq!(
            plan.layers(),
            &[vec!["a".to_string(), "m".to_string(), "z".to_string()]]
        );
    }
}
