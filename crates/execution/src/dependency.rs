//! Dependency graph of chain nodes.

use std::collections::{HashMap, HashSet, VecDeque};

use relay_core::NodeStatus;

use crate::error::{ExecutionError, Result};

/// Result of checking one node's dependencies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Every dependency completed
    Ready,
    /// These dependencies did not complete
    Blocked(Vec<String>),
    /// These dependencies were skipped by their condition (none failed)
    Skipped(Vec<String>),
}

/// Validated dependency graph over node ids.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    /// Node ids in declaration order
    order: Vec<String>,
    /// node -> [dependencies]
    graph: HashMap<String, Vec<String>>,
    /// node -> [dependents]
    reverse: HashMap<String, Vec<String>>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    InProgress,
    Done,
}

impl DependencyGraph {
    /// Build from `(id, dependencies)` pairs.
    ///
    /// Rejects an empty node list, duplicate ids and dependencies on unknown
    /// nodes. Cycles are not checked here; see [`find_cycle`](Self::find_cycle).
    pub fn new<'a, I, D>(nodes: I) -> Result<Self>
    where
        I: IntoIterator<Item = (&'a str, D)>,
        D: IntoIterator<Item = &'a str>,
    {
        let mut order = Vec::new();
        let mut graph: HashMap<String, Vec<String>> = HashMap::new();

        for (id, deps) in nodes {
            if graph.contains_key(id) {
                return Err(ExecutionError::InvalidConfiguration(format!("duplicate node id '{}'", id)));
            }
            order.push(id.to_string());
            graph.insert(id.to_string(), deps.into_iter().map(str::to_string).collect());
        }

        if order.is_empty() {
            return Err(ExecutionError::InvalidConfiguration("chain has no nodes".to_string()));
        }

        let mut reverse: HashMap<String, Vec<String>> = HashMap::new();
        for id in &order {
            for dep in &graph[id] {
                if !graph.contains_key(dep) {
                    return Err(ExecutionError::InvalidConfiguration(format!(
                        "node '{}' depends on unknown node '{}'",
                        id, dep
                    )));
                }
                reverse.entry(dep.clone()).or_default().push(id.clone());
            }
        }

        Ok(Self { order, graph, reverse })
    }

    /// Declared dependencies of `id`.
    pub fn dependencies(&self, id: &str) -> &[String] {
        self.graph.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Nodes that depend directly on `id`.
    pub fn dependents(&self, id: &str) -> &[String] {
        self.reverse.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Find a cycle with a three-colour depth-first search.
    ///
    /// The returned path starts and ends at the same node, e.g. `[a, b, a]`.
    pub fn find_cycle(&self) -> Option<Vec<String>> {
        let mut marks: HashMap<&str, Mark> = self.order.iter().map(|id| (id.as_str(), Mark::Unvisited)).collect();
        let mut path: Vec<&str> = Vec::new();

        for start in &self.order {
            if marks[start.as_str()] == Mark::Unvisited {
                if let Some(cycle) = self.visit(start, &mut marks, &mut path) {
                    return Some(cycle);
                }
            }
        }
        None
    }

    fn visit<'g>(
        &'g self,
        id: &'g str,
        marks: &mut HashMap<&'g str, Mark>,
        path: &mut Vec<&'g str>,
    ) -> Option<Vec<String>> {
        marks.insert(id, Mark::InProgress);
        path.push(id);

        for dep in self.dependencies(id) {
            match marks[dep.as_str()] {
                Mark::InProgress => {
                    let from = path.iter().position(|n| *n == dep.as_str()).unwrap_or(0);
                    let mut cycle: Vec<String> = path[from..].iter().map(|n| n.to_string()).collect();
                    cycle.push(dep.clone());
                    return Some(cycle);
                }
                Mark::Unvisited => {
                    if let Some(cycle) = self.visit(dep, marks, path) {
                        return Some(cycle);
                    }
                }
                Mark::Done => {}
            }
        }

        path.pop();
        marks.insert(id, Mark::Done);
        None
    }

    /// Node ids with every dependency before its dependents.
    ///
    /// Among nodes that are ready at the same time, declaration order wins.
    /// Fails with [`ExecutionError::CircularDependency`] on a cycle.
    pub fn topological_sort(&self) -> Result<Vec<String>> {
        if let Some(cycle) = self.find_cycle() {
            return Err(ExecutionError::CircularDependency(cycle));
        }

        let position: HashMap<&str, usize> =
            self.order.iter().enumerate().map(|(i, id)| (id.as_str(), i)).collect();
        let mut remaining: HashMap<&str, usize> = self
            .order
            .iter()
            .map(|id| (id.as_str(), self.dependencies(id).len()))
            .collect();

        // Nodes with no dependencies
        let mut ready: VecDeque<&str> = self
            .order
            .iter()
            .map(String::as_str)
            .filter(|id| remaining[id] == 0)
            .collect();
        let mut sorted = Vec::with_capacity(self.order.len());

        while let Some(id) = ready.pop_front() {
            sorted.push(id.to_string());

            let mut unlocked = Vec::new();
            for dependent in self.dependents(id) {
                if let Some(count) = remaining.get_mut(dependent.as_str()) {
                    *count -= 1;
                    if *count == 0 {
                        unlocked.push(dependent.as_str());
                    }
                }
            }
            unlocked.sort_by_key(|id| position[id]);
            ready.extend(unlocked);
        }

        Ok(sorted)
    }

    /// Check `id`'s dependencies against the current node statuses.
    pub fn resolve(&self, id: &str, statuses: &HashMap<String, NodeStatus>) -> Resolution {
        let mut blocked = Vec::new();
        let mut skipped = Vec::new();

        for dep in self.dependencies(id) {
            match statuses.get(dep) {
                Some(NodeStatus::Completed) => {}
                Some(NodeStatus::Skipped) => skipped.push(dep.clone()),
                _ => blocked.push(dep.clone()),
            }
        }

        if !blocked.is_empty() {
            Resolution::Blocked(blocked)
        } else if !skipped.is_empty() {
            Resolution::Skipped(skipped)
        } else {
            Resolution::Ready
        }
    }

    /// Every node reachable from `id` through dependents.
    pub fn downstream(&self, id: &str) -> HashSet<String> {
        let mut seen = HashSet::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            for dependent in self.dependents(current) {
                if seen.insert(dependent.clone()) {
                    stack.push(dependent.as_str());
                }
            }
        }
        seen
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph(nodes: &[(&str, &[&str])]) -> Result<DependencyGraph> {
        DependencyGraph::new(nodes.iter().map(|(id, deps)| (*id, deps.iter().copied())))
    }

    #[test]
    fn test_linear_order() {
        let g = graph(&[("c", &["b"]), ("a", &[]), ("b", &["a"])]).unwrap();
        assert_eq!(g.topological_sort().unwrap(), vec!["a", "b", "c"]);
        assert_eq!(g.dependents("a"), ["b".to_string()]);
    }

    #[test]
    fn test_diamond_keeps_declaration_order() {
        let g = graph(&[
            ("fetch", &[]),
            ("audio", &["fetch"]),
            ("video", &["fetch"]),
            ("mux", &["video", "audio"]),
        ])
        .unwrap();
        assert_eq!(g.topological_sort().unwrap(), vec!["fetch", "audio", "video", "mux"]);
        assert_eq!(g.downstream("fetch").len(), 3);
    }

    #[test]
    fn test_two_node_cycle() {
        let g = graph(&[("a", &["b"]), ("b", &["a"])]).unwrap();
        let cycle = g.find_cycle().unwrap();
        assert_eq!(cycle.first(), cycle.last());
        assert_eq!(cycle.len(), 3);

        match g.topological_sort() {
            Err(ExecutionError::CircularDependency(path)) => assert_eq!(path, cycle),
            other => panic!("expected a cycle, got {:?}", other),
        }
    }

    #[test]
    fn test_cycle_behind_acyclic_prefix() {
        let g = graph(&[("root", &[]), ("x", &["root", "z"]), ("y", &["x"]), ("z", &["y"])]).unwrap();
        let cycle = g.find_cycle().unwrap();
        assert!(!cycle.contains(&"root".to_string()));
        assert_eq!(cycle.len(), 4);
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let g = graph(&[("a", &["a"])]).unwrap();
        assert_eq!(g.find_cycle().unwrap(), vec!["a", "a"]);
    }

    #[test]
    fn test_invalid_graphs() {
        assert!(matches!(graph(&[]), Err(ExecutionError::InvalidConfiguration(_))));
        assert!(matches!(
            graph(&[("a", &[]), ("a", &[])]),
            Err(ExecutionError::InvalidConfiguration(_))
        ));
        let err = graph(&[("a", &["ghost"])]).unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn test_resolve() {
        let g = graph(&[("a", &[]), ("b", &[]), ("c", &["a", "b"])]).unwrap();
        let mut statuses = HashMap::from([
            ("a".to_string(), NodeStatus::Completed),
            ("b".to_string(), NodeStatus::Completed),
        ]);
        assert_eq!(g.resolve("c", &statuses), Resolution::Ready);

        statuses.insert("b".to_string(), NodeStatus::Skipped);
        assert_eq!(g.resolve("c", &statuses), Resolution::Skipped(vec!["b".to_string()]));

        statuses.insert("a".to_string(), NodeStatus::Failed);
        assert_eq!(g.resolve("c", &statuses), Resolution::Blocked(vec!["a".to_string()]));
    }
}
