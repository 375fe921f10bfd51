//! DAG of task id → prerequisites, with DFS cycle detection and ready-set
//! computation. Grounded on the original's adjacency-map representation
//! (`parallel_executor.py`'s `DependencyGraph`), rendered with two
//! `HashMap<TaskId, HashSet<TaskId>>`s kept in sync on every edge mutation.

use std::collections::{HashMap, HashSet};

use crate::task::TaskId;

/// Prerequisite/dependent adjacency maps over a set of task ids.
#[derive(Debug, Default)]
pub struct DependencyGraph {
    prereqs: HashMap<TaskId, HashSet<TaskId>>,
    dependents: HashMap<TaskId, HashSet<TaskId>>,
}

impl DependencyGraph {
    /// An empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `task` as known, with no edges, if not already present.
    pub fn add_node(&mut self, task: &TaskId) {
        self.prereqs.entry(task.clone()).or_default();
        self.dependents.entry(task.clone()).or_default();
    }

    /// Records that `task` depends on `prereq`.
    pub fn add_edge(&mut self, task: &TaskId, prereq: &TaskId) {
        self.add_node(task);
        self.add_node(prereq);
        self.prereqs.get_mut(task).unwrap().insert(prereq.clone());
        self.dependents.get_mut(prereq).unwrap().insert(task.clone());
    }

    /// Removes the `task depends on prereq` edge, if present.
    pub fn remove_edge(&mut self, task: &TaskId, prereq: &TaskId) {
        if let Some(set) = self.prereqs.get_mut(task) {
            set.remove(prereq);
        }
        if let Some(set) = self.dependents.get_mut(prereq) {
            set.remove(task);
        }
    }

    /// Direct prerequisites of `task`.
    pub fn prereqs_of(&self, task: &TaskId) -> HashSet<TaskId> {
        self.prereqs.get(task).cloned().unwrap_or_default()
    }

    /// Direct dependents of `task`.
    pub fn dependents_of(&self, task: &TaskId) -> HashSet<TaskId> {
        self.dependents.get(task).cloned().unwrap_or_default()
    }

    /// All transitive dependents of `task` (used by cascade cancel).
    pub fn transitive_dependents(&self, task: &TaskId) -> HashSet<TaskId> {
        let mut seen = HashSet::new();
        let mut stack: Vec<TaskId> = self.dependents_of(task).into_iter().collect();
        while let Some(next) = stack.pop() {
            if seen.insert(next.clone()) {
                stack.extend(self.dependents_of(&next));
            }
        }
        seen
    }

    /// All known task ids.
    pub fn nodes(&self) -> impl Iterator<Item = &TaskId> {
        self.prereqs.keys()
    }

    /// DFS with a recursion stack over `prereqs`; O(V+E). Returns the id
    /// that closes a cycle, if any.
    pub fn find_cycle(&self) -> Option<TaskId> {
        let mut visited: HashSet<TaskId> = HashSet::new();
        let mut on_stack: HashSet<TaskId> = HashSet::new();

        for start in self.prereqs.keys() {
            if visited.contains(start) {
                continue;
            }
            if let Some(culprit) = self.dfs(start, &mut visited, &mut on_stack) {
                return Some(culprit);
            }
        }
        None
    }

    fn dfs(
        &self,
        node: &TaskId,
        visited: &mut HashSet<TaskId>,
        on_stack: &mut HashSet<TaskId>,
    ) -> Option<TaskId> {
        visited.insert(node.clone());
        on_stack.insert(node.clone());

        if let Some(prereqs) = self.prereqs.get(node) {
            for prereq in prereqs {
                if on_stack.contains(prereq) {
                    return Some(prereq.clone());
                }
                if !visited.contains(prereq) {
                    if let Some(culprit) = self.dfs(prereq, visited, on_stack) {
                        return Some(culprit);
                    }
                }
            }
        }

        on_stack.remove(node);
        None
    }

    /// Whether the graph currently contains a cycle.
    pub fn has_cycle(&self) -> bool {
        self.find_cycle().is_some()
    }

    /// Every known id not in `completed` whose prerequisites are all in
    /// `completed`.
    pub fn ready(&self, completed: &HashSet<TaskId>) -> HashSet<TaskId> {
        self.prereqs
            .iter()
            .filter(|(id, prereqs)| !completed.contains(*id) && prereqs.iter().all(|p| completed.contains(p)))
            .map(|(id, _)| id.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ready_set_respects_prerequisites() {
        let mut graph = DependencyGraph::new();
        graph.add_edge(&"t2".to_string(), &"t1".to_string());
        graph.add_edge(&"t3".to_string(), &"t1".to_string());

        let completed = HashSet::new();
        let ready = graph.ready(&completed);
        assert!(ready.contains("t1"));
        assert!(!ready.contains("t2"));
        assert!(!ready.contains("t3"));

        let mut completed = HashSet::new();
        completed.insert("t1".to_string());
        let ready = graph.ready(&completed);
        assert!(ready.contains("t2"));
        assert!(ready.contains("t3"));
    }

    #[test]
    fn detects_a_cycle() {
        let mut graph = DependencyGraph::new();
        graph.add_edge(&"a".to_string(), &"b".to_string());
        graph.add_edge(&"b".to_string(), &"c".to_string());
        graph.add_edge(&"c".to_string(), &"a".to_string());

        assert!(graph.has_cycle());
    }

    #[test]
    fn acyclic_graph_has_no_cycle() {
        let mut graph = DependencyGraph::new();
        graph.add_edge(&"t2".to_string(), &"t1".to_string());
        graph.add_edge(&"t3".to_string(), &"t1".to_string());

        assert!(!graph.has_cycle());
    }

    #[test]
    fn transitive_dependents_walks_the_whole_chain() {
        let mut graph = DependencyGraph::new();
        graph.add_edge(&"b".to_string(), &"a".to_string());
        graph.add_edge(&"c".to_string(), &"b".to_string());

        let dependents = graph.transitive_dependents(&"a".to_string());
        assert!(dependents.contains("b"));
        assert!(dependents.contains("c"));
    }
}
