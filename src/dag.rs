//! Dependency graph construction, cycle detection and topological
//! levelling over task names.
//!
//! Keys nodes by task name rather than `TypeId` so dependencies resolve
//! across tasks loaded from a catalogue file, reports the actual cycle
//! path (not just a yes/no), and computes parallel-execution levels.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::catalog::TaskTable;
use crate::error::ZrError;

/// The dependency graph restricted to one invocation's transitive closure
/// of requested tasks.
#[derive(Debug, Clone)]
pub struct Dag {
    /// Direct dependencies of each task, keyed by task name.
    edges: HashMap<String, Vec<String>>,
}

impl Dag {
    /// Build the transitive closure of `roots` within `table`.
    ///
    /// # Errors
    ///
    /// Returns [`ZrError::UnknownTask`] if a root isn't in `table`, and
    /// [`ZrError::UnknownDependency`] if any reachable task names a
    /// dependency that isn't in `table`.
    pub fn build(table: &TaskTable, roots: &[String]) -> Result<Self, ZrError> {
        let mut edges = HashMap::new();
        let mut queue: VecDeque<String> = VecDeque::new();

        for root in roots {
            if table.get(root).is_none() {
                return Err(ZrError::UnknownTask(root.clone()));
            }
            queue.push_back(root.clone());
        }

        while let Some(name) = queue.pop_front() {
            if edges.contains_key(&name) {
                continue;
            }
            let task = table.get(&name).ok_or_else(|| ZrError::UnknownTask(name.clone()))?;
            for dep in &task.deps {
                if table.get(dep).is_none() {
                    return Err(ZrError::UnknownDependency {
                        task: name.clone(),
                        dep: dep.clone(),
                    });
                }
                queue.push_back(dep.clone());
            }
            edges.insert(name, task.deps.clone());
        }

        Ok(Self { edges })
    }

    /// Names of every task reachable from the requested roots.
    pub fn node_names(&self) -> impl Iterator<Item = &str> {
        self.edges.keys().map(String::as_str)
    }

    /// Direct dependencies of `name`, or an empty slice if `name` isn't in
    /// this graph.
    #[must_use]
    pub fn dependencies_of(&self, name: &str) -> &[String] {
        self.edges.get(name).map_or(&[], Vec::as_slice)
    }

    /// Number of nodes in the graph.
    #[must_use]
    pub fn len(&self) -> usize {
        self.edges.len()
    }

    /// Whether the graph has no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    /// Find a cycle reachable from any node, if one exists.
    ///
    /// Returns the cycle as an ordered path where the first and last
    /// elements are equal, in the order the cycle was discovered during a
    /// depth-first walk. Iterative to avoid recursion depth limits on
    /// pathological inputs.
    #[must_use]
    pub fn find_cycle(&self) -> Option<Vec<String>> {
        #[derive(Clone, Copy, PartialEq, Eq)]
        enum Color {
            White,
            Gray,
            Black,
        }

        let mut color: HashMap<&str, Color> =
            self.edges.keys().map(|k| (k.as_str(), Color::White)).collect();
        let mut stack: Vec<(&str, usize)> = Vec::new();

        let mut names: Vec<&str> = self.edges.keys().map(String::as_str).collect();
        names.sort_unstable();

        for start in names {
            if color.get(start).copied() != Some(Color::White) {
                continue;
            }
            stack.push((start, 0));
            color.insert(start, Color::Gray);

            while let Some(&(node, idx)) = stack.last() {
                let deps = self.dependencies_of(node);
                if let Some(dep) = deps.get(idx) {
                    if let Some(top) = stack.last_mut() {
                        top.1 += 1;
                    }
                    match color.get(dep.as_str()).copied() {
                        Some(Color::Gray) => {
                            let mut path: Vec<String> =
                                stack.iter().map(|(n, _)| (*n).to_string()).collect();
                            while path.first().map(String::as_str) != Some(dep.as_str()) {
                                path.remove(0);
                            }
                            path.push(dep.clone());
                            return Some(path);
                        }
                        Some(Color::White) => {
                            color.insert(dep.as_str(), Color::Gray);
                            stack.push((dep.as_str(), 0));
                        }
                        Some(Color::Black) | None => {}
                    }
                } else {
                    color.insert(node, Color::Black);
                    stack.pop();
                }
            }
        }
        None
    }

    /// Compute topological execution levels: level 0 contains every task
    /// with no unresolved dependencies, level `k` contains tasks whose
    /// dependencies all finish by level `k - 1`. Each level's names are
    /// sorted for deterministic dispatch order.
    ///
    /// # Errors
    ///
    /// Returns [`ZrError::CycleDetected`] if the graph contains a cycle.
    pub fn levels(&self) -> Result<Vec<Vec<String>>, ZrError> {
        if let Some(path) = self.find_cycle() {
            return Err(ZrError::CycleDetected { path });
        }

        let mut remaining_deps: HashMap<&str, HashSet<&str>> = self
            .edges
            .iter()
            .map(|(name, deps)| (name.as_str(), deps.iter().map(String::as_str).collect()))
            .collect();
        let mut levels = Vec::new();

        while !remaining_deps.is_empty() {
            let mut ready: Vec<&str> = remaining_deps
                .iter()
                .filter(|(_, deps)| deps.is_empty())
                .map(|(name, _)| *name)
                .collect();
            ready.sort_unstable();

            if ready.is_empty() {
                return Err(ZrError::Internal(
                    "levelling stalled without a detected cycle".to_string(),
                ));
            }

            for name in &ready {
                remaining_deps.remove(name);
            }
            for deps in remaining_deps.values_mut() {
                for name in &ready {
                    deps.remove(name);
                }
            }
            levels.push(ready.into_iter().map(str::to_string).collect());
        }

        Ok(levels)
    }
}
