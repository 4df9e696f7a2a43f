use crate::config::ServiceSpec;
use crate::error::{Error, Result};
use std::collections::{HashMap, HashSet};

/// DFS marking used for cycle detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    InProgress,
    Done,
}

/// Dependency graph of a project's services.
///
/// Built once per orchestration run and read-only afterwards. Construction
/// fails on unknown dependency names and on cycles, so a `Graph` in hand is
/// always a DAG with a level assigned to every node.
#[derive(Debug, Clone, Default)]
pub struct Graph {
    /// Nodes in declaration order.
    order: Vec<String>,
    /// `edges[A] = [B, C]` means A uses B and C
    edges: HashMap<String, Vec<String>>,
    /// `reverse[A] = [B, C]` means B and C use A
    reverse: HashMap<String, Vec<String>>,
    levels: HashMap<String, usize>,
}

impl Graph {
    /// Build the graph from service specs.
    ///
    /// Unresolved `uses` names are a configuration error, and any cycle is
    /// reported with the services that form it. Nothing is started if this
    /// fails.
    pub fn build(specs: &[ServiceSpec]) -> Result<Self> {
        let declared: HashSet<&str> = specs.iter().map(|s| s.name.as_str()).collect();
        let mut graph = Graph::default();

        for spec in specs {
            graph.add_node(&spec.name);
        }

        for spec in specs {
            for dep in &spec.uses {
                if !declared.contains(dep.as_str()) {
                    return Err(Error::UnknownDependency {
                        service: spec.name.clone(),
                        dependency: dep.clone(),
                    });
                }
                graph.add_edge(&spec.name, dep);
            }
        }

        if let Some(cycle) = graph.find_cycle() {
            return Err(Error::CircularDependency(cycle));
        }

        graph.compute_levels();
        Ok(graph)
    }

    fn add_node(&mut self, name: &str) {
        if !self.edges.contains_key(name) {
            self.order.push(name.to_string());
            self.edges.insert(name.to_string(), Vec::new());
            self.reverse.insert(name.to_string(), Vec::new());
        }
    }

    fn add_edge(&mut self, from: &str, to: &str) {
        let deps = self.edges.entry(from.to_string()).or_default();
        if deps.iter().any(|d| d == to) {
            return;
        }
        deps.push(to.to_string());
        self.reverse
            .entry(to.to_string())
            .or_default()
            .push(from.to_string());
    }

    /// Three-color DFS. A back edge to an in-progress node closes a cycle,
    /// which is returned as a path ending where it started.
    fn find_cycle(&self) -> Option<Vec<String>> {
        let mut marks: HashMap<&str, Mark> =
            self.order.iter().map(|n| (n.as_str(), Mark::Unvisited)).collect();
        let mut path = Vec::new();

        for node in &self.order {
            if marks.get(node.as_str()) == Some(&Mark::Unvisited) {
                if let Some(cycle) = self.visit(node, &mut marks, &mut path) {
                    return Some(cycle);
                }
            }
        }
        None
    }

    fn visit<'a>(
        &'a self,
        node: &'a str,
        marks: &mut HashMap<&'a str, Mark>,
        path: &mut Vec<&'a str>,
    ) -> Option<Vec<String>> {
        marks.insert(node, Mark::InProgress);
        path.push(node);

        if let Some(deps) = self.edges.get(node) {
            for dep in deps {
                match marks.get(dep.as_str()).copied().unwrap_or(Mark::Unvisited) {
                    Mark::Unvisited => {
                        if let Some(cycle) = self.visit(dep, marks, path) {
                            return Some(cycle);
                        }
                    }
                    Mark::InProgress => {
                        let start = path.iter().position(|n| *n == dep.as_str()).unwrap_or(0);
                        let mut cycle: Vec<String> =
                            path[start..].iter().map(|s| s.to_string()).collect();
                        cycle.push(dep.clone());
                        return Some(cycle);
                    }
                    Mark::Done => {}
                }
            }
        }

        path.pop();
        marks.insert(node, Mark::Done);
        None
    }

    /// level = 1 + max(level of dependencies); dependency-free nodes are 0.
    /// Only called on acyclic graphs.
    fn compute_levels(&mut self) {
        let mut levels = HashMap::with_capacity(self.order.len());
        for node in &self.order {
            self.level_of(node, &mut levels);
        }
        self.levels = levels;
    }

    fn level_of(&self, node: &str, memo: &mut HashMap<String, usize>) -> usize {
        if let Some(level) = memo.get(node) {
            return *level;
        }
        let level = self
            .edges
            .get(node)
            .map(|deps| {
                deps.iter()
                    .map(|dep| self.level_of(dep, memo) + 1)
                    .max()
                    .unwrap_or(0)
            })
            .unwrap_or(0);
        memo.insert(node.to_string(), level);
        level
    }

    /// Level of a node, if it exists.
    pub fn level(&self, node: &str) -> Option<usize> {
        self.levels.get(node).copied()
    }

    /// Nodes grouped by level, ascending. Within a level, declaration order.
    pub fn levels(&self) -> Vec<Vec<String>> {
        let depth = self.levels.values().copied().max().map_or(0, |m| m + 1);
        let mut groups = vec![Vec::new(); depth];
        for node in &self.order {
            if let Some(level) = self.levels.get(node) {
                groups[*level].push(node.clone());
            }
        }
        groups
    }

    /// Levels restricted to `targets` and everything they transitively use.
    pub fn levels_for(&self, targets: &[String]) -> Result<Vec<Vec<String>>> {
        let mut wanted: HashSet<String> = HashSet::new();
        for target in targets {
            if !self.contains(target) {
                return Err(Error::ServiceNotFound(target.clone()));
            }
            wanted.insert(target.clone());
            wanted.extend(self.get_dependencies(target));
        }

        Ok(self
            .levels()
            .into_iter()
            .map(|group| {
                group
                    .into_iter()
                    .filter(|n| wanted.contains(n))
                    .collect::<Vec<_>>()
            })
            .filter(|group| !group.is_empty())
            .collect())
    }

    /// Order in which to stop services: highest level first.
    pub fn stop_order(&self) -> Vec<String> {
        self.levels().into_iter().rev().flatten().collect()
    }

    /// Get all transitive dependencies of a node, dependencies first.
    pub fn get_dependencies(&self, node: &str) -> Vec<String> {
        let mut visited = HashSet::new();
        let mut result = Vec::new();
        self.dfs_dependencies(node, node, &mut visited, &mut result);
        result
    }

    fn dfs_dependencies(
        &self,
        node: &str,
        start_node: &str,
        visited: &mut HashSet<String>,
        result: &mut Vec<String>,
    ) {
        if !visited.insert(node.to_string()) {
            return;
        }

        if let Some(deps) = self.edges.get(node) {
            for dep in deps {
                self.dfs_dependencies(dep, start_node, visited, result);
            }
        }

        if node != start_node {
            result.push(node.to_string());
        }
    }

    /// Get direct dependencies of a node
    pub fn get_direct_dependencies(&self, node: &str) -> Vec<String> {
        self.edges.get(node).cloned().unwrap_or_default()
    }

    /// Get nodes that directly use the given node
    pub fn get_dependents(&self, node: &str) -> Vec<String> {
        self.reverse.get(node).cloned().unwrap_or_default()
    }

    pub fn contains(&self, node: &str) -> bool {
        self.edges.contains_key(node)
    }

    /// Nodes in declaration order.
    pub fn nodes(&self) -> &[String] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str, uses: &[&str]) -> ServiceSpec {
        ServiceSpec::new(name).with_uses(uses)
    }

    #[test]
    fn test_chain_levels() {
        let graph = Graph::build(&[
            spec("web", &["api"]),
            spec("api", &["db"]),
            spec("db", &[]),
        ])
        .unwrap();

        assert_eq!(graph.level("db"), Some(0));
        assert_eq!(graph.level("api"), Some(1));
        assert_eq!(graph.level("web"), Some(2));
        assert_eq!(
            graph.levels(),
            vec![vec!["db".to_string()], vec!["api".to_string()], vec!["web".to_string()]]
        );
        assert_eq!(graph.stop_order(), vec!["web", "api", "db"]);
    }

    #[test]
    fn test_diamond_levels() {
        let graph = Graph::build(&[
            spec("db", &[]),
            spec("cache", &[]),
            spec("api", &["db", "cache"]),
            spec("worker", &["db"]),
            spec("web", &["api", "worker"]),
        ])
        .unwrap();

        let levels = graph.levels();
        assert_eq!(levels.len(), 3);
        assert_eq!(levels[0], vec!["db", "cache"]);
        assert_eq!(levels[1], vec!["api", "worker"]);
        assert_eq!(levels[2], vec!["web"]);
    }

    #[test]
    fn test_level_uses_longest_path() {
        // c uses a directly and through b; it must sit above b.
        let graph = Graph::build(&[
            spec("a", &[]),
            spec("b", &["a"]),
            spec("c", &["a", "b"]),
        ])
        .unwrap();
        assert_eq!(graph.level("c"), Some(2));
    }

    #[test]
    fn test_unknown_dependency() {
        let err = Graph::build(&[spec("api", &["db"])]).unwrap_err();
        match err {
            Error::UnknownDependency {
                service,
                dependency,
            } => {
                assert_eq!(service, "api");
                assert_eq!(dependency, "db");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_cycle_names_participants() {
        let err = Graph::build(&[
            spec("a", &["b"]),
            spec("b", &["c"]),
            spec("c", &["a"]),
            spec("d", &[]),
        ])
        .unwrap_err();

        match err {
            Error::CircularDependency(cycle) => {
                assert_eq!(cycle.first(), cycle.last());
                for name in ["a", "b", "c"] {
                    assert!(cycle.contains(&name.to_string()));
                }
                assert!(!cycle.contains(&"d".to_string()));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_self_cycle() {
        let err = Graph::build(&[spec("a", &["a"])]).unwrap_err();
        assert_eq!(err.to_string(), "Circular dependency detected: a -> a");
    }

    #[test]
    fn test_levels_for_pulls_in_dependencies() {
        let graph = Graph::build(&[
            spec("db", &[]),
            spec("api", &["db"]),
            spec("docs", &[]),
            spec("web", &["api"]),
        ])
        .unwrap();

        let levels = graph.levels_for(&["api".to_string()]).unwrap();
        assert_eq!(levels, vec![vec!["db".to_string()], vec!["api".to_string()]]);
        assert!(graph.levels_for(&["nope".to_string()]).is_err());
    }

    #[test]
    fn test_dependents_and_transitive_dependencies() {
        let graph = Graph::build(&[
            spec("db", &[]),
            spec("api", &["db"]),
            spec("web", &["api"]),
        ])
        .unwrap();
        assert_eq!(graph.get_dependencies("web"), vec!["db", "api"]);
        assert_eq!(graph.get_dependents("db"), vec!["api"]);
        assert_eq!(graph.get_direct_dependencies("web"), vec!["api"]);
    }

    #[test]
    fn test_empty_graph() {
        let graph = Graph::build(&[]).unwrap();
        assert!(graph.is_empty());
        assert!(graph.levels().is_empty());
    }
}
