//! # Depgraph
//!
//! Directed "must start before" graph over observed containers,
//! built from compose `depends_on` labels, `network_mode:
//! service:X`, and the `docksmith.restart-after` label.
//!
//! Nodes live in an arena keyed by name with adjacency lists;
//! traversals never follow owning pointers. Cycles are a hard
//! error detected before any traversal result is used.

use std::collections::{BTreeSet, HashMap};

use docksmith_client::entities::container::ContainerInfo;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GraphError {
  #[error("dependency cycle detected: {}", path.join(" -> "))]
  Cycle { path: Vec<String> },
}

#[derive(Debug, Default)]
struct Node {
  name: String,
  /// Containers this one depends on (must start before it).
  deps: Vec<usize>,
  /// Insertion order, used as the deterministic tie-break.
  order: usize,
}

/// Dependency graph over a set of containers.
#[derive(Debug, Default)]
pub struct DependencyGraph {
  nodes: Vec<Node>,
  by_name: HashMap<String, usize>,
}

impl DependencyGraph {
  /// Build from observed containers. Dependencies naming containers
  /// outside the set are ignored; duplicates are collapsed.
  pub fn from_containers(
    containers: &[ContainerInfo],
  ) -> DependencyGraph {
    let mut graph = DependencyGraph::default();
    for container in containers {
      graph.add_node(&container.name);
    }
    for container in containers {
      // Compose service names and container names coincide for the
      // single-host stacks docksmith manages; resolve either.
      let mut deps = container.depends_on();
      if let Some(dep) = container.network_mode_dependency() {
        deps.push(dep);
      }
      deps.extend(container.restart_after());
      for dep in deps {
        graph.add_edge(&container.name, &dep);
      }
    }
    graph
  }

  pub fn add_node(&mut self, name: &str) -> usize {
    if let Some(&idx) = self.by_name.get(name) {
      return idx;
    }
    let idx = self.nodes.len();
    self.nodes.push(Node {
      name: name.to_string(),
      deps: Vec::new(),
      order: idx,
    });
    self.by_name.insert(name.to_string(), idx);
    idx
  }

  /// Add a "`from` depends on `to`" edge. Unknown targets are
  /// ignored, self-edges and duplicates dropped.
  pub fn add_edge(&mut self, from: &str, to: &str) {
    let (Some(&from), Some(&to)) =
      (self.by_name.get(from), self.by_name.get(to))
    else {
      return;
    };
    if from == to || self.nodes[from].deps.contains(&to) {
      return;
    }
    self.nodes[from].deps.push(to);
  }

  pub fn contains(&self, name: &str) -> bool {
    self.by_name.contains_key(name)
  }

  /// Containers that list `name` in their dependency set.
  pub fn dependents(&self, name: &str) -> Vec<String> {
    let Some(&target) = self.by_name.get(name) else {
      return Vec::new();
    };
    self
      .nodes
      .iter()
      .filter(|node| node.deps.contains(&target))
      .map(|node| node.name.clone())
      .collect()
  }

  /// Direct dependencies of `name`.
  pub fn dependencies(&self, name: &str) -> Vec<String> {
    let Some(&idx) = self.by_name.get(name) else {
      return Vec::new();
    };
    self.nodes[idx]
      .deps
      .iter()
      .map(|&dep| self.nodes[dep].name.clone())
      .collect()
  }

  /// Kahn's algorithm. Ready nodes are taken in insertion order so
  /// the result is deterministic. Errors with a concrete cycle
  /// path when no topological order exists.
  pub fn topological_sort(&self) -> Result<Vec<String>, GraphError> {
    // indegree of X = number of dependencies X waits on.
    let mut indegree: Vec<usize> =
      self.nodes.iter().map(|node| node.deps.len()).collect();
    let mut ready: BTreeSet<usize> = indegree
      .iter()
      .enumerate()
      .filter(|&(_, &n)| n == 0)
      .map(|(idx, _)| idx)
      .collect();
    let mut order = Vec::with_capacity(self.nodes.len());
    while let Some(&next) = ready.iter().next() {
      ready.remove(&next);
      order.push(self.nodes[next].name.clone());
      for (idx, node) in self.nodes.iter().enumerate() {
        if node.deps.contains(&next) {
          indegree[idx] -= 1;
          if indegree[idx] == 0 {
            ready.insert(idx);
          }
        }
      }
    }
    if order.len() != self.nodes.len() {
      let path = self.find_cycle().unwrap_or_default();
      return Err(GraphError::Cycle { path });
    }
    Ok(order)
  }

  /// Dependencies-first order for updates.
  pub fn update_order(&self) -> Result<Vec<String>, GraphError> {
    self.topological_sort()
  }

  /// Reverse of the update order: leaves restart first.
  pub fn restart_order(&self) -> Result<Vec<String>, GraphError> {
    let mut order = self.topological_sort()?;
    order.reverse();
    Ok(order)
  }

  /// A concrete cycle path for diagnostics, if one exists.
  pub fn find_cycle(&self) -> Option<Vec<String>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
      White,
      Grey,
      Black,
    }
    let mut marks = vec![Mark::White; self.nodes.len()];
    let mut stack = Vec::new();

    fn visit(
      graph: &DependencyGraph,
      idx: usize,
      marks: &mut [Mark],
      stack: &mut Vec<usize>,
    ) -> Option<Vec<usize>> {
      marks[idx] = Mark::Grey;
      stack.push(idx);
      for &dep in &graph.nodes[idx].deps {
        match marks[dep] {
          Mark::Grey => {
            let start = stack
              .iter()
              .position(|&node| node == dep)
              .unwrap_or(0);
            let mut path: Vec<usize> = stack[start..].to_vec();
            path.push(dep);
            return Some(path);
          }
          Mark::White => {
            if let Some(path) = visit(graph, dep, marks, stack) {
              return Some(path);
            }
          }
          Mark::Black => {}
        }
      }
      stack.pop();
      marks[idx] = Mark::Black;
      None
    }

    for idx in 0..self.nodes.len() {
      if marks[idx] == Mark::White {
        if let Some(path) =
          visit(self, idx, &mut marks, &mut stack)
        {
          return Some(
            path
              .into_iter()
              .map(|idx| self.nodes[idx].name.clone())
              .collect(),
          );
        }
      }
    }
    None
  }
}
