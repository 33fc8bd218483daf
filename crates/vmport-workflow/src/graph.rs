use std::collections::{BTreeMap, BTreeSet, VecDeque};

/// Dependency graph over the steps of one workflow.
///
/// Edges point from a prerequisite to the steps that depend on it.
#[derive(Debug, Clone)]
pub struct Graph {
  /// step -> steps that depend on it.
  adjacency: BTreeMap<String, Vec<String>>,
  /// step -> its prerequisites.
  reverse_adjacency: BTreeMap<String, Vec<String>>,
  /// Steps with no prerequisites.
  entry_points: Vec<String>,
}

impl Graph {
  /// Build a graph from step names and a step -> prerequisites map.
  /// Dependencies on unknown steps are ignored here; validation reports them.
  pub fn new<'a>(
    steps: impl IntoIterator<Item = &'a String>,
    dependencies: &BTreeMap<String, Vec<String>>,
  ) -> Self {
    let mut adjacency: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut reverse_adjacency: BTreeMap<String, Vec<String>> = BTreeMap::new();

    for step in steps {
      adjacency.entry(step.clone()).or_default();
      reverse_adjacency.entry(step.clone()).or_default();
    }

    for (step, prerequisites) in dependencies {
      if !adjacency.contains_key(step) {
        continue;
      }
      for prerequisite in prerequisites {
        if !adjacency.contains_key(prerequisite) {
          continue;
        }
        let upstream = reverse_adjacency.entry(step.clone()).or_default();
        if upstream.contains(prerequisite) {
          continue;
        }
        upstream.push(prerequisite.clone());
        adjacency
          .entry(prerequisite.clone())
          .or_default()
          .push(step.clone());
      }
    }

    let entry_points = reverse_adjacency
      .iter()
      .filter(|(_, upstream)| upstream.is_empty())
      .map(|(id, _)| id.clone())
      .collect();

    Self {
      adjacency,
      reverse_adjacency,
      entry_points,
    }
  }

  pub fn entry_points(&self) -> &[String] {
    &self.entry_points
  }

  /// Steps that depend on `step`.
  pub fn downstream(&self, step: &str) -> &[String] {
    self
      .adjacency
      .get(step)
      .map(|v| v.as_slice())
      .unwrap_or(&[])
  }

  /// Prerequisites of `step`.
  pub fn upstream(&self, step: &str) -> &[String] {
    self
      .reverse_adjacency
      .get(step)
      .map(|v| v.as_slice())
      .unwrap_or(&[])
  }

  /// Steps whose prerequisites are all in `completed` and that are neither
  /// completed nor in `started`.
  pub fn ready<'a>(
    &'a self,
    completed: &BTreeSet<String>,
    started: &BTreeSet<String>,
  ) -> Vec<&'a str> {
    self
      .reverse_adjacency
      .iter()
      .filter(|(id, _)| !completed.contains(*id) && !started.contains(*id))
      .filter(|(_, upstream)| upstream.iter().all(|up| completed.contains(up)))
      .map(|(id, _)| id.as_str())
      .collect()
  }

  /// Returns one dependency cycle, if any, as `a -> b -> ... -> a` in
  /// prerequisite order.
  pub fn find_cycle(&self) -> Option<Vec<String>> {
    // DFS with coloring: 0 = unvisited, 1 = on the stack, 2 = done
    let mut color: BTreeMap<&str, u8> = self.adjacency.keys().map(|id| (id.as_str(), 0u8)).collect();
    let mut stack: Vec<&str> = Vec::new();

    fn dfs<'a>(
      node: &'a str,
      adjacency: &'a BTreeMap<String, Vec<String>>,
      color: &mut BTreeMap<&'a str, u8>,
      stack: &mut Vec<&'a str>,
    ) -> Option<Vec<String>> {
      color.insert(node, 1);
      stack.push(node);

      if let Some(neighbors) = adjacency.get(node) {
        for neighbor in neighbors {
          match color.get(neighbor.as_str()) {
            Some(1) => {
              let start = stack.iter().position(|s| *s == neighbor.as_str()).unwrap_or(0);
              let mut cycle: Vec<String> = stack[start..].iter().map(|s| s.to_string()).collect();
              cycle.push(neighbor.clone());
              return Some(cycle);
            }
            Some(0) => {
              if let Some(cycle) = dfs(neighbor, adjacency, color, stack) {
                return Some(cycle);
              }
            }
            _ => {}
          }
        }
      }

      stack.pop();
      color.insert(node, 2);
      None
    }

    for id in self.adjacency.keys() {
      if color.get(id.as_str()) == Some(&0) {
        if let Some(cycle) = dfs(id, &self.adjacency, &mut color, &mut stack) {
          return Some(cycle);
        }
      }
    }
    None
  }

  /// A topological order of all steps, or `None` when the graph has a cycle.
  pub fn topological_order(&self) -> Option<Vec<String>> {
    let mut in_degree: BTreeMap<&str, usize> = self
      .reverse_adjacency
      .iter()
      .map(|(id, upstream)| (id.as_str(), upstream.len()))
      .collect();
    let mut queue: VecDeque<&str> = self.entry_points.iter().map(|s| s.as_str()).collect();
    let mut order = Vec::with_capacity(in_degree.len());

    while let Some(id) = queue.pop_front() {
      order.push(id.to_string());
      for next in self.downstream(id) {
        if let Some(degree) = in_degree.get_mut(next.as_str()) {
          *degree -= 1;
          if *degree == 0 {
            queue.push_back(next.as_str());
          }
        }
      }
    }

    (order.len() == in_degree.len()).then_some(order)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn graph(steps: &[&str], deps: &[(&str, &[&str])]) -> Graph {
    let steps: Vec<String> = steps.iter().map(|s| s.to_string()).collect();
    let deps: BTreeMap<String, Vec<String>> = deps
      .iter()
      .map(|(s, d)| (s.to_string(), d.iter().map(|x| x.to_string()).collect()))
      .collect();
    Graph::new(&steps, &deps)
  }

  #[test]
  fn test_entry_points_and_ready() {
    let g = graph(&["a", "b", "c"], &[("c", &["a", "b"])]);
    assert_eq!(g.entry_points(), &["a".to_string(), "b".to_string()]);

    let mut completed = BTreeSet::new();
    let started = BTreeSet::new();
    assert_eq!(g.ready(&completed, &started), vec!["a", "b"]);

    completed.insert("a".to_string());
    assert_eq!(g.ready(&completed, &started), vec!["b"]);

    completed.insert("b".to_string());
    assert_eq!(g.ready(&completed, &started), vec!["c"]);
  }

  #[test]
  fn test_find_cycle() {
    let g = graph(&["a", "b", "c"], &[("b", &["a"]), ("c", &["b"]), ("a", &["c"])]);
    let cycle = g.find_cycle().unwrap();
    assert_eq!(cycle.first(), cycle.last());
    assert_eq!(cycle.len(), 4);
    assert!(g.topological_order().is_none());
  }

  #[test]
  fn test_self_dependency_is_a_cycle() {
    let g = graph(&["a"], &[("a", &["a"])]);
    assert_eq!(g.find_cycle().unwrap(), vec!["a".to_string(), "a".to_string()]);
  }

  #[test]
  fn test_topological_order() {
    let g = graph(&["a", "b", "c", "d"], &[("b", &["a"]), ("c", &["a"]), ("d", &["b", "c"])]);
    assert!(g.find_cycle().is_none());
    let order = g.topological_order().unwrap();
    let pos = |s: &str| order.iter().position(|x| x == s).unwrap();
    assert!(pos("a") < pos("b"));
    assert!(pos("a") < pos("c"));
    assert!(pos("b") < pos("d"));
    assert!(pos("c") < pos("d"));
  }
}
