use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::FwId;
use crate::error::WorkflowError;

/// Graph structure for traversal and readiness checks.
///
/// Built from the persisted parent -> children links; the reverse direction
/// is derived here so `parents()` is a map lookup.
#[derive(Debug, Clone)]
pub struct Graph {
  /// Adjacency list: fw_id -> children.
  adjacency: BTreeMap<FwId, Vec<FwId>>,
  /// Reverse adjacency: fw_id -> parents.
  reverse_adjacency: BTreeMap<FwId, Vec<FwId>>,
  /// FireWorks with no parents.
  roots: Vec<FwId>,
}

impl Graph {
  /// Build a graph from the FireWork ids and parent -> children links.
  /// Link endpoints not in `fw_ids` are kept; use [`Graph::check`] to reject them.
  pub fn new(fw_ids: &[FwId], links: &BTreeMap<FwId, Vec<FwId>>) -> Self {
    let mut adjacency: BTreeMap<FwId, Vec<FwId>> = BTreeMap::new();
    let mut reverse_adjacency: BTreeMap<FwId, Vec<FwId>> = BTreeMap::new();

    for id in fw_ids {
      adjacency.entry(*id).or_default();
      reverse_adjacency.entry(*id).or_default();
    }

    for (from, children) in links {
      for to in children {
        let out = adjacency.entry(*from).or_default();
        if !out.contains(to) {
          out.push(*to);
        }
        let incoming = reverse_adjacency.entry(*to).or_default();
        if !incoming.contains(from) {
          incoming.push(*from);
        }
      }
    }

    let roots = fw_ids
      .iter()
      .filter(|id| reverse_adjacency.get(*id).is_none_or(|v| v.is_empty()))
      .copied()
      .collect();

    Self {
      adjacency,
      reverse_adjacency,
      roots,
    }
  }

  pub fn roots(&self) -> &[FwId] {
    &self.roots
  }

  pub fn children(&self, fw_id: FwId) -> &[FwId] {
    self
      .adjacency
      .get(&fw_id)
      .map(|v| v.as_slice())
      .unwrap_or(&[])
  }

  pub fn parents(&self, fw_id: FwId) -> &[FwId] {
    self
      .reverse_adjacency
      .get(&fw_id)
      .map(|v| v.as_slice())
      .unwrap_or(&[])
  }

  /// FireWorks with no children.
  pub fn leaves(&self) -> Vec<FwId> {
    self
      .adjacency
      .iter()
      .filter(|(_, children)| children.is_empty())
      .map(|(id, _)| *id)
      .collect()
  }

  /// Every FireWork reachable from `fw_id`, excluding itself, in BFS order.
  pub fn descendants(&self, fw_id: FwId) -> Vec<FwId> {
    let mut seen = BTreeSet::new();
    let mut order = Vec::new();
    let mut queue: VecDeque<FwId> = self.children(fw_id).iter().copied().collect();
    while let Some(id) = queue.pop_front() {
      if id == fw_id || !seen.insert(id) {
        continue;
      }
      order.push(id);
      queue.extend(self.children(id).iter().copied());
    }
    order
  }

  /// Kahn's algorithm. Fails with the smallest id left on a cycle.
  pub fn topological_order(&self) -> Result<Vec<FwId>, WorkflowError> {
    let mut in_degree: BTreeMap<FwId, usize> = self
      .reverse_adjacency
      .iter()
      .map(|(id, parents)| (*id, parents.len()))
      .collect();
    for id in self.adjacency.keys() {
      in_degree.entry(*id).or_insert(0);
    }

    let mut ready: VecDeque<FwId> = in_degree
      .iter()
      .filter(|(_, d)| **d == 0)
      .map(|(id, _)| *id)
      .collect();
    let mut order = Vec::with_capacity(in_degree.len());

    while let Some(id) = ready.pop_front() {
      order.push(id);
      for child in self.children(id) {
        if let Some(d) = in_degree.get_mut(child) {
          *d -= 1;
          if *d == 0 {
            ready.push_back(*child);
          }
        }
      }
    }

    if order.len() < in_degree.len() {
      let stuck = in_degree
        .iter()
        .find(|(id, d)| **d > 0 && !order.contains(id))
        .map(|(id, _)| *id)
        .unwrap_or_default();
      return Err(WorkflowError::Cycle(stuck));
    }
    Ok(order)
  }

  /// Reject links to unknown ids and cycles.
  pub fn check(&self, fw_ids: &[FwId], links: &BTreeMap<FwId, Vec<FwId>>) -> Result<(), WorkflowError> {
    let known: BTreeSet<FwId> = fw_ids.iter().copied().collect();
    for (from, children) in links {
      for to in children {
        if !known.contains(from) || !known.contains(to) {
          return Err(WorkflowError::InvalidLink {
            from: *from,
            to: *to,
          });
        }
      }
    }
    self.topological_order().map(|_| ())
  }
}
