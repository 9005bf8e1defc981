use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::WorkflowError;
use crate::graph::Graph;
use crate::{FwId, WorkflowId};

/// A persisted DAG of FireWork ids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
  pub workflow_id: WorkflowId,
  pub name: String,
  pub fw_ids: Vec<FwId>,
  /// Parent -> children.
  pub links: BTreeMap<FwId, Vec<FwId>>,
  #[serde(default)]
  pub revision: u64,
  pub created_on: DateTime<Utc>,
  pub updated_on: DateTime<Utc>,
}

impl Workflow {
  /// Build the graph structure for traversal.
  pub fn graph(&self) -> Graph {
    Graph::new(&self.fw_ids, &self.links)
  }

  pub fn children(&self, fw_id: FwId) -> &[FwId] {
    self
      .links
      .get(&fw_id)
      .map(|v| v.as_slice())
      .unwrap_or(&[])
  }

  pub fn contains(&self, fw_id: FwId) -> bool {
    self.fw_ids.contains(&fw_id)
  }

  /// Every link endpoint exists and the graph is acyclic.
  pub fn validate(&self) -> Result<(), WorkflowError> {
    if self.fw_ids.is_empty() {
      return Err(WorkflowError::Empty);
    }
    self.graph().check(&self.fw_ids, &self.links)
  }

  /// Insert `new_ids` between `fw_id` and its current children.
  ///
  /// `new_links` are the links among the new FireWorks. The new roots become
  /// children of `fw_id`; the new leaves inherit its former children.
  pub fn splice_after(
    &mut self,
    fw_id: FwId,
    new_ids: &[FwId],
    new_links: &BTreeMap<FwId, Vec<FwId>>,
  ) -> Result<(), WorkflowError> {
    if !self.contains(fw_id) {
      return Err(WorkflowError::FireWorkNotFound(fw_id));
    }
    let sub = Graph::new(new_ids, new_links);
    sub.check(new_ids, new_links)?;

    let old_children = self.links.remove(&fw_id).unwrap_or_default();
    self.fw_ids.extend_from_slice(new_ids);
    for (from, children) in new_links {
      self.links.entry(*from).or_default().extend(children.iter().copied());
    }
    for leaf in sub.leaves() {
      if !old_children.is_empty() {
        self
          .links
          .entry(leaf)
          .or_default()
          .extend(old_children.iter().copied());
      }
    }
    self.links.insert(fw_id, sub.roots().to_vec());
    self.validate()
  }
}
