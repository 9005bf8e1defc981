use chrono::{DateTime, Utc};
use fireworks_workflow::{FireWork, FwId, FwState, Launch, LaunchId, LaunchState, Workflow, WorkflowId};

/// Precondition on a workflow write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowGuard {
  Unconditional,
  /// The workflow must not exist yet.
  Insert,
  /// The stored revision must equal this one.
  Revision(u64),
}

/// Precondition on a firework write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FireWorkGuard {
  Unconditional,
  /// The firework must not exist yet.
  Insert,
  /// The stored state must equal this one.
  State(FwState),
  /// The stored state and revision must both match.
  Exact { state: FwState, revision: u64 },
}

/// Precondition on a launch write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchGuard {
  Unconditional,
  /// The launch must not exist yet.
  Insert,
  /// The stored state must equal this one.
  State(LaunchState),
  /// The stored state and last heartbeat must both match.
  Heartbeat {
    state: LaunchState,
    last_heartbeat: DateTime<Utc>,
  },
}

#[derive(Debug, Clone)]
pub struct WorkflowWrite {
  pub workflow: Workflow,
  pub guard: WorkflowGuard,
}

#[derive(Debug, Clone)]
pub struct FireWorkWrite {
  pub firework: FireWork,
  pub guard: FireWorkGuard,
}

#[derive(Debug, Clone)]
pub struct LaunchWrite {
  pub launch: Launch,
  pub guard: LaunchGuard,
}

/// A batch of guarded writes.
///
/// Guards are evaluated against the state before the commit; a record should
/// appear at most once per batch. Workflows are checked first, then
/// fireworks, then launches, and the first failing guard is reported.
#[derive(Debug, Clone, Default)]
pub struct Commit {
  pub workflows: Vec<WorkflowWrite>,
  pub fireworks: Vec<FireWorkWrite>,
  pub launches: Vec<LaunchWrite>,
}

impl Commit {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn workflow(mut self, workflow: Workflow, guard: WorkflowGuard) -> Self {
    self.push_workflow(workflow, guard);
    self
  }

  pub fn firework(mut self, firework: FireWork, guard: FireWorkGuard) -> Self {
    self.push_firework(firework, guard);
    self
  }

  pub fn launch(mut self, launch: Launch, guard: LaunchGuard) -> Self {
    self.push_launch(launch, guard);
    self
  }

  pub fn push_workflow(&mut self, workflow: Workflow, guard: WorkflowGuard) {
    self.workflows.push(WorkflowWrite { workflow, guard });
  }

  pub fn push_firework(&mut self, firework: FireWork, guard: FireWorkGuard) {
    self.fireworks.push(FireWorkWrite { firework, guard });
  }

  pub fn push_launch(&mut self, launch: Launch, guard: LaunchGuard) {
    self.launches.push(LaunchWrite { launch, guard });
  }

  pub fn is_empty(&self) -> bool {
    self.workflows.is_empty() && self.fireworks.is_empty() && self.launches.is_empty()
  }

  pub fn len(&self) -> usize {
    self.workflows.len() + self.fireworks.len() + self.launches.len()
  }
}

/// The record whose guard failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Conflict {
  Workflow(WorkflowId),
  FireWork(FwId),
  Launch(LaunchId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum CommitOutcome {
  Applied,
  Conflict(Conflict),
}

impl CommitOutcome {
  pub fn is_applied(self) -> bool {
    matches!(self, CommitOutcome::Applied)
  }
}

impl WorkflowGuard {
  pub(crate) fn admits(self, current: Option<&Workflow>) -> bool {
    match self {
      WorkflowGuard::Unconditional => true,
      WorkflowGuard::Insert => current.is_none(),
      WorkflowGuard::Revision(revision) => current.is_some_and(|w| w.revision == revision),
    }
  }
}

impl FireWorkGuard {
  pub(crate) fn admits(self, current: Option<&FireWork>) -> bool {
    match self {
      FireWorkGuard::Unconditional => true,
      FireWorkGuard::Insert => current.is_none(),
      FireWorkGuard::State(state) => current.is_some_and(|f| f.state == state),
      FireWorkGuard::Exact { state, revision } => {
        current.is_some_and(|f| f.state == state && f.revision == revision)
      }
    }
  }
}

impl LaunchGuard {
  pub(crate) fn admits(self, current: Option<&Launch>) -> bool {
    match self {
      LaunchGuard::Unconditional => true,
      LaunchGuard::Insert => current.is_none(),
      LaunchGuard::State(state) => current.is_some_and(|l| l.state == state),
      LaunchGuard::Heartbeat {
        state,
        last_heartbeat,
      } => current.is_some_and(|l| l.state == state && l.last_heartbeat == last_heartbeat),
    }
  }
}
