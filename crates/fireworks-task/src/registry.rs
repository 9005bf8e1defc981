use std::collections::HashMap;

use fireworks_config::FwConfig;
use fireworks_workflow::{Spec, TaskSpec};

use crate::error::TaskError;
use crate::script;
use crate::task::FireTask;
use crate::tutorial;

/// Builds a task from its parameters.
pub type TaskConstructor = fn(&Spec) -> Result<Box<dyn FireTask>, TaskError>;

/// A named group of task types that `USER_PACKAGES` can enable.
#[derive(Debug)]
pub struct TaskSource {
  pub name: &'static str,
  pub tasks: &'static [(&'static str, TaskConstructor)],
}

pub const BUILTIN_SOURCES: &[TaskSource] = &[
  TaskSource {
    name: "fireworks.user_objects",
    tasks: &[(script::SCRIPT_TASK, script::construct as TaskConstructor)],
  },
  TaskSource {
    name: "fw_tutorials",
    tasks: &[
      (
        tutorial::ADDITION_TASK,
        tutorial::construct_addition as TaskConstructor,
      ),
      (
        tutorial::ADD_MODIFY_TASK,
        tutorial::construct_add_modify as TaskConstructor,
      ),
    ],
  },
];

/// Maps `_fw_name` tags to constructors.
#[derive(Debug, Default)]
pub struct TaskRegistry {
  constructors: HashMap<String, TaskConstructor>,
  /// Deprecated tag -> current tag, consulted before lookup.
  name_updates: HashMap<String, String>,
}

impl TaskRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Registry with the sources enabled by `USER_PACKAGES` and the
  /// configured name updates.
  pub fn from_config(config: &FwConfig) -> Result<Self, TaskError> {
    let mut registry = Self::new();
    for package in &config.user_packages {
      let source = BUILTIN_SOURCES
        .iter()
        .find(|s| s.name == package)
        .ok_or_else(|| TaskError::UnknownSource {
          name: package.clone(),
        })?;
      registry.add_source(source);
    }
    for (old, new) in &config.fw_name_updates {
      registry.rename(old.as_str(), new.as_str());
    }
    Ok(registry)
  }

  pub fn add_source(&mut self, source: &TaskSource) {
    for (name, constructor) in source.tasks {
      self.register(*name, *constructor);
    }
  }

  pub fn register(&mut self, name: impl Into<String>, constructor: TaskConstructor) {
    self.constructors.insert(name.into(), constructor);
  }

  /// Resolve `old` as `new` from now on.
  pub fn rename(&mut self, old: impl Into<String>, new: impl Into<String>) {
    self.name_updates.insert(old.into(), new.into());
  }

  pub fn contains(&self, name: &str) -> bool {
    self.constructors.contains_key(self.canonical(name))
  }

  /// Registered tags, sorted.
  pub fn names(&self) -> Vec<&str> {
    let mut names: Vec<&str> = self.constructors.keys().map(String::as_str).collect();
    names.sort_unstable();
    names
  }

  /// Build the task described by `spec`.
  pub fn resolve(&self, spec: &TaskSpec) -> Result<Box<dyn FireTask>, TaskError> {
    let name = self.canonical(&spec.name);
    let constructor = self
      .constructors
      .get(name)
      .ok_or_else(|| TaskError::UnknownTask {
        name: spec.name.clone(),
      })?;
    constructor(&spec.params)
  }

  fn canonical<'a>(&'a self, name: &'a str) -> &'a str {
    self
      .name_updates
      .get(name)
      .map(String::as_str)
      .unwrap_or(name)
  }
}
