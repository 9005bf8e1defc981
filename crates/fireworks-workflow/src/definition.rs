//! User-facing workflow documents.
//!
//! A document is either a single FireWork or a workflow of FireWorks with
//! parent -> children links. Ids in a document are placeholders (often
//! negative); the launchpad replaces them with store-allocated ids on insert.
//!
//! A `.tar`, `.tar.gz` or `.tgz` archive holds either one workflow document,
//! or one FireWork document per member plus an optional `links.{json,yaml}`
//! member mapping parent ids to child ids.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::Read;
use std::path::Path;

use flate2::read::GzDecoder;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::WorkflowError;
use crate::firework::{FireWork, TaskSpec};
use crate::graph::Graph;
use crate::workflow::Workflow;
use crate::{FwId, Spec};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FireWorkDef {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub fw_id: Option<FwId>,
  #[serde(default)]
  pub name: String,
  #[serde(default)]
  pub tasks: Vec<TaskSpec>,
  #[serde(default)]
  pub spec: Spec,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkflowDef {
  #[serde(default)]
  pub name: String,
  pub fireworks: Vec<FireWorkDef>,
  #[serde(default)]
  pub links: BTreeMap<FwId, Vec<FwId>>,
}

impl FireWorkDef {
  pub fn new(name: impl Into<String>, tasks: Vec<TaskSpec>, spec: Spec) -> Self {
    Self {
      fw_id: None,
      name: name.into(),
      tasks,
      spec,
    }
  }

  /// Wrap a lone FireWork in a one-node workflow named after it.
  pub fn into_workflow(self) -> WorkflowDef {
    WorkflowDef {
      name: self.name.clone(),
      fireworks: vec![self],
      links: BTreeMap::new(),
    }
  }
}

impl From<&FireWork> for FireWorkDef {
  fn from(fw: &FireWork) -> Self {
    Self {
      fw_id: Some(fw.fw_id),
      name: fw.name.clone(),
      tasks: fw.tasks.clone(),
      spec: fw.spec.clone(),
    }
  }
}

impl WorkflowDef {
  /// Export a stored workflow, keeping its ids.
  pub fn from_stored(workflow: &Workflow, fireworks: &[FireWork]) -> Self {
    Self {
      name: workflow.name.clone(),
      fireworks: fireworks.iter().map(FireWorkDef::from).collect(),
      links: workflow.links.clone(),
    }
  }

  /// Load a document, dispatching on extension (`.json`, otherwise YAML).
  /// Tar archives go through [`WorkflowDef::from_archive`].
  pub fn from_file(path: &Path) -> Result<Self, WorkflowError> {
    if is_archive(path) {
      return Self::from_archive(path);
    }
    let content = std::fs::read_to_string(path).map_err(|source| WorkflowError::Read {
      path: path.to_path_buf(),
      source,
    })?;
    let format = Format::of(path);
    parse_document(path, &content, |c| format.parse(c))
  }

  pub fn from_archive(path: &Path) -> Result<Self, WorkflowError> {
    let file = File::open(path).map_err(|source| WorkflowError::Read {
      path: path.to_path_buf(),
      source,
    })?;
    if is_gzipped(path) {
      read_archive(path, tar::Archive::new(GzDecoder::new(file)))
    } else {
      read_archive(path, tar::Archive::new(file))
    }
  }

  pub fn from_json_str(content: &str) -> Result<Self, WorkflowError> {
    parse_document(Path::new("<input>"), content, |c| {
      serde_json::from_str(c).map_err(|e| e.to_string())
    })
  }

  pub fn from_yaml_str(content: &str) -> Result<Self, WorkflowError> {
    parse_document(Path::new("<input>"), content, |c| {
      serde_yaml::from_str(c).map_err(|e| e.to_string())
    })
  }

  /// Give every FireWork without an id a fresh placeholder below all
  /// existing ones, then validate.
  pub fn normalized(mut self) -> Result<Self, WorkflowError> {
    let mut next = self
      .fireworks
      .iter()
      .filter_map(|fw| fw.fw_id)
      .min()
      .unwrap_or(0)
      .min(0)
      - 1;
    for fw in &mut self.fireworks {
      if fw.fw_id.is_none() {
        fw.fw_id = Some(next);
        next -= 1;
      }
    }
    self.validate()?;
    Ok(self)
  }

  pub fn fw_ids(&self) -> Vec<FwId> {
    self.fireworks.iter().filter_map(|fw| fw.fw_id).collect()
  }

  pub fn graph(&self) -> Graph {
    Graph::new(&self.fw_ids(), &self.links)
  }

  /// Non-empty, ids unique, links known, acyclic.
  pub fn validate(&self) -> Result<(), WorkflowError> {
    if self.fireworks.is_empty() {
      return Err(WorkflowError::Empty);
    }
    let mut seen = BTreeSet::new();
    for id in self.fw_ids() {
      if !seen.insert(id) {
        return Err(WorkflowError::DuplicateId(id));
      }
    }
    let ids = self.fw_ids();
    Graph::new(&ids, &self.links).check(&ids, &self.links)
  }
}

#[derive(Debug, Clone, Copy)]
enum Format {
  Json,
  Yaml,
}

impl Format {
  fn of(path: &Path) -> Self {
    Self::member(path).unwrap_or(Format::Yaml)
  }

  /// Only `.json`, `.yaml` and `.yml` archive members are documents.
  fn member(path: &Path) -> Option<Self> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
      "json" => Some(Format::Json),
      "yaml" | "yml" => Some(Format::Yaml),
      _ => None,
    }
  }

  fn parse(self, content: &str) -> Result<serde_json::Value, String> {
    match self {
      Format::Json => serde_json::from_str(content).map_err(|e| e.to_string()),
      Format::Yaml => serde_yaml::from_str(content).map_err(|e| e.to_string()),
    }
  }
}

fn file_name(path: &Path) -> String {
  path
    .file_name()
    .map(|name| name.to_string_lossy().to_ascii_lowercase())
    .unwrap_or_default()
}

fn is_archive(path: &Path) -> bool {
  let name = file_name(path);
  name.contains(".tar") || name.ends_with(".tgz")
}

fn is_gzipped(path: &Path) -> bool {
  let name = file_name(path);
  name.ends_with(".gz") || name.ends_with(".tgz")
}

fn read_archive<R: Read>(
  path: &Path,
  mut archive: tar::Archive<R>,
) -> Result<WorkflowDef, WorkflowError> {
  let io_err = |source| WorkflowError::Read {
    path: path.to_path_buf(),
    source,
  };
  let archive_err = |message: String| WorkflowError::Archive {
    path: path.to_path_buf(),
    message,
  };

  let mut documents = Vec::new();
  let mut links = None;
  for entry in archive.entries().map_err(io_err)? {
    let mut entry = entry.map_err(io_err)?;
    if !entry.header().entry_type().is_file() {
      continue;
    }
    let member = entry.path().map_err(io_err)?.into_owned();
    let hidden = member
      .file_name()
      .is_some_and(|name| name.to_string_lossy().starts_with('.'));
    let Some(format) = Format::member(&member).filter(|_| !hidden) else {
      continue;
    };
    let mut content = String::new();
    entry.read_to_string(&mut content).map_err(io_err)?;

    if member.file_stem().is_some_and(|stem| stem == "links") {
      let value = format
        .parse(&content)
        .map_err(|e| archive_err(format!("{}: {e}", member.display())))?;
      let parsed: BTreeMap<FwId, Vec<FwId>> =
        from_value(&value).map_err(|e| archive_err(format!("{}: {e}", member.display())))?;
      links = Some(parsed);
      continue;
    }
    documents.push((member, format, content));
  }

  if documents.is_empty() {
    return Err(archive_err("no json or yaml documents".to_string()));
  }
  if documents.len() == 1 && links.is_none() {
    let (member, format, content) = documents.remove(0);
    return parse_document(&path.join(member), &content, |c| format.parse(c));
  }

  let mut fireworks = Vec::with_capacity(documents.len());
  for (member, format, content) in documents {
    let fw = format
      .parse(&content)
      .and_then(|value| from_value::<FireWorkDef>(&value))
      .map_err(|e| archive_err(format!("{} is not a firework: {e}", member.display())))?;
    fireworks.push(fw);
  }
  Ok(WorkflowDef {
    name: archive_stem(path),
    fireworks,
    links: links.unwrap_or_default(),
  })
}

fn archive_stem(path: &Path) -> String {
  let name = path
    .file_name()
    .map(|n| n.to_string_lossy().into_owned())
    .unwrap_or_default();
  let lower = name.to_ascii_lowercase();
  let end = lower
    .find(".tar")
    .or_else(|| lower.find(".tgz"))
    .unwrap_or(name.len());
  name[..end].to_string()
}

/// Try the document as a single FireWork first, then as a workflow.
fn parse_document<F>(path: &Path, content: &str, parse: F) -> Result<WorkflowDef, WorkflowError>
where
  F: Fn(&str) -> Result<serde_json::Value, String>,
{
  let value = parse(content).map_err(|e| WorkflowError::Malformed {
    path: path.to_path_buf(),
    as_firework: e.clone(),
    as_workflow: e,
  })?;

  let as_firework = match from_value::<FireWorkDef>(&value) {
    Ok(fw) => return Ok(fw.into_workflow()),
    Err(e) => e,
  };
  let as_workflow = match from_value::<WorkflowDef>(&value) {
    Ok(wf) => return Ok(wf),
    Err(e) => e,
  };
  Err(WorkflowError::Malformed {
    path: path.to_path_buf(),
    as_firework,
    as_workflow,
  })
}

fn from_value<T: DeserializeOwned>(value: &serde_json::Value) -> Result<T, String> {
  T::deserialize(value).map_err(|e| e.to_string())
}
