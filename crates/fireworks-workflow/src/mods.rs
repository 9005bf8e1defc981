//! Spec mutation operators.
//!
//! A MODIFY action carries a list of [`SpecMod`]s that the engine applies to
//! the spec of each pending child before merging the parent's stored data.
//! Paths are dotted (`"params.kpoints.0"` is not supported; path segments are
//! always object keys). Intermediate objects are created on demand.
//!
//! The wire form is tagged by `op`. The Mongo-style names (`_set`, `_push`,
//! ...) are accepted as aliases so older action documents still load:
//!
//! ```json
//! {"op": "_push", "path": "input_array", "value": 3}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};

use crate::Spec;
use crate::error::WorkflowError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum SpecMod {
  /// Replace (or create) the field.
  #[serde(alias = "_set")]
  Set { path: String, value: Value },

  /// Remove the field if present.
  #[serde(alias = "_unset")]
  Unset { path: String },

  /// Push one value onto a list, creating the list if missing.
  #[serde(alias = "_push")]
  Append { path: String, value: Value },

  /// Push several values onto a list, creating the list if missing.
  #[serde(alias = "_push_all")]
  AppendAll { path: String, values: Vec<Value> },

  /// Remove every element equal to `value` from a list.
  #[serde(alias = "_pull")]
  Remove { path: String, value: Value },

  /// Add `by` to a number, creating it if missing.
  #[serde(alias = "_inc")]
  Increment { path: String, by: Number },
}

impl SpecMod {
  pub fn op_name(&self) -> &'static str {
    match self {
      SpecMod::Set { .. } => "set",
      SpecMod::Unset { .. } => "unset",
      SpecMod::Append { .. } => "append",
      SpecMod::AppendAll { .. } => "append_all",
      SpecMod::Remove { .. } => "remove",
      SpecMod::Increment { .. } => "increment",
    }
  }

  pub fn path(&self) -> &str {
    match self {
      SpecMod::Set { path, .. }
      | SpecMod::Unset { path }
      | SpecMod::Append { path, .. }
      | SpecMod::AppendAll { path, .. }
      | SpecMod::Remove { path, .. }
      | SpecMod::Increment { path, .. } => path,
    }
  }

  /// Apply this operator to `spec` in place.
  pub fn apply(&self, spec: &mut Spec) -> Result<(), WorkflowError> {
    let err = |message: String| WorkflowError::Mod {
      op: self.op_name(),
      path: self.path().to_string(),
      message,
    };

    let (parents, leaf) = split_path(self.path()).ok_or_else(|| err("empty path".to_string()))?;

    if let SpecMod::Unset { .. } = self {
      if let Some(container) = walk(spec, &parents, false).map_err(err)? {
        container.remove(leaf);
      }
      return Ok(());
    }

    let container = walk(spec, &parents, true)
      .map_err(err)?
      .ok_or_else(|| err("missing parent object".to_string()))?;

    match self {
      SpecMod::Set { value, .. } => {
        container.insert(leaf.to_string(), value.clone());
      }
      SpecMod::Append { value, .. } => {
        list_at(container, leaf).map_err(err)?.push(value.clone());
      }
      SpecMod::AppendAll { values, .. } => {
        list_at(container, leaf)
          .map_err(err)?
          .extend(values.iter().cloned());
      }
      SpecMod::Remove { value, .. } => match container.get_mut(leaf) {
        None => {}
        Some(Value::Array(items)) => items.retain(|item| item != value),
        Some(other) => return Err(err(format!("expected a list, found {}", kind(other)))),
      },
      SpecMod::Increment { by, .. } => {
        let next = match container.get(leaf) {
          None => by.clone(),
          Some(Value::Number(current)) => add_numbers(current, by).ok_or_else(|| err("numeric overflow".to_string()))?,
          Some(other) => return Err(err(format!("expected a number, found {}", kind(other)))),
        };
        container.insert(leaf.to_string(), Value::Number(next));
      }
      SpecMod::Unset { .. } => unreachable!("handled above"),
    }
    Ok(())
  }
}

/// Apply operators in order. Stops at the first failure, leaving `spec`
/// partially modified; callers apply to a scratch copy.
pub fn apply_mods(spec: &mut Spec, mods: &[SpecMod]) -> Result<(), WorkflowError> {
  mods.iter().try_for_each(|m| m.apply(spec))
}

/// Shallow merge: every top-level key of `data` overwrites the one in `target`.
pub fn merge_into(target: &mut Spec, data: &Spec) {
  for (key, value) in data {
    target.insert(key.clone(), value.clone());
  }
}

/// Look up a dotted path.
pub fn get_path<'a>(spec: &'a Spec, path: &str) -> Option<&'a Value> {
  let mut segments = path.split('.');
  let mut current = spec.get(segments.next()?)?;
  for segment in segments {
    current = current.as_object()?.get(segment)?;
  }
  Some(current)
}

fn split_path(path: &str) -> Option<(Vec<&str>, &str)> {
  if path.is_empty() || path.split('.').any(str::is_empty) {
    return None;
  }
  let mut segments: Vec<&str> = path.split('.').collect();
  let leaf = segments.pop()?;
  Some((segments, leaf))
}

/// Descend through `parents`, optionally creating missing objects.
fn walk<'a>(
  spec: &'a mut Spec,
  parents: &[&str],
  create: bool,
) -> Result<Option<&'a mut Spec>, String> {
  let mut current = spec;
  for segment in parents {
    if !current.contains_key(*segment) {
      if !create {
        return Ok(None);
      }
      current.insert(segment.to_string(), Value::Object(Spec::new()));
    }
    current = match current.get_mut(*segment) {
      Some(Value::Object(map)) => map,
      Some(other) => return Err(format!("'{}' is {}, not an object", segment, kind(other))),
      None => return Ok(None),
    };
  }
  Ok(Some(current))
}

fn list_at<'a>(container: &'a mut Spec, leaf: &str) -> Result<&'a mut Vec<Value>, String> {
  let slot = container
    .entry(leaf.to_string())
    .or_insert_with(|| Value::Array(Vec::new()));
  match slot {
    Value::Array(items) => Ok(items),
    other => Err(format!("expected a list, found {}", kind(other))),
  }
}

fn add_numbers(a: &Number, b: &Number) -> Option<Number> {
  match (a.as_i64(), b.as_i64()) {
    (Some(x), Some(y)) => x.checked_add(y).map(Number::from),
    _ => Number::from_f64(a.as_f64()? + b.as_f64()?),
  }
}

fn kind(value: &Value) -> &'static str {
  match value {
    Value::Null => "null",
    Value::Bool(_) => "a boolean",
    Value::Number(_) => "a number",
    Value::String(_) => "a string",
    Value::Array(_) => "a list",
    Value::Object(_) => "an object",
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn spec(value: Value) -> Spec {
    value.as_object().cloned().unwrap()
  }

  #[test]
  fn test_append_preserves_other_fields() {
    let mut s = spec(json!({"input_array": [1, 2], "label": "sum"}));
    SpecMod::Append {
      path: "input_array".to_string(),
      value: json!(3),
    }
    .apply(&mut s)
    .unwrap();

    assert_eq!(Value::Object(s), json!({"input_array": [1, 2, 3], "label": "sum"}));
  }

  #[test]
  fn test_set_creates_intermediate_objects() {
    let mut s = Spec::new();
    SpecMod::Set {
      path: "params.encut".to_string(),
      value: json!(520),
    }
    .apply(&mut s)
    .unwrap();
    assert_eq!(get_path(&s, "params.encut"), Some(&json!(520)));
  }

  #[test]
  fn test_unset_missing_is_noop() {
    let mut s = spec(json!({"a": 1}));
    SpecMod::Unset {
      path: "b.c".to_string(),
    }
    .apply(&mut s)
    .unwrap();
    SpecMod::Unset {
      path: "a".to_string(),
    }
    .apply(&mut s)
    .unwrap();
    assert!(s.is_empty());
  }

  #[test]
  fn test_remove_all_matching() {
    let mut s = spec(json!({"tags": ["a", "b", "a"]}));
    SpecMod::Remove {
      path: "tags".to_string(),
      value: json!("a"),
    }
    .apply(&mut s)
    .unwrap();
    assert_eq!(s["tags"], json!(["b"]));
  }

  #[test]
  fn test_increment() {
    let mut s = spec(json!({"count": 2, "ratio": 0.5}));
    apply_mods(
      &mut s,
      &[
        SpecMod::Increment {
          path: "count".to_string(),
          by: Number::from(3),
        },
        SpecMod::Increment {
          path: "ratio".to_string(),
          by: Number::from_f64(0.25).unwrap(),
        },
        SpecMod::Increment {
          path: "fresh".to_string(),
          by: Number::from(1),
        },
      ],
    )
    .unwrap();
    assert_eq!(s["count"], json!(5));
    assert_eq!(s["ratio"], json!(0.75));
    assert_eq!(s["fresh"], json!(1));
  }

  #[test]
  fn test_type_mismatch_is_an_error() {
    let mut s = spec(json!({"name": "x"}));
    let err = SpecMod::Append {
      path: "name".to_string(),
      value: json!(1),
    }
    .apply(&mut s)
    .unwrap_err();
    assert!(err.to_string().contains("expected a list"));

    let err = SpecMod::Set {
      path: "name.first".to_string(),
      value: json!(1),
    }
    .apply(&mut s)
    .unwrap_err();
    assert!(matches!(err, WorkflowError::Mod { op: "set", .. }));
  }

  #[test]
  fn test_legacy_aliases() {
    let m: SpecMod =
      serde_json::from_value(json!({"op": "_push", "path": "input_array", "value": 3})).unwrap();
    assert_eq!(
      m,
      SpecMod::Append {
        path: "input_array".to_string(),
        value: json!(3)
      }
    );

    let m: SpecMod = serde_json::from_value(json!({"op": "increment", "path": "n", "by": 2})).unwrap();
    assert_eq!(m.op_name(), "increment");
  }

  #[test]
  fn test_merge_into_overwrites_top_level() {
    let mut target = spec(json!({"x": 0, "keep": true}));
    merge_into(&mut target, &spec(json!({"x": 1, "y": 2})));
    assert_eq!(Value::Object(target), json!({"x": 1, "y": 2, "keep": true}));
  }
}
