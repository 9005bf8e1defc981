use async_trait::async_trait;
use fireworks_workflow::{Action, Spec, SpecMod};
use serde_json::{Number, Value, json};
use tracing::info;

use crate::error::TaskError;
use crate::task::{FireTask, TaskContext};

pub const ADDITION_TASK: &str = "Addition Task";
pub const ADD_MODIFY_TASK: &str = "Add and Modify Task";

const INPUT_KEY: &str = "input_array";

/// Sums `input_array` from the spec and stores it as `sum`.
#[derive(Debug, Clone, Default)]
pub struct AdditionTask;

/// Like [`AdditionTask`], and also appends the sum to each child's
/// `input_array`.
#[derive(Debug, Clone, Default)]
pub struct AddModifyTask;

pub(crate) fn construct_addition(_params: &Spec) -> Result<Box<dyn FireTask>, TaskError> {
  Ok(Box::new(AdditionTask))
}

pub(crate) fn construct_add_modify(_params: &Spec) -> Result<Box<dyn FireTask>, TaskError> {
  Ok(Box::new(AddModifyTask))
}

#[async_trait]
impl FireTask for AdditionTask {
  fn name(&self) -> &str {
    ADDITION_TASK
  }

  async fn run_task(&self, spec: &Spec, ctx: &TaskContext) -> Result<Action, TaskError> {
    let sum = sum_input(spec)?;
    info!(fw_id = ctx.fw_id, sum = %sum, "addition_computed");

    let mut stored_data = Spec::new();
    stored_data.insert("sum".to_string(), Value::Number(sum));
    Ok(Action::Continue { stored_data })
  }
}

#[async_trait]
impl FireTask for AddModifyTask {
  fn name(&self) -> &str {
    ADD_MODIFY_TASK
  }

  async fn run_task(&self, spec: &Spec, ctx: &TaskContext) -> Result<Action, TaskError> {
    let sum = sum_input(spec)?;
    info!(fw_id = ctx.fw_id, sum = %sum, "addition_computed");

    let mut stored_data = Spec::new();
    stored_data.insert("sum".to_string(), Value::Number(sum.clone()));
    Ok(Action::Modify {
      stored_data,
      mods: vec![SpecMod::Append {
        path: INPUT_KEY.to_string(),
        value: json!(sum),
      }],
    })
  }
}

/// Integer sum when every element is an integer, float otherwise.
fn sum_input(spec: &Spec) -> Result<Number, TaskError> {
  let items = spec
    .get(INPUT_KEY)
    .ok_or_else(|| TaskError::MissingSpecKey {
      key: INPUT_KEY.to_string(),
    })?
    .as_array()
    .ok_or_else(|| bad_input("expected a list"))?;

  let numbers: Vec<&Number> = items
    .iter()
    .map(|v| match v {
      Value::Number(n) => Ok(n),
      _ => Err(bad_input("expected only numbers")),
    })
    .collect::<Result<_, _>>()?;

  if let Some(ints) = numbers.iter().map(|n| n.as_i64()).collect::<Option<Vec<i64>>>() {
    return ints
      .into_iter()
      .try_fold(0i64, i64::checked_add)
      .map(Number::from)
      .ok_or_else(|| bad_input("sum overflows"));
  }
  let total: f64 = numbers.iter().filter_map(|n| n.as_f64()).sum();
  Number::from_f64(total).ok_or_else(|| bad_input("sum is not finite"))
}

fn bad_input(message: &str) -> TaskError {
  TaskError::InvalidSpecKey {
    key: INPUT_KEY.to_string(),
    message: message.to_string(),
  }
}
