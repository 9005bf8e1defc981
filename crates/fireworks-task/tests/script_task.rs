use fireworks_task::{FireTask, ScriptTask, TaskContext, TaskError};
use fireworks_workflow::{Action, Spec};
use serde_json::{Value, json};

fn spec(value: Value) -> Spec {
  value.as_object().cloned().unwrap()
}

fn ctx(dir: &std::path::Path) -> TaskContext {
  TaskContext {
    fw_id: 7,
    launch_id: 3,
    launch_dir: Some(dir.to_path_buf()),
  }
}

#[tokio::test]
async fn test_store_stdout_and_returncode() {
  let dir = tempfile::tempdir().unwrap();
  let task = ScriptTask::from_params(&spec(json!({
    "script": "echo hello world",
    "store_stdout": true
  })))
  .unwrap();

  let action = task.run_task(&Spec::new(), &ctx(dir.path())).await.unwrap();

  assert_eq!(action.name(), "CONTINUE");
  assert_eq!(action.stored_data()["stdout"], json!("hello world\n"));
  assert_eq!(action.stored_data()["returncode"], json!(0));
}

#[tokio::test]
async fn test_stdin_key_feeds_spec_value() {
  let dir = tempfile::tempdir().unwrap();
  let task = ScriptTask::from_params(&spec(json!({
    "script": "cat",
    "stdin_key": "payload",
    "store_stdout": true
  })))
  .unwrap();

  let action = task
    .run_task(&spec(json!({"payload": "from spec"})), &ctx(dir.path()))
    .await
    .unwrap();
  assert_eq!(action.stored_data()["stdout"], json!("from spec"));

  let err = task
    .run_task(&Spec::new(), &ctx(dir.path()))
    .await
    .unwrap_err();
  assert!(matches!(err, TaskError::MissingSpecKey { .. }));
}

#[tokio::test]
async fn test_output_files_append_in_launch_dir() {
  let dir = tempfile::tempdir().unwrap();
  let task = ScriptTask::from_params(&spec(json!({
    "script": "echo out; echo err >&2",
    "use_shell": true,
    "stdout_file": "job.out",
    "stderr_file": "job.err"
  })))
  .unwrap();

  task.run_task(&Spec::new(), &ctx(dir.path())).await.unwrap();
  task.run_task(&Spec::new(), &ctx(dir.path())).await.unwrap();

  let out = std::fs::read_to_string(dir.path().join("job.out")).unwrap();
  let err = std::fs::read_to_string(dir.path().join("job.err")).unwrap();
  assert_eq!(out, "out\nout\n");
  assert_eq!(err, "err\nerr\n");
}

#[tokio::test]
async fn test_bad_return_code_policies() {
  let dir = tempfile::tempdir().unwrap();

  let plain = ScriptTask::shell("exit 3");
  let action = plain.run_task(&Spec::new(), &ctx(dir.path())).await.unwrap();
  assert!(matches!(action, Action::Continue { .. }));
  assert_eq!(action.stored_data()["returncode"], json!(3));

  let defuse = ScriptTask::from_params(&spec(json!({
    "script": "exit 3",
    "use_shell": true,
    "defuse_bad_rc": true
  })))
  .unwrap();
  let action = defuse.run_task(&Spec::new(), &ctx(dir.path())).await.unwrap();
  assert_eq!(action.name(), "DEFUSE");

  let fizzle = ScriptTask::from_params(&spec(json!({
    "script": "exit 3",
    "use_shell": true,
    "fizzle_bad_rc": true
  })))
  .unwrap();
  let err = fizzle
    .run_task(&Spec::new(), &ctx(dir.path()))
    .await
    .unwrap_err();
  assert!(matches!(err, TaskError::Failed { .. }));
}

#[tokio::test]
async fn test_missing_program_is_a_spawn_error() {
  let dir = tempfile::tempdir().unwrap();
  let task = ScriptTask::from_params(&spec(json!({"script": "definitely-not-a-real-binary-xyz"})))
    .unwrap();
  let err = task
    .run_task(&Spec::new(), &ctx(dir.path()))
    .await
    .unwrap_err();
  assert!(matches!(err, TaskError::Spawn { .. }));
}
