//! End-to-end behavior of the launchpad, rockets and sweeps against a real
//! store.

use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fireworks_config::FwConfig;
use fireworks_engine::{
  ClaimOptions, EngineError, LaunchPad, NLaunches, RapidfireOptions, ReservationCanceller, Rocket,
  RocketOutcome, rapidfire,
};
use fireworks_store::{
  Commit, CommitOutcome, FireWorkGuard, FireWorkQuery, IdKind, LaunchGuard, LaunchQuery,
  MemoryStore, SqliteStore, Store,
};
use fireworks_task::{FireTask, TaskContext, TaskError, TaskRegistry};
use fireworks_workflow::{
  Action, FWorker, FireWork, FireWorkDef, FwId, FwState, Launch, LaunchId, LaunchState, Spec,
  TaskSpec, Workflow, WorkflowDef, WorkflowId,
};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

/// Returns the action given in its `action` parameter.
#[derive(Debug)]
struct EmitTask {
  action: Action,
}

#[async_trait]
impl FireTask for EmitTask {
  fn name(&self) -> &str {
    "Emit Task"
  }

  async fn run_task(&self, _spec: &Spec, _ctx: &TaskContext) -> Result<Action, TaskError> {
    Ok(self.action.clone())
  }
}

fn construct_emit(params: &Spec) -> Result<Box<dyn FireTask>, TaskError> {
  let action = match params.get("action") {
    Some(value) => serde_json::from_value(value.clone()).map_err(|e| TaskError::InvalidParams {
      task: "Emit Task".to_string(),
      message: e.to_string(),
    })?,
    None => Action::default(),
  };
  Ok(Box::new(EmitTask { action }))
}

#[derive(Debug)]
struct FailTask;

#[async_trait]
impl FireTask for FailTask {
  fn name(&self) -> &str {
    "Fail Task"
  }

  async fn run_task(&self, _spec: &Spec, _ctx: &TaskContext) -> Result<Action, TaskError> {
    Err(TaskError::Failed {
      message: "boom".to_string(),
    })
  }
}

fn construct_fail(_params: &Spec) -> Result<Box<dyn FireTask>, TaskError> {
  Ok(Box::new(FailTask))
}

#[derive(Debug)]
struct PanicTask;

#[async_trait]
impl FireTask for PanicTask {
  fn name(&self) -> &str {
    "Panic Task"
  }

  async fn run_task(&self, _spec: &Spec, _ctx: &TaskContext) -> Result<Action, TaskError> {
    panic!("task blew up");
  }
}

fn construct_panic(_params: &Spec) -> Result<Box<dyn FireTask>, TaskError> {
  Ok(Box::new(PanicTask))
}

fn registry() -> Arc<TaskRegistry> {
  let mut registry = TaskRegistry::from_config(&FwConfig::default()).unwrap();
  registry.register("Emit Task", construct_emit);
  registry.register("Fail Task", construct_fail);
  registry.register("Panic Task", construct_panic);
  Arc::new(registry)
}

fn spec(value: Value) -> Spec {
  value.as_object().cloned().unwrap()
}

fn emit(action: Value) -> TaskSpec {
  TaskSpec::new("Emit Task", spec(json!({ "action": action })))
}

fn fw(id: FwId, tasks: Vec<TaskSpec>) -> FireWorkDef {
  FireWorkDef {
    fw_id: Some(id),
    ..FireWorkDef::new(format!("fw{id}"), tasks, Spec::new())
  }
}

fn rocket_with(store: Arc<dyn Store>, config: FwConfig) -> Rocket {
  Rocket::new(LaunchPad::new(store, Arc::new(config)), registry())
}

fn rocket() -> Rocket {
  rocket_with(Arc::new(MemoryStore::new()), FwConfig::default())
}

async fn state(rocket: &Rocket, fw_id: FwId) -> FwState {
  rocket.launchpad().get_fw_by_id(fw_id).await.unwrap().state
}

async fn launch(rocket: &Rocket, fw_id: FwId) -> RocketOutcome {
  rocket
    .launch(&FWorker::default(), None, Some(fw_id))
    .await
    .unwrap()
}

#[tokio::test]
async fn test_diamond_propagates_data_and_readiness() {
  let rocket = rocket();
  let def = WorkflowDef {
    name: "diamond".to_string(),
    fireworks: vec![
      fw(1, vec![emit(json!({"action": "CONTINUE", "stored_data": {"x": 1}}))]),
      fw(2, vec![emit(json!({"action": "CONTINUE"}))]),
      fw(3, vec![emit(json!({"action": "CONTINUE"}))]),
      fw(4, vec![emit(json!({"action": "CONTINUE"}))]),
    ],
    links: BTreeMap::from([(1, vec![2, 3]), (2, vec![4]), (3, vec![4])]),
  };
  let ids = rocket.launchpad().add_wf(def).await.unwrap().id_map;
  let (a, b, c, d) = (ids[&1], ids[&2], ids[&3], ids[&4]);

  assert!(matches!(
    launch(&rocket, a).await,
    RocketOutcome::Completed { action: "CONTINUE", .. }
  ));
  for child in [b, c] {
    let fw = rocket.launchpad().get_fw_by_id(child).await.unwrap();
    assert_eq!(fw.state, FwState::Ready);
    assert_eq!(fw.spec["x"], json!(1));
  }
  assert_eq!(state(&rocket, d).await, FwState::Waiting);

  launch(&rocket, b).await;
  assert_eq!(state(&rocket, d).await, FwState::Waiting);
  launch(&rocket, c).await;
  assert_eq!(state(&rocket, d).await, FwState::Ready);

  let output = rocket.launchpad().get_fw_by_id(a).await.unwrap().output;
  assert_eq!(output["x"], json!(1));
}

#[tokio::test]
async fn test_concurrent_claims_have_one_winner() {
  let dir = tempfile::tempdir().unwrap();
  let store: Arc<dyn Store> = Arc::new(SqliteStore::open(&dir.path().join("fw.db")).await.unwrap());
  let launchpad = LaunchPad::new(store, Arc::new(FwConfig::default()));
  let fw_id = launchpad
    .add_wf(fw(1, vec![]).into_workflow())
    .await
    .unwrap()
    .id_map[&1];

  let claims = (0..8).map(|_| {
    let launchpad = launchpad.clone();
    tokio::spawn(async move {
      launchpad
        .claim_next(&FWorker::default(), ClaimOptions::default())
        .await
        .unwrap()
    })
  });
  let winners: Vec<_> = futures::future::join_all(claims)
    .await
    .into_iter()
    .filter_map(|r| r.unwrap())
    .collect();

  assert_eq!(winners.len(), 1);
  assert_eq!(winners[0].firework.fw_id, fw_id);
  let fw = launchpad.get_fw_by_id(fw_id).await.unwrap();
  assert_eq!(fw.state, FwState::Reserved);
  assert_eq!(fw.launch_ids, vec![winners[0].launch.launch_id]);
}

#[tokio::test]
async fn test_add_modify_task_appends_to_child() {
  let rocket = rocket();
  let def = WorkflowDef {
    name: "sum".to_string(),
    fireworks: vec![
      FireWorkDef {
        fw_id: Some(1),
        ..FireWorkDef::new(
          "first",
          vec![TaskSpec::new("Add and Modify Task", Spec::new())],
          spec(json!({"input_array": [1, 2]})),
        )
      },
      FireWorkDef {
        fw_id: Some(2),
        ..FireWorkDef::new(
          "second",
          vec![TaskSpec::new("Addition Task", Spec::new())],
          spec(json!({"input_array": [10], "keep": "me"})),
        )
      },
    ],
    links: BTreeMap::from([(1, vec![2])]),
  };
  let ids = rocket.launchpad().add_wf(def).await.unwrap().id_map;

  launch(&rocket, ids[&1]).await;
  let child = rocket.launchpad().get_fw_by_id(ids[&2]).await.unwrap();
  assert_eq!(child.spec["input_array"], json!([10, 3]));
  assert_eq!(child.spec["keep"], json!("me"));
  assert_eq!(child.state, FwState::Ready);

  launch(&rocket, ids[&2]).await;
  let child = rocket.launchpad().get_fw_by_id(ids[&2]).await.unwrap();
  assert_eq!(child.output["sum"], json!(13));
}

#[tokio::test]
async fn test_failing_task_fizzles_launch() {
  let rocket = rocket();
  let def = WorkflowDef {
    name: "fail".to_string(),
    fireworks: vec![
      fw(1, vec![TaskSpec::new("Fail Task", Spec::new())]),
      fw(2, vec![TaskSpec::new("Panic Task", Spec::new())]),
      fw(3, vec![TaskSpec::new("No Such Task", Spec::new())]),
    ],
    links: BTreeMap::new(),
  };
  let ids = rocket.launchpad().add_wf(def).await.unwrap().id_map;

  for id in ids.values() {
    let outcome = launch(&rocket, *id).await;
    let RocketOutcome::Fizzled { launch_id, error, .. } = &outcome else {
      panic!("expected a fizzle, got {outcome:?}");
    };
    assert_eq!(state(&rocket, *id).await, FwState::Fizzled);
    let launch = rocket.launchpad().get_launch(*launch_id).await.unwrap();
    assert_eq!(launch.state, LaunchState::Fizzled);
    assert_eq!(launch.error.as_deref(), Some(error.as_str()));
  }
  let boom = rocket.launchpad().get_fw_by_id(ids[&1]).await.unwrap();
  let error = rocket
    .launchpad()
    .get_launch(boom.launch_ids[0])
    .await
    .unwrap()
    .error
    .unwrap();
  assert!(error.contains("boom"), "{error}");
}

#[tokio::test]
async fn test_stored_data_of_earlier_tasks_is_kept() {
  let rocket = rocket();
  let fw_id = rocket
    .launchpad()
    .add_wf(
      fw(
        1,
        vec![
          emit(json!({"action": "CONTINUE", "stored_data": {"a": 1, "b": 1}})),
          emit(json!({"action": "DEFUSE", "stored_data": {"b": 2}})),
          TaskSpec::new("Fail Task", Spec::new()),
        ],
      )
      .into_workflow(),
    )
    .await
    .unwrap()
    .id_map[&1];

  assert!(matches!(
    launch(&rocket, fw_id).await,
    RocketOutcome::Completed { action: "DEFUSE", .. }
  ));
  let fw = rocket.launchpad().get_fw_by_id(fw_id).await.unwrap();
  assert_eq!(fw.state, FwState::Defused);
  assert_eq!(Value::Object(fw.output), json!({"a": 1, "b": 2}));
}

#[tokio::test]
async fn test_detour_is_spliced_before_children() {
  let rocket = rocket();
  let detour = json!({
    "name": "detour",
    "fireworks": [{"fw_id": -1, "name": "fix", "tasks": [], "spec": {}}],
    "links": {}
  });
  let def = WorkflowDef {
    name: "main".to_string(),
    fireworks: vec![
      fw(
        1,
        vec![emit(json!({"action": "DETOUR", "stored_data": {"y": 2}, "detour": detour}))],
      ),
      fw(2, vec![]),
    ],
    links: BTreeMap::from([(1, vec![2])]),
  };
  let ids = rocket.launchpad().add_wf(def).await.unwrap().id_map;
  launch(&rocket, ids[&1]).await;

  let wf = rocket.launchpad().get_wf_by_fw_id(ids[&1]).await.unwrap();
  assert_eq!(wf.fw_ids.len(), 3);
  let inserted = wf.children(ids[&1]).to_vec();
  assert_eq!(inserted.len(), 1);
  assert_eq!(wf.children(inserted[0]), &[ids[&2]]);

  let fix = rocket.launchpad().get_fw_by_id(inserted[0]).await.unwrap();
  assert_eq!(fix.state, FwState::Ready);
  assert_eq!(fix.spec["y"], json!(2));
  assert_eq!(state(&rocket, ids[&2]).await, FwState::Waiting);

  launch(&rocket, inserted[0]).await;
  assert_eq!(state(&rocket, ids[&2]).await, FwState::Ready);
}

#[tokio::test]
async fn test_abort_defuses_rest_of_workflow() {
  let rocket = rocket();
  let def = WorkflowDef {
    name: "abort".to_string(),
    fireworks: vec![
      fw(1, vec![emit(json!({"action": "ABORT"}))]),
      fw(2, vec![]),
      fw(3, vec![]),
      fw(4, vec![]),
    ],
    links: BTreeMap::from([(1, vec![2]), (2, vec![3])]),
  };
  let ids = rocket.launchpad().add_wf(def).await.unwrap().id_map;
  launch(&rocket, ids[&1]).await;

  assert_eq!(state(&rocket, ids[&1]).await, FwState::Completed);
  for id in [2, 3, 4] {
    assert_eq!(state(&rocket, ids[&id]).await, FwState::Defused);
  }
}

#[tokio::test]
async fn test_defuse_cascade_policy() {
  for cascade in [false, true] {
    let config = FwConfig {
      defuse_cascade: cascade,
      ..FwConfig::default()
    };
    let rocket = rocket_with(Arc::new(MemoryStore::new()), config);
    let def = WorkflowDef {
      name: "chain".to_string(),
      fireworks: vec![fw(1, vec![emit(json!({"action": "DEFUSE"}))]), fw(2, vec![]), fw(3, vec![])],
      links: BTreeMap::from([(1, vec![2]), (2, vec![3])]),
    };
    let ids = rocket.launchpad().add_wf(def).await.unwrap().id_map;
    launch(&rocket, ids[&1]).await;

    assert_eq!(state(&rocket, ids[&1]).await, FwState::Defused);
    let expected = if cascade {
      FwState::Defused
    } else {
      FwState::Waiting
    };
    assert_eq!(state(&rocket, ids[&2]).await, expected, "cascade={cascade}");
    assert_eq!(state(&rocket, ids[&3]).await, expected, "cascade={cascade}");
  }
}

#[tokio::test]
async fn test_detect_fizzled_boundary_and_idempotence() {
  let rocket = rocket();
  let launchpad = rocket.launchpad();
  let def = WorkflowDef {
    name: "stale".to_string(),
    fireworks: vec![fw(1, vec![]), fw(2, vec![])],
    links: BTreeMap::new(),
  };
  let ids = launchpad.add_wf(def).await.unwrap().id_map;

  let expiration = Duration::from_secs(100);
  let now = Utc::now();
  let mut launch_ids = Vec::new();
  for (id, age) in [(ids[&1], 101), (ids[&2], 99)] {
    let claim = launchpad.claim_fw(id, &FWorker::default(), None).await.unwrap().unwrap();
    let mut fw = claim.firework;
    let mut launch = claim.launch;
    fw.state = FwState::Running;
    launch.state = LaunchState::Running;
    launch.last_heartbeat = now - chrono::Duration::seconds(age);
    launchpad.store().upsert_firework(&fw).await.unwrap();
    launchpad.store().upsert_launch(&launch).await.unwrap();
    launch_ids.push(launch.launch_id);
  }

  let report = launchpad.detect_fizzled_at(now, expiration, false).await.unwrap();
  assert_eq!(report.stale.len(), 1);
  assert_eq!(report.stale[0].launch_id, launch_ids[0]);
  assert!(report.fixed.is_empty());
  assert_eq!(state(&rocket, ids[&1]).await, FwState::Running);

  let report = launchpad.detect_fizzled_at(now, expiration, true).await.unwrap();
  assert_eq!(report.fixed, vec![launch_ids[0]]);
  assert_eq!(state(&rocket, ids[&1]).await, FwState::Fizzled);
  assert_eq!(state(&rocket, ids[&2]).await, FwState::Running);

  let again = launchpad.detect_fizzled_at(now, expiration, true).await.unwrap();
  assert!(again.stale.is_empty());
  assert!(again.fixed.is_empty());
}

#[derive(Default)]
struct RecordingCanceller {
  cancelled: Mutex<Vec<String>>,
}

#[async_trait]
impl ReservationCanceller for RecordingCanceller {
  async fn cancel(&self, reservation_id: &str) -> Result<(), String> {
    self.cancelled.lock().unwrap().push(reservation_id.to_string());
    Ok(())
  }
}

#[tokio::test]
async fn test_detect_unreserved_cancels_job_and_frees_firework() {
  let rocket = rocket();
  let launchpad = rocket.launchpad();
  let fw_id = launchpad
    .add_wf(fw(1, vec![]).into_workflow())
    .await
    .unwrap()
    .id_map[&1];
  let claim = launchpad
    .claim_next(
      &FWorker::default(),
      ClaimOptions {
        reservation_id: Some("777.queue".to_string()),
        ..ClaimOptions::default()
      },
    )
    .await
    .unwrap()
    .unwrap();

  let expiration = Duration::from_secs(60);
  let later = Utc::now() + chrono::Duration::seconds(61);
  let canceller = RecordingCanceller::default();

  let report = launchpad
    .detect_unreserved_at(later, expiration, true, Some(&canceller))
    .await
    .unwrap();
  assert_eq!(report.fixed, vec![claim.launch.launch_id]);
  assert_eq!(*canceller.cancelled.lock().unwrap(), vec!["777.queue".to_string()]);
  assert_eq!(state(&rocket, fw_id).await, FwState::Ready);

  let again = launchpad
    .detect_unreserved_at(later, expiration, true, Some(&canceller))
    .await
    .unwrap();
  assert!(again.stale.is_empty());
  assert_eq!(canceller.cancelled.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_run_launch_resumes_reservation() {
  let rocket = rocket();
  let launchpad = rocket.launchpad();
  let fw_id = launchpad
    .add_wf(fw(1, vec![emit(json!({"action": "CONTINUE"}))]).into_workflow())
    .await
    .unwrap()
    .id_map[&1];
  let claim = launchpad
    .claim_next(&FWorker::default(), ClaimOptions::default())
    .await
    .unwrap()
    .unwrap();

  let outcome = rocket.run_launch(claim.launch.launch_id).await.unwrap();
  assert!(matches!(outcome, RocketOutcome::Completed { .. }));
  assert_eq!(state(&rocket, fw_id).await, FwState::Completed);

  let again = rocket.run_launch(claim.launch.launch_id).await.unwrap();
  assert!(matches!(again, RocketOutcome::Lost { .. }));
}

#[tokio::test]
async fn test_defused_reservation_is_lost() {
  let rocket = rocket();
  let launchpad = rocket.launchpad();
  let fw_id = launchpad
    .add_wf(fw(1, vec![]).into_workflow())
    .await
    .unwrap()
    .id_map[&1];
  let claim = launchpad.claim_fw(fw_id, &FWorker::default(), None).await.unwrap().unwrap();
  launchpad.defuse_fw(fw_id).await.unwrap();

  let outcome = rocket.run(claim.firework, claim.launch).await.unwrap();
  assert!(matches!(outcome, RocketOutcome::Lost { .. }));
  assert_eq!(state(&rocket, fw_id).await, FwState::Defused);

  let err = launchpad.defuse_fw(fw_id).await.unwrap_err();
  assert!(matches!(err, EngineError::InvalidState { .. }));
}

#[tokio::test]
async fn test_rapidfire_until_empty() {
  let tmp = tempfile::tempdir().unwrap();
  let rocket = rocket();
  let def = WorkflowDef {
    name: "chain".to_string(),
    fireworks: vec![
      fw(1, vec![emit(json!({"action": "CONTINUE"}))]),
      fw(2, vec![TaskSpec::new("Script Task", spec(json!({"script": "echo hello"})))]),
      fw(3, vec![TaskSpec::new("Fail Task", Spec::new())]),
    ],
    links: BTreeMap::from([(1, vec![2]), (2, vec![3])]),
  };
  rocket.launchpad().add_wf(def).await.unwrap();

  let options = RapidfireOptions {
    nlaunches: NLaunches::UntilEmpty,
    sleep: Duration::from_millis(10),
    base_dir: tmp.path().to_path_buf(),
  };
  let report = rapidfire(&rocket, &FWorker::default(), &options, &CancellationToken::new())
    .await
    .unwrap();

  assert_eq!(report.launched, 3);
  assert_eq!(report.completed, 2);
  assert_eq!(report.fizzled, 1);
  let dirs = std::fs::read_dir(tmp.path()).unwrap().count();
  assert_eq!(dirs, 3);
}

#[tokio::test]
async fn test_rapidfire_stops_on_cancel() {
  let tmp = tempfile::tempdir().unwrap();
  let rocket = rocket();
  let options = RapidfireOptions {
    nlaunches: NLaunches::Infinite,
    sleep: Duration::from_secs(3600),
    base_dir: tmp.path().to_path_buf(),
  };
  let cancel = CancellationToken::new();
  let canceller = cancel.clone();
  tokio::spawn(async move {
    tokio::time::sleep(Duration::from_millis(20)).await;
    canceller.cancel();
  });

  let report = rapidfire(&rocket, &FWorker::default(), &options, &cancel)
    .await
    .unwrap();
  assert_eq!(report.launched, 0);
}

/// Claim every id and run all of them at once.
async fn run_concurrently(rocket: &Rocket, fw_ids: &[FwId]) -> Vec<RocketOutcome> {
  let mut claims = Vec::new();
  for id in fw_ids {
    let claim = rocket
      .launchpad()
      .claim_fw(*id, &FWorker::default(), None)
      .await
      .unwrap()
      .unwrap();
    claims.push(claim);
  }
  let runs = claims.into_iter().map(|claim| {
    let rocket = rocket.clone();
    tokio::spawn(async move { rocket.run(claim.firework, claim.launch).await })
  });
  futures::future::join_all(runs)
    .await
    .into_iter()
    .map(|r| r.unwrap().unwrap())
    .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallel_siblings_all_complete() {
  let dir = tempfile::tempdir().unwrap();
  let store: Arc<dyn Store> = Arc::new(SqliteStore::open(&dir.path().join("fw.db")).await.unwrap());
  let rocket = rocket_with(store, FwConfig::default());
  let def = WorkflowDef {
    name: "siblings".to_string(),
    fireworks: (1..=32)
      .map(|i| fw(i, vec![emit(json!({"action": "CONTINUE"}))]))
      .collect(),
    links: BTreeMap::new(),
  };
  let ids: Vec<FwId> = rocket.launchpad().add_wf(def).await.unwrap().id_map.into_values().collect();

  let outcomes = run_concurrently(&rocket, &ids).await;
  for outcome in &outcomes {
    assert!(matches!(outcome, RocketOutcome::Completed { .. }), "{outcome:?}");
  }
  for id in ids {
    assert_eq!(state(&rocket, id).await, FwState::Completed);
  }
  let running = rocket
    .launchpad()
    .store()
    .query_launches(&LaunchQuery::new().state(LaunchState::Running))
    .await
    .unwrap();
  assert!(running.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parents_finishing_together_release_join() {
  let dir = tempfile::tempdir().unwrap();
  let store: Arc<dyn Store> = Arc::new(SqliteStore::open(&dir.path().join("fw.db")).await.unwrap());
  let rocket = rocket_with(store, FwConfig::default());
  let parents = [1, 2, 3, 4];
  let mut fireworks: Vec<FireWorkDef> = parents
    .iter()
    .map(|i| {
      let mut data = Spec::new();
      data.insert(format!("p{i}"), json!(i));
      fw(*i, vec![emit(json!({"action": "CONTINUE", "stored_data": data}))])
    })
    .collect();
  fireworks.push(fw(5, vec![]));
  let def = WorkflowDef {
    name: "join".to_string(),
    fireworks,
    links: parents.iter().map(|p| (*p, vec![5])).collect(),
  };
  let ids = rocket.launchpad().add_wf(def).await.unwrap().id_map;
  let parent_ids: Vec<FwId> = parents.iter().map(|p| ids[p]).collect();

  let outcomes = run_concurrently(&rocket, &parent_ids).await;
  assert!(outcomes.iter().all(|o| matches!(o, RocketOutcome::Completed { .. })));

  let join = rocket.launchpad().get_fw_by_id(ids[&5]).await.unwrap();
  assert_eq!(join.state, FwState::Ready);
  for p in parents {
    assert_eq!(join.spec[format!("p{p}").as_str()], json!(p));
  }
}

/// What happens to a launch right after the sweep has queried it.
#[derive(Clone, Copy)]
enum Interleave {
  Heartbeat(DateTime<Utc>),
  JobStarts,
}

/// Delegates to a memory store, changing queried launches behind the
/// caller's back.
struct RacingStore {
  inner: MemoryStore,
  interleave: Interleave,
}

#[async_trait]
impl Store for RacingStore {
  async fn allocate_ids(&self, kind: IdKind, count: usize) -> Result<Range<i64>, fireworks_store::Error> {
    self.inner.allocate_ids(kind, count).await
  }

  async fn get_workflow(&self, workflow_id: WorkflowId) -> Result<Workflow, fireworks_store::Error> {
    self.inner.get_workflow(workflow_id).await
  }

  async fn get_firework(&self, fw_id: FwId) -> Result<FireWork, fireworks_store::Error> {
    self.inner.get_firework(fw_id).await
  }

  async fn get_launch(&self, launch_id: LaunchId) -> Result<Launch, fireworks_store::Error> {
    self.inner.get_launch(launch_id).await
  }

  async fn get_fireworks(&self, fw_ids: &[FwId]) -> Result<Vec<FireWork>, fireworks_store::Error> {
    self.inner.get_fireworks(fw_ids).await
  }

  async fn query_fireworks(&self, query: &FireWorkQuery) -> Result<Vec<FireWork>, fireworks_store::Error> {
    self.inner.query_fireworks(query).await
  }

  async fn query_launches(&self, query: &LaunchQuery) -> Result<Vec<Launch>, fireworks_store::Error> {
    let found = self.inner.query_launches(query).await?;
    for launch in &found {
      match self.interleave {
        Interleave::Heartbeat(at) => {
          self.inner.touch_launch(launch.launch_id, at).await?;
        }
        Interleave::JobStarts => {
          let mut started = launch.clone();
          started.state = LaunchState::Running;
          let mut fw = self.inner.get_firework(launch.fw_id).await?;
          let guard = FireWorkGuard::Exact {
            state: fw.state,
            revision: fw.revision,
          };
          fw.state = FwState::Running;
          let commit = Commit::new()
            .firework(fw, guard)
            .launch(started, LaunchGuard::State(LaunchState::Reserved));
          assert_eq!(self.inner.commit(commit).await?, CommitOutcome::Applied);
        }
      }
    }
    Ok(found)
  }

  async fn upsert_workflow(&self, workflow: &Workflow) -> Result<(), fireworks_store::Error> {
    self.inner.upsert_workflow(workflow).await
  }

  async fn upsert_firework(&self, firework: &FireWork) -> Result<(), fireworks_store::Error> {
    self.inner.upsert_firework(firework).await
  }

  async fn upsert_launch(&self, launch: &Launch) -> Result<(), fireworks_store::Error> {
    self.inner.upsert_launch(launch).await
  }

  async fn commit(&self, commit: Commit) -> Result<CommitOutcome, fireworks_store::Error> {
    self.inner.commit(commit).await
  }

  async fn touch_launch(&self, launch_id: LaunchId, now: DateTime<Utc>) -> Result<bool, fireworks_store::Error> {
    self.inner.touch_launch(launch_id, now).await
  }

  async fn set_reservation_id(
    &self,
    launch_id: LaunchId,
    reservation_id: &str,
  ) -> Result<bool, fireworks_store::Error> {
    self.inner.set_reservation_id(launch_id, reservation_id).await
  }

  async fn reset(&self) -> Result<(), fireworks_store::Error> {
    self.inner.reset().await
  }
}

#[tokio::test]
async fn test_detect_fizzled_spares_launch_that_just_pinged() {
  let now = Utc::now();
  let store = Arc::new(RacingStore {
    inner: MemoryStore::new(),
    interleave: Interleave::Heartbeat(now),
  });
  let launchpad = LaunchPad::new(store.clone(), Arc::new(FwConfig::default()));
  let fw_id = launchpad.add_wf(fw(1, vec![]).into_workflow()).await.unwrap().id_map[&1];
  let claim = launchpad.claim_fw(fw_id, &FWorker::default(), None).await.unwrap().unwrap();
  let (mut fw, mut launch) = (claim.firework, claim.launch);
  fw.state = FwState::Running;
  launch.state = LaunchState::Running;
  launch.last_heartbeat = now - chrono::Duration::seconds(500);
  store.inner.upsert_firework(&fw).await.unwrap();
  store.inner.upsert_launch(&launch).await.unwrap();

  let report = launchpad
    .detect_fizzled_at(now, Duration::from_secs(100), true)
    .await
    .unwrap();
  assert_eq!(report.stale.len(), 1);
  assert!(report.fixed.is_empty());
  assert_eq!(launchpad.get_fw_by_id(fw_id).await.unwrap().state, FwState::Running);
  assert_eq!(
    launchpad.get_launch(launch.launch_id).await.unwrap().state,
    LaunchState::Running
  );
}

#[tokio::test]
async fn test_detect_unreserved_leaves_started_job_alone() {
  let store = Arc::new(RacingStore {
    inner: MemoryStore::new(),
    interleave: Interleave::JobStarts,
  });
  let launchpad = LaunchPad::new(store, Arc::new(FwConfig::default()));
  let fw_id = launchpad.add_wf(fw(1, vec![]).into_workflow()).await.unwrap().id_map[&1];
  let claim = launchpad
    .claim_next(
      &FWorker::default(),
      ClaimOptions {
        reservation_id: Some("888.queue".to_string()),
        ..ClaimOptions::default()
      },
    )
    .await
    .unwrap()
    .unwrap();

  let canceller = RecordingCanceller::default();
  let later = Utc::now() + chrono::Duration::seconds(61);
  let report = launchpad
    .detect_unreserved_at(later, Duration::from_secs(60), true, Some(&canceller))
    .await
    .unwrap();

  assert_eq!(report.stale.len(), 1);
  assert!(report.fixed.is_empty());
  assert!(canceller.cancelled.lock().unwrap().is_empty());
  assert_eq!(launchpad.get_fw_by_id(fw_id).await.unwrap().state, FwState::Running);
  let launch = launchpad.get_launch(claim.launch.launch_id).await.unwrap();
  assert_eq!(launch.state, LaunchState::Running);
  assert_eq!(launch.reservation_id.as_deref(), Some("888.queue"));
}
