use std::ops::Range;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fireworks_workflow::{FireWork, FwId, Launch, LaunchId, LaunchState, Workflow, WorkflowId};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteQueryResult};
use sqlx::types::Json;
use sqlx::{QueryBuilder, Sqlite, SqliteConnection, SqlitePool};
use tracing::debug;

use crate::commit::{
  Commit, CommitOutcome, Conflict, FireWorkGuard, LaunchGuard, WorkflowGuard,
};
use crate::query::{FireWorkQuery, LaunchQuery};
use crate::rows::{FireWorkRow, LaunchRow, WorkflowRow};
use crate::{Error, IdKind, Store};

const WORKFLOW_COLUMNS: &str = "workflow_id, name, fw_ids, links, revision, created_on, updated_on";
const FIREWORK_COLUMNS: &str = "fw_id, workflow_id, name, tasks, spec, state, output, launch_ids, revision, created_on, updated_on";
const LAUNCH_COLUMNS: &str = "launch_id, fw_id, fworker, host, launch_dir, state, reservation_id, created_on, last_heartbeat, started_on, ended_on, action, error";

/// SQLite-based store implementation.
///
/// A file-backed store may be shared by any number of processes; guarded
/// writes run inside one transaction whose first statement is a write, so
/// SQLite's database lock serializes competing commits.
#[derive(Debug, Clone)]
pub struct SqliteStore {
  pool: SqlitePool,
}

impl SqliteStore {
  /// Create a new SQLite store with the given connection pool.
  pub fn new(pool: SqlitePool) -> Self {
    Self { pool }
  }

  /// Open (creating if needed) the database file at `path` and migrate it.
  pub async fn open(path: &Path) -> Result<Self, Error> {
    let options = SqliteConnectOptions::new()
      .filename(path)
      .create_if_missing(true)
      .journal_mode(SqliteJournalMode::Wal)
      .busy_timeout(Duration::from_secs(30));
    let pool = SqlitePoolOptions::new()
      .max_connections(4)
      .connect_with(options)
      .await?;
    let store = Self::new(pool);
    store.migrate().await?;
    Ok(store)
  }

  /// A private in-memory database, migrated.
  pub async fn in_memory() -> Result<Self, Error> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
    // One connection that never expires: the database lives as long as it.
    let pool = SqlitePoolOptions::new()
      .min_connections(1)
      .max_connections(1)
      .idle_timeout(None)
      .max_lifetime(None)
      .connect_with(options)
      .await?;
    let store = Self::new(pool);
    store.migrate().await?;
    Ok(store)
  }

  /// Run database migrations.
  pub async fn migrate(&self) -> Result<(), Error> {
    sqlx::migrate!("../../migrations").run(&self.pool).await?;
    Ok(())
  }
}

async fn write_workflow(
  conn: &mut SqliteConnection,
  workflow: &Workflow,
  guard: WorkflowGuard,
) -> Result<SqliteQueryResult, sqlx::Error> {
  let sql = match guard {
    WorkflowGuard::Unconditional => {
      r#"
      INSERT INTO workflows (workflow_id, name, fw_ids, links, created_on, updated_on, revision)
      VALUES (?, ?, ?, ?, ?, ?, 0)
      ON CONFLICT(workflow_id) DO UPDATE SET
        name = excluded.name, fw_ids = excluded.fw_ids, links = excluded.links,
        updated_on = excluded.updated_on, revision = workflows.revision + 1
      "#
    }
    WorkflowGuard::Insert => {
      r#"
      INSERT INTO workflows (workflow_id, name, fw_ids, links, created_on, updated_on, revision)
      VALUES (?, ?, ?, ?, ?, ?, 0)
      ON CONFLICT(workflow_id) DO NOTHING
      "#
    }
    WorkflowGuard::Revision(_) => {
      r#"
      UPDATE workflows
      SET workflow_id = ?1, name = ?2, fw_ids = ?3, links = ?4, created_on = ?5, updated_on = ?6,
          revision = revision + 1
      WHERE workflow_id = ?1 AND revision = ?7
      "#
    }
  };

  let mut query = sqlx::query(sql)
    .bind(workflow.workflow_id)
    .bind(&workflow.name)
    .bind(Json(&workflow.fw_ids))
    .bind(Json(&workflow.links))
    .bind(workflow.created_on)
    .bind(workflow.updated_on);
  if let WorkflowGuard::Revision(revision) = guard {
    query = query.bind(revision as i64);
  }
  query.execute(conn).await
}

async fn write_firework(
  conn: &mut SqliteConnection,
  fw: &FireWork,
  guard: FireWorkGuard,
) -> Result<SqliteQueryResult, sqlx::Error> {
  let sql = match guard {
    FireWorkGuard::Unconditional => {
      r#"
      INSERT INTO fireworks (fw_id, workflow_id, name, tasks, spec, state, output, launch_ids, created_on, updated_on, revision)
      VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0)
      ON CONFLICT(fw_id) DO UPDATE SET
        workflow_id = excluded.workflow_id, name = excluded.name, tasks = excluded.tasks,
        spec = excluded.spec, state = excluded.state, output = excluded.output,
        launch_ids = excluded.launch_ids, updated_on = excluded.updated_on,
        revision = fireworks.revision + 1
      "#
    }
    FireWorkGuard::Insert => {
      r#"
      INSERT INTO fireworks (fw_id, workflow_id, name, tasks, spec, state, output, launch_ids, created_on, updated_on, revision)
      VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0)
      ON CONFLICT(fw_id) DO NOTHING
      "#
    }
    FireWorkGuard::State(_) => {
      r#"
      UPDATE fireworks
      SET fw_id = ?1, workflow_id = ?2, name = ?3, tasks = ?4, spec = ?5, state = ?6, output = ?7,
          launch_ids = ?8, created_on = ?9, updated_on = ?10, revision = revision + 1
      WHERE fw_id = ?1 AND state = ?11
      "#
    }
    FireWorkGuard::Exact { .. } => {
      r#"
      UPDATE fireworks
      SET fw_id = ?1, workflow_id = ?2, name = ?3, tasks = ?4, spec = ?5, state = ?6, output = ?7,
          launch_ids = ?8, created_on = ?9, updated_on = ?10, revision = revision + 1
      WHERE fw_id = ?1 AND state = ?11 AND revision = ?12
      "#
    }
  };

  let mut query = sqlx::query(sql)
    .bind(fw.fw_id)
    .bind(fw.workflow_id)
    .bind(&fw.name)
    .bind(Json(&fw.tasks))
    .bind(Json(&fw.spec))
    .bind(fw.state.as_str())
    .bind(Json(&fw.output))
    .bind(Json(&fw.launch_ids))
    .bind(fw.created_on)
    .bind(fw.updated_on);
  match guard {
    FireWorkGuard::State(state) => query = query.bind(state.as_str()),
    FireWorkGuard::Exact { state, revision } => {
      query = query.bind(state.as_str()).bind(revision as i64);
    }
    FireWorkGuard::Unconditional | FireWorkGuard::Insert => {}
  }
  query.execute(conn).await
}

async fn write_launch(
  conn: &mut SqliteConnection,
  launch: &Launch,
  guard: LaunchGuard,
) -> Result<SqliteQueryResult, sqlx::Error> {
  let sql = match guard {
    LaunchGuard::Unconditional => {
      r#"
      INSERT OR REPLACE INTO launches (launch_id, fw_id, fworker, host, launch_dir, state, reservation_id, created_on, last_heartbeat, started_on, ended_on, action, error)
      VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
      "#
    }
    LaunchGuard::Insert => {
      r#"
      INSERT INTO launches (launch_id, fw_id, fworker, host, launch_dir, state, reservation_id, created_on, last_heartbeat, started_on, ended_on, action, error)
      VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
      ON CONFLICT(launch_id) DO NOTHING
      "#
    }
    LaunchGuard::State(_) => {
      r#"
      UPDATE launches
      SET launch_id = ?1, fw_id = ?2, fworker = ?3, host = ?4, launch_dir = ?5, state = ?6,
          reservation_id = COALESCE(?7, reservation_id), created_on = ?8, last_heartbeat = ?9, started_on = ?10,
          ended_on = ?11, action = ?12, error = ?13
      WHERE launch_id = ?1 AND state = ?14
      "#
    }
    LaunchGuard::Heartbeat { .. } => {
      r#"
      UPDATE launches
      SET launch_id = ?1, fw_id = ?2, fworker = ?3, host = ?4, launch_dir = ?5, state = ?6,
          reservation_id = COALESCE(?7, reservation_id), created_on = ?8, last_heartbeat = ?9, started_on = ?10,
          ended_on = ?11, action = ?12, error = ?13
      WHERE launch_id = ?1 AND state = ?14 AND last_heartbeat = ?15
      "#
    }
  };

  let mut query = sqlx::query(sql)
    .bind(launch.launch_id)
    .bind(launch.fw_id)
    .bind(Json(&launch.fworker))
    .bind(&launch.host)
    .bind(&launch.launch_dir)
    .bind(launch.state.as_str())
    .bind(&launch.reservation_id)
    .bind(launch.created_on)
    .bind(launch.last_heartbeat)
    .bind(launch.started_on)
    .bind(launch.ended_on)
    .bind(launch.action.as_ref().map(Json))
    .bind(&launch.error);
  match guard {
    LaunchGuard::State(state) => query = query.bind(state.as_str()),
    LaunchGuard::Heartbeat {
      state,
      last_heartbeat,
    } => query = query.bind(state.as_str()).bind(last_heartbeat),
    LaunchGuard::Unconditional | LaunchGuard::Insert => {}
  }
  query.execute(conn).await
}

#[async_trait]
impl Store for SqliteStore {
  async fn allocate_ids(&self, kind: IdKind, count: usize) -> Result<Range<i64>, Error> {
    let count = count as i64;
    let next: i64 = sqlx::query_scalar(
      r#"
      UPDATE id_counters SET next_id = next_id + ? WHERE kind = ?
      RETURNING next_id
      "#,
    )
    .bind(count)
    .bind(kind.as_str())
    .fetch_one(&self.pool)
    .await?;
    Ok(next - count..next)
  }

  async fn get_workflow(&self, workflow_id: WorkflowId) -> Result<Workflow, Error> {
    let row: Option<WorkflowRow> = sqlx::query_as(&format!(
      "SELECT {WORKFLOW_COLUMNS} FROM workflows WHERE workflow_id = ?"
    ))
    .bind(workflow_id)
    .fetch_optional(&self.pool)
    .await?;
    row
      .ok_or(Error::NotFound {
        kind: "workflow",
        id: workflow_id,
      })?
      .try_into()
  }

  async fn get_firework(&self, fw_id: FwId) -> Result<FireWork, Error> {
    let row: Option<FireWorkRow> = sqlx::query_as(&format!(
      "SELECT {FIREWORK_COLUMNS} FROM fireworks WHERE fw_id = ?"
    ))
    .bind(fw_id)
    .fetch_optional(&self.pool)
    .await?;
    row
      .ok_or(Error::NotFound {
        kind: "firework",
        id: fw_id,
      })?
      .try_into()
  }

  async fn get_launch(&self, launch_id: LaunchId) -> Result<Launch, Error> {
    let row: Option<LaunchRow> = sqlx::query_as(&format!(
      "SELECT {LAUNCH_COLUMNS} FROM launches WHERE launch_id = ?"
    ))
    .bind(launch_id)
    .fetch_optional(&self.pool)
    .await?;
    row
      .ok_or(Error::NotFound {
        kind: "launch",
        id: launch_id,
      })?
      .try_into()
  }

  async fn get_fireworks(&self, fw_ids: &[FwId]) -> Result<Vec<FireWork>, Error> {
    self
      .query_fireworks(&FireWorkQuery::new().ids(fw_ids.to_vec()))
      .await
  }

  async fn query_fireworks(&self, query: &FireWorkQuery) -> Result<Vec<FireWork>, Error> {
    if query.fw_ids.as_ref().is_some_and(|ids| ids.is_empty()) {
      return Ok(Vec::new());
    }

    let mut builder: QueryBuilder<Sqlite> =
      QueryBuilder::new(format!("SELECT {FIREWORK_COLUMNS} FROM fireworks WHERE 1 = 1"));
    if !query.states.is_empty() {
      builder.push(" AND state IN (");
      let mut separated = builder.separated(", ");
      for state in &query.states {
        separated.push_bind(state.as_str());
      }
      separated.push_unseparated(")");
    }
    if let Some(workflow_id) = query.workflow_id {
      builder.push(" AND workflow_id = ").push_bind(workflow_id);
    }
    if let Some(ids) = &query.fw_ids {
      builder.push(" AND fw_id IN (");
      let mut separated = builder.separated(", ");
      for id in ids {
        separated.push_bind(*id);
      }
      separated.push_unseparated(")");
    }
    builder.push(" ORDER BY fw_id");

    let rows: Vec<FireWorkRow> = builder.build_query_as().fetch_all(&self.pool).await?;
    let mut fireworks = Vec::with_capacity(rows.len());
    for row in rows {
      let fw = FireWork::try_from(row)?;
      if query.matches_spec(&fw) {
        fireworks.push(fw);
      }
    }
    Ok(fireworks)
  }

  async fn query_launches(&self, query: &LaunchQuery) -> Result<Vec<Launch>, Error> {
    let mut builder: QueryBuilder<Sqlite> =
      QueryBuilder::new(format!("SELECT {LAUNCH_COLUMNS} FROM launches WHERE 1 = 1"));
    if let Some(state) = query.state {
      builder.push(" AND state = ").push_bind(state.as_str());
    }
    if let Some(fw_id) = query.fw_id {
      builder.push(" AND fw_id = ").push_bind(fw_id);
    }
    builder.push(" ORDER BY launch_id");

    let rows: Vec<LaunchRow> = builder.build_query_as().fetch_all(&self.pool).await?;
    rows.into_iter().map(Launch::try_from).collect()
  }

  async fn upsert_workflow(&self, workflow: &Workflow) -> Result<(), Error> {
    let mut conn = self.pool.acquire().await?;
    write_workflow(&mut *conn, workflow, WorkflowGuard::Unconditional).await?;
    Ok(())
  }

  async fn upsert_firework(&self, firework: &FireWork) -> Result<(), Error> {
    let mut conn = self.pool.acquire().await?;
    write_firework(&mut *conn, firework, FireWorkGuard::Unconditional).await?;
    Ok(())
  }

  async fn upsert_launch(&self, launch: &Launch) -> Result<(), Error> {
    let mut conn = self.pool.acquire().await?;
    write_launch(&mut *conn, launch, LaunchGuard::Unconditional).await?;
    Ok(())
  }

  async fn commit(&self, commit: Commit) -> Result<CommitOutcome, Error> {
    let mut tx = self.pool.begin().await?;

    let mut conflict = None;
    for w in &commit.workflows {
      let result = write_workflow(&mut *tx, &w.workflow, w.guard).await?;
      if result.rows_affected() == 0 {
        conflict = Some(Conflict::Workflow(w.workflow.workflow_id));
        break;
      }
    }
    if conflict.is_none() {
      for f in &commit.fireworks {
        let result = write_firework(&mut *tx, &f.firework, f.guard).await?;
        if result.rows_affected() == 0 {
          conflict = Some(Conflict::FireWork(f.firework.fw_id));
          break;
        }
      }
    }
    if conflict.is_none() {
      for l in &commit.launches {
        let result = write_launch(&mut *tx, &l.launch, l.guard).await?;
        if result.rows_affected() == 0 {
          conflict = Some(Conflict::Launch(l.launch.launch_id));
          break;
        }
      }
    }

    match conflict {
      Some(conflict) => {
        tx.rollback().await?;
        debug!(?conflict, "commit_conflict");
        Ok(CommitOutcome::Conflict(conflict))
      }
      None => {
        tx.commit().await?;
        Ok(CommitOutcome::Applied)
      }
    }
  }

  async fn touch_launch(&self, launch_id: LaunchId, now: DateTime<Utc>) -> Result<bool, Error> {
    let result = sqlx::query("UPDATE launches SET last_heartbeat = ? WHERE launch_id = ? AND state = ?")
      .bind(now)
      .bind(launch_id)
      .bind(LaunchState::Running.as_str())
      .execute(&self.pool)
      .await?;
    Ok(result.rows_affected() == 1)
  }

  async fn set_reservation_id(
    &self,
    launch_id: LaunchId,
    reservation_id: &str,
  ) -> Result<bool, Error> {
    let result = sqlx::query(
      "UPDATE launches SET reservation_id = ? WHERE launch_id = ? AND state IN (?, ?)",
    )
    .bind(reservation_id)
    .bind(launch_id)
    .bind(LaunchState::Reserved.as_str())
    .bind(LaunchState::Running.as_str())
    .execute(&self.pool)
    .await?;
    Ok(result.rows_affected() == 1)
  }

  async fn reset(&self) -> Result<(), Error> {
    let mut tx = self.pool.begin().await?;
    sqlx::query("DELETE FROM launches").execute(&mut *tx).await?;
    sqlx::query("DELETE FROM fireworks").execute(&mut *tx).await?;
    sqlx::query("DELETE FROM workflows").execute(&mut *tx).await?;
    sqlx::query("UPDATE id_counters SET next_id = 1")
      .execute(&mut *tx)
      .await?;
    tx.commit().await?;
    Ok(())
  }
}
