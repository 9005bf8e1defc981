use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, fmt};

use fireworks_config::FwConfig;
use fireworks_engine::{LaunchPad, NLaunches, RapidfireOptions, ReservationCanceller, Rocket, rapidfire};
use fireworks_queue::{AdapterCanceller, CommandAdapter, QueueLauncher, QueueParams, QueueRapidfireOptions};
use fireworks_store::{FireWorkQuery, SqliteStore};
use fireworks_task::TaskRegistry;
use fireworks_workflow::{FWORKER_FILE_NAME, FWorker, FwId, FwState, LaunchId, WorkflowDef};

/// FireWorks - workflow manager for batch computing
#[derive(Parser)]
#[command(name = "fireworks")]
#[command(version, about, long_about = None)]
struct Cli {
  /// Config override file (default: $FW_CONFIG_FILE, then ./FW_config.yaml)
  #[arg(long, global = true)]
  config: Option<PathBuf>,

  /// Path to the launchpad database (default: ~/.fireworks/fireworks.db)
  #[arg(long, global = true)]
  db: Option<PathBuf>,

  /// Worker descriptor (default: ./my_fworker.yaml if present)
  #[arg(long, global = true)]
  fworker_file: Option<PathBuf>,

  /// Log level used when RUST_LOG is not set
  #[arg(long, global = true, default_value = "info")]
  log_level: String,

  /// Also write logs to a file in this directory
  #[arg(long, global = true)]
  logdir: Option<PathBuf>,

  /// Do not log to the terminal
  #[arg(long, global = true)]
  silencer: bool,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Manage the launchpad
  Lpad {
    #[command(subcommand)]
    command: LpadCommand,
  },
  /// Run rockets on this machine
  Rlaunch {
    #[command(subcommand)]
    command: RlaunchCommand,
  },
  /// Submit rockets to a batch queue
  Qlaunch {
    /// Queue params file (YAML or JSON)
    queue_params: PathBuf,

    /// Directory to launch in (singleshot) or to create blocks under (rapidfire)
    #[arg(long, default_value = ".")]
    launch_dir: PathBuf,

    /// Reserve a FireWork for each submitted job
    #[arg(short, long)]
    reserve: bool,

    #[command(subcommand)]
    command: QlaunchCommand,
  },
}

#[derive(Subcommand)]
enum LpadCommand {
  /// Add a FireWork or workflow document
  Add { file: PathBuf },
  /// Print a FireWork
  GetFw {
    fw_id: FwId,
    /// Write to this file instead (.json, otherwise YAML)
    #[arg(long)]
    filename: Option<PathBuf>,
  },
  /// Print FireWork ids matching a query
  GetFwIds {
    /// JSON object: "state", "workflow_id", or dotted spec paths
    #[arg(long)]
    query: Option<String>,
  },
  /// Find RUNNING launches that stopped sending heartbeats
  DetectFizzled {
    /// Expiration in seconds (default: RUN_EXPIRATION_SECS)
    #[arg(long)]
    time: Option<u64>,
    /// Mark them FIZZLED
    #[arg(long)]
    fix: bool,
  },
  /// Find RESERVED launches that never started
  DetectUnreserved {
    /// Expiration in seconds (default: RESERVATION_EXPIRATION_SECS)
    #[arg(long)]
    time: Option<u64>,
    /// Cancel the reservation and make the FireWork READY again
    #[arg(long)]
    fix: bool,
    /// Queue params used to cancel the queued job
    #[arg(long)]
    queue_params: Option<PathBuf>,
  },
  /// Delete everything; the password is today's date (YYYY-MM-DD)
  Reset { password: String },
  /// DEFUSE a FireWork
  DefuseFw { fw_id: FwId },
  /// ARCHIVE a FireWork
  ArchiveFw { fw_id: FwId },
  /// Print the version
  Version,
}

#[derive(Subcommand)]
enum RlaunchCommand {
  /// Run one rocket
  Singleshot {
    /// Run this FireWork
    #[arg(long, conflicts_with = "launch_id")]
    fw_id: Option<FwId>,
    /// Run a launch reserved through the queue
    #[arg(long)]
    launch_id: Option<LaunchId>,
    /// Directory to run in
    #[arg(long)]
    launch_dir: Option<PathBuf>,
  },
  /// Run rockets back to back
  Rapidfire {
    /// Launches to run: a number, 0 until nothing is READY, or "infinite"
    #[arg(long, default_value = "0")]
    nlaunches: NLaunches,
    /// Seconds to wait for work when nothing is READY
    #[arg(long, default_value_t = 60)]
    sleep: u64,
    /// Directory to create launcher directories in
    #[arg(long, default_value = ".")]
    launch_dir: PathBuf,
  },
}

#[derive(Subcommand)]
enum QlaunchCommand {
  /// Submit one job
  Singleshot,
  /// Keep the queue filled
  Rapidfire {
    /// Jobs to keep in the queue
    #[arg(short = 'q', long, default_value_t = 10)]
    njobs_queue: usize,
    /// Jobs per block directory
    #[arg(short = 'b', long, default_value_t = 500)]
    njobs_block: usize,
    /// Fill loops: a number, 0 until nothing is READY, or "infinite"
    #[arg(long, default_value = "0")]
    nlaunches: NLaunches,
    /// Seconds between fill loops
    #[arg(long, default_value_t = 60)]
    sleep: u64,
  },
}

/// Resolved global options shared by every command.
struct Env {
  config: Arc<FwConfig>,
  config_path: Option<PathBuf>,
  db: PathBuf,
  fworker_file: Option<PathBuf>,
}

impl Env {
  fn load(cli: &Cli) -> Result<Self> {
    let cwd = std::env::current_dir().context("failed to read current directory")?;
    let (config, config_path) =
      FwConfig::discover(cli.config.as_deref(), &cwd).context("failed to load configuration")?;

    let db = match &cli.db {
      Some(db) => db.clone(),
      None => dirs::home_dir()
        .context("could not determine home directory; pass --db")?
        .join(".fireworks")
        .join("fireworks.db"),
    };

    let fworker_file = cli.fworker_file.clone().or_else(|| {
      let default = cwd.join(FWORKER_FILE_NAME);
      default.exists().then_some(default)
    });

    Ok(Self {
      config: Arc::new(config),
      config_path,
      db,
      fworker_file,
    })
  }

  async fn launchpad(&self) -> Result<LaunchPad> {
    if let Some(parent) = self.db.parent().filter(|p| !p.as_os_str().is_empty()) {
      tokio::fs::create_dir_all(parent)
        .await
        .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let store = SqliteStore::open(&self.db)
      .await
      .with_context(|| format!("failed to open launchpad {}", self.db.display()))?;
    Ok(LaunchPad::new(Arc::new(store), self.config.clone()))
  }

  fn fworker(&self) -> Result<FWorker> {
    match &self.fworker_file {
      Some(path) => FWorker::from_file(path).context("failed to load worker"),
      None => Ok(FWorker::default()),
    }
  }

  fn registry(&self) -> Result<Arc<TaskRegistry>> {
    Ok(Arc::new(
      TaskRegistry::from_config(&self.config).context("failed to build task registry")?,
    ))
  }

  /// The rlaunch invocation a queued job runs, pointing at the same files.
  fn rocket_command(&self) -> Result<String> {
    let exe = std::env::current_exe().context("failed to locate this executable")?;
    let mut parts = vec![quote(&exe), "--db".to_string(), quote(&absolute(&self.db)?)];
    if let Some(config) = &self.config_path {
      parts.push("--config".to_string());
      parts.push(quote(&absolute(config)?));
    }
    if let Some(fworker) = &self.fworker_file {
      parts.push("--fworker-file".to_string());
      parts.push(quote(&absolute(fworker)?));
    }
    parts.push("rlaunch".to_string());
    Ok(parts.join(" "))
  }
}

fn absolute(path: &Path) -> Result<PathBuf> {
  std::path::absolute(path).with_context(|| format!("failed to resolve {}", path.display()))
}

fn quote(path: &Path) -> String {
  let text = path.display().to_string();
  if text.chars().all(|c| c.is_ascii_alphanumeric() || "/._-+".contains(c)) {
    text
  } else {
    format!("'{}'", text.replace('\'', r"'\''"))
  }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
  println!("{}", serde_json::to_string_pretty(value)?);
  Ok(())
}

const LOG_FILE_NAME: &str = "fireworks.log";

/// The returned guard flushes the log file when dropped.
fn init_logging(cli: &Cli) -> Result<Option<WorkerGuard>> {
  let filter =
    || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

  let terminal = (!cli.silencer).then(|| {
    fmt::layer()
      .with_writer(std::io::stderr)
      .with_filter(filter())
  });

  let (file, guard) = match &cli.logdir {
    Some(dir) => {
      std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create log directory {}", dir.display()))?;
      let (writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::never(dir, LOG_FILE_NAME));
      let layer = fmt::layer()
        .with_ansi(false)
        .with_writer(writer)
        .with_filter(filter());
      (Some(layer), Some(guard))
    }
    None => (None, None),
  };

  tracing_subscriber::registry().with(terminal).with(file).init();
  Ok(guard)
}

fn main() -> Result<()> {
  let cli = Cli::parse();
  let _log_guard = init_logging(&cli)?;

  let env = Env::load(&cli)?;
  let rt = tokio::runtime::Runtime::new()?;
  rt.block_on(async move {
    match cli.command {
      Commands::Lpad { command } => lpad(&env, command).await,
      Commands::Rlaunch { command } => rlaunch(&env, command).await,
      Commands::Qlaunch {
        queue_params,
        launch_dir,
        reserve,
        command,
      } => qlaunch(&env, &queue_params, &launch_dir, reserve, command).await,
    }
  })
}

/// Cancelled on Ctrl-C.
fn shutdown_token() -> CancellationToken {
  let cancel = CancellationToken::new();
  let token = cancel.clone();
  tokio::spawn(async move {
    if tokio::signal::ctrl_c().await.is_ok() {
      tracing::info!("shutdown_requested");
      token.cancel();
    }
  });
  cancel
}

async fn lpad(env: &Env, command: LpadCommand) -> Result<()> {
  if let LpadCommand::Version = command {
    println!("fireworks {}", env!("CARGO_PKG_VERSION"));
    return Ok(());
  }
  let launchpad = env.launchpad().await?;

  match command {
    LpadCommand::Add { file } => {
      let def = WorkflowDef::from_file(&file)?;
      print_json(&launchpad.add_wf(def).await?)?;
    }
    LpadCommand::GetFw { fw_id, filename } => {
      let fw = launchpad.get_fw_by_id(fw_id).await?;
      match filename {
        Some(path) => {
          let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
          let content = if is_json {
            serde_json::to_string_pretty(&fw)?
          } else {
            serde_yaml::to_string(&fw)?
          };
          tokio::fs::write(&path, content)
            .await
            .with_context(|| format!("failed to write {}", path.display()))?;
        }
        None => print_json(&fw)?,
      }
    }
    LpadCommand::GetFwIds { query } => {
      let query = match query {
        Some(raw) => parse_query(&raw)?,
        None => FireWorkQuery::new(),
      };
      print_json(&launchpad.get_fw_ids(&query).await?)?;
    }
    LpadCommand::DetectFizzled { time, fix } => {
      let expiration = time
        .map(Duration::from_secs)
        .unwrap_or_else(|| env.config.run_expiration());
      let report = launchpad
        .detect_fizzled_at(chrono::Utc::now(), expiration, fix)
        .await?;
      print_json(&report)?;
    }
    LpadCommand::DetectUnreserved {
      time,
      fix,
      queue_params,
    } => {
      let expiration = time
        .map(Duration::from_secs)
        .unwrap_or_else(|| env.config.reservation_expiration());
      let canceller = match queue_params {
        Some(path) => Some(AdapterCanceller(Arc::new(CommandAdapter::new(
          QueueParams::from_file(&path)?,
        )))),
        None => None,
      };
      let report = launchpad
        .detect_unreserved_at(
          chrono::Utc::now(),
          expiration,
          fix,
          canceller.as_ref().map(|c| c as &dyn ReservationCanceller),
        )
        .await?;
      print_json(&report)?;
    }
    LpadCommand::Reset { password } => {
      launchpad.reset(&password, chrono::Utc::now()).await?;
      eprintln!("launchpad reset");
    }
    LpadCommand::DefuseFw { fw_id } => print_json(&launchpad.defuse_fw(fw_id).await?)?,
    LpadCommand::ArchiveFw { fw_id } => print_json(&launchpad.archive_fw(fw_id).await?)?,
    LpadCommand::Version => {}
  }
  Ok(())
}

/// `{"state": "READY", "workflow_id": 3, "params.code": "vasp"}`
fn parse_query(raw: &str) -> Result<FireWorkQuery> {
  let Value::Object(fields) = serde_json::from_str(raw).context("query is not valid JSON")? else {
    bail!("query must be a JSON object");
  };

  let mut query = FireWorkQuery::new();
  for (key, value) in fields {
    match key.as_str() {
      "state" => {
        let names = match value {
          Value::Array(items) => items,
          other => vec![other],
        };
        let mut states = Vec::with_capacity(names.len());
        for name in names {
          let name = name.as_str().context("state must be a string")?;
          states.push(name.parse::<FwState>()?);
        }
        query = query.states(states);
      }
      "workflow_id" => {
        query = query.workflow(value.as_i64().context("workflow_id must be an integer")?);
      }
      _ => query = query.spec_eq(key, value),
    }
  }
  Ok(query)
}

async fn rlaunch(env: &Env, command: RlaunchCommand) -> Result<()> {
  let rocket = Rocket::new(env.launchpad().await?, env.registry()?);
  let fworker = env.fworker()?;

  match command {
    RlaunchCommand::Singleshot {
      fw_id,
      launch_id,
      launch_dir,
    } => {
      let outcome = match launch_id {
        Some(id) => rocket.run_launch(id).await?,
        None => {
          let dir = launch_dir.map(|d| absolute(&d)).transpose()?;
          rocket.launch(&fworker, dir.as_deref(), fw_id).await?
        }
      };
      print_json(&outcome)?;
    }
    RlaunchCommand::Rapidfire {
      nlaunches,
      sleep,
      launch_dir,
    } => {
      let options = RapidfireOptions {
        nlaunches,
        sleep: Duration::from_secs(sleep),
        base_dir: absolute(&launch_dir)?,
      };
      let report = rapidfire(&rocket, &fworker, &options, &shutdown_token()).await?;
      print_json(&report)?;
    }
  }
  Ok(())
}

async fn qlaunch(
  env: &Env,
  queue_params: &Path,
  launch_dir: &Path,
  reserve: bool,
  command: QlaunchCommand,
) -> Result<()> {
  let params = QueueParams::from_file(queue_params)?;
  let launcher = QueueLauncher::new(
    env.launchpad().await?,
    Arc::new(CommandAdapter::new(params)),
    env.fworker()?,
    env.rocket_command()?,
  );
  let launch_dir = absolute(launch_dir)?;

  match command {
    QlaunchCommand::Singleshot => match launcher.launch_rocket_to_queue(&launch_dir, reserve).await? {
      Some(submission) => print_json(&submission)?,
      None => eprintln!("no READY FireWork to reserve"),
    },
    QlaunchCommand::Rapidfire {
      njobs_queue,
      njobs_block,
      nlaunches,
      sleep,
    } => {
      let options = QueueRapidfireOptions {
        njobs_queue,
        njobs_block,
        nlaunches,
        sleep: Duration::from_secs(sleep),
        reserve,
      };
      let report = launcher
        .rapidfire(&launch_dir, &options, &shutdown_token())
        .await?;
      print_json(&report)?;
    }
  }
  Ok(())
}
