use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use docflow_api::ApiState;
use docflow_config::AppConfig;
use docflow_engine::{
  Alert, EngineConfig, ErrorAlarm, ExecutionNotifier, FanoutNotifier, NoopNotifier,
  WorkflowEngine, WorkflowRunner,
};
use docflow_host_http::{HttpAnalysisService, HttpTaskInvoker};
use docflow_store::{MemoryStore, SqliteStore, Store};
use docflow_workflow::ExecutionOutcome;

/// docflow - a durable orchestrator for the document-processing pipeline
#[derive(Parser)]
#[command(name = "docflow")]
#[command(version, about, long_about = None)]
struct Cli {
  /// Path to the data directory (default: ~/.docflow)
  #[arg(long, global = true)]
  data_dir: Option<PathBuf>,

  /// Path to a configuration file (TOML, YAML or JSON)
  #[arg(long, global = true)]
  config: Option<PathBuf>,

  /// Emit logs as JSON lines
  #[arg(long, global = true)]
  log_json: bool,

  #[command(subcommand)]
  command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
  /// Serve the HTTP trigger and resume unfinished executions
  Serve {
    /// Also accept newline-delimited start requests on stdin
    #[arg(long)]
    stdin: bool,
  },

  /// Run one execution for the start request read from stdin and wait for it
  Run {
    /// Keep state in memory instead of the database
    #[arg(long)]
    ephemeral: bool,
  },

  /// Show the stored record and steps of an execution
  Status { execution_id: String },

  /// Inspect or redrive start requests that could not be accepted
  DeadLetters {
    #[command(subcommand)]
    action: DeadLetterAction,
  },
}

#[derive(Subcommand)]
enum DeadLetterAction {
  /// List dead letters
  List,

  /// Re-submit every dead letter and wait for the executions they start
  Redrive,
}

fn main() -> Result<()> {
  let cli = Cli::parse();
  init_tracing(cli.log_json);

  AppConfig::load_env_file();
  let config = AppConfig::load(cli.config.as_deref()).context("failed to load configuration")?;

  let data_dir = match cli.data_dir {
    Some(dir) => dir,
    None => dirs::home_dir()
      .context("could not determine home directory")?
      .join(".docflow"),
  };

  let Some(command) = cli.command else {
    println!("docflow - use --help to see available commands");
    return Ok(());
  };

  let rt = tokio::runtime::Runtime::new()?;
  rt.block_on(async {
    match command {
      Commands::Serve { stdin } => serve(config, data_dir, stdin).await,
      Commands::Run { ephemeral } => run(config, data_dir, ephemeral).await,
      Commands::Status { execution_id } => status(config, data_dir, execution_id).await,
      Commands::DeadLetters { action } => match action {
        DeadLetterAction::List => list_dead_letters(config, data_dir).await,
        DeadLetterAction::Redrive => redrive_dead_letters(config, data_dir).await,
      },
    }
  })
}

fn init_tracing(json: bool) {
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
  let builder = tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(io::stderr);
  if json {
    builder.json().init();
  } else {
    builder.init();
  }
}

async fn open_store(config: &AppConfig, data_dir: &Path) -> Result<Arc<dyn Store>> {
  if config.database_url.is_none() {
    tokio::fs::create_dir_all(data_dir)
      .await
      .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;
  }

  let url = config.database_url_or(data_dir);
  let store = SqliteStore::connect(&url)
    .await
    .with_context(|| format!("failed to open database: {}", url))?;
  Ok(Arc::new(store))
}

fn build_engine(
  config: &AppConfig,
  store: Arc<dyn Store>,
  notifier: Arc<dyn ExecutionNotifier>,
) -> Result<WorkflowEngine> {
  let tasks = HttpTaskInvoker::new(&config.workers.base_url, config.request_timeout())
    .context("invalid workers endpoint")?;
  let analysis = HttpAnalysisService::new(&config.analysis.base_url, config.request_timeout())
    .context("invalid analysis endpoint")?;

  Ok(WorkflowEngine::with_notifier(
    EngineConfig::from_app(config),
    store,
    Arc::new(tasks),
    Arc::new(analysis),
    notifier,
  ))
}

/// An error alarm whose alerts are published to the log.
fn alarm(config: &AppConfig) -> Arc<ErrorAlarm> {
  let (alerts, mut published) = mpsc::unbounded_channel::<Alert>();
  tokio::spawn(async move {
    while let Some(alert) = published.recv().await {
      warn!(
        failures = alert.failures,
        window_secs = alert.window_secs,
        execution_id = %alert.execution_id,
        error = %alert.error,
        "alert_published"
      );
    }
  });
  Arc::new(ErrorAlarm::from_config(&config.alarm, alerts))
}

async fn serve(config: AppConfig, data_dir: PathBuf, read_stdin: bool) -> Result<()> {
  let store = open_store(&config, &data_dir).await?;
  let notifier = FanoutNotifier::new().with(alarm(&config));
  let engine = build_engine(&config, store, Arc::new(notifier))?;

  let resumed = engine
    .resume_incomplete()
    .await
    .context("failed to resume executions")?;
  info!(count = resumed.len(), "executions_resumed");

  let shutdown = CancellationToken::new();

  let runner = if read_stdin {
    let runner = WorkflowRunner::with_buffer_size(engine.clone(), config.runner.buffer_size);
    tokio::spawn(forward_stdin(runner.sender()));
    Some(tokio::spawn(runner.start(shutdown.clone())))
  } else {
    None
  };

  let listener = tokio::net::TcpListener::bind(&config.listen_addr)
    .await
    .with_context(|| format!("failed to bind {}", config.listen_addr))?;
  info!(addr = %config.listen_addr, "api_listening");

  let app = docflow_api::router(ApiState {
    engine: engine.clone(),
  });
  axum::serve(listener, app)
    .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
    .await
    .context("api server failed")?;

  shutdown.cancel();
  if let Some(runner) = runner {
    runner.await?.context("workflow runner failed")?;
  }

  engine.shutdown();
  engine.drained().await;
  Ok(())
}

async fn shutdown_signal(shutdown: CancellationToken) {
  tokio::select! {
    _ = tokio::signal::ctrl_c() => info!("shutdown_requested"),
    _ = shutdown.cancelled() => {}
  }
}

/// Feed newline-delimited JSON start requests from stdin to the runner.
async fn forward_stdin(sender: mpsc::Sender<serde_json::Value>) -> Result<()> {
  let mut lines = BufReader::new(tokio::io::stdin()).lines();
  while let Some(line) = lines.next_line().await? {
    if line.trim().is_empty() {
      continue;
    }
    match serde_json::from_str(&line) {
      Ok(payload) => {
        if sender.send(payload).await.is_err() {
          break;
        }
      }
      Err(e) => warn!(error = %e, "stdin_request_unparseable"),
    }
  }
  Ok(())
}

async fn run(config: AppConfig, data_dir: PathBuf, ephemeral: bool) -> Result<()> {
  let payload = read_payload_from_stdin()?;

  let store: Arc<dyn Store> = if ephemeral {
    Arc::new(MemoryStore::new())
  } else {
    open_store(&config, &data_dir).await?
  };
  let engine = build_engine(&config, store, Arc::new(NoopNotifier))?;

  let execution_id = engine
    .start(payload)
    .await
    .context("failed to start execution")?;
  eprintln!("Execution started: {}", execution_id);

  let outcome = tokio::select! {
    outcome = engine.wait(&execution_id) => outcome?,
    _ = tokio::signal::ctrl_c() => {
      engine.cancel(&execution_id).await?;
      engine.wait(&execution_id).await?
    }
  };

  match outcome {
    ExecutionOutcome::Success(output) => {
      println!("{}", serde_json::to_string_pretty(&output)?);
      Ok(())
    }
    ExecutionOutcome::Failed(reason) => {
      anyhow::bail!("execution {} failed: {}", execution_id, reason)
    }
  }
}

async fn status(config: AppConfig, data_dir: PathBuf, execution_id: String) -> Result<()> {
  let store = open_store(&config, &data_dir).await?;

  let execution = store
    .get_execution(&execution_id)
    .await
    .with_context(|| format!("failed to load execution '{}'", execution_id))?;
  let steps = store.list_steps(&execution_id).await?;

  let output = serde_json::json!({ "execution": execution, "steps": steps });
  println!("{}", serde_json::to_string_pretty(&output)?);
  Ok(())
}

async fn list_dead_letters(config: AppConfig, data_dir: PathBuf) -> Result<()> {
  let store = open_store(&config, &data_dir).await?;
  let letters = store.list_dead_letters().await?;
  println!("{}", serde_json::to_string_pretty(&letters)?);
  Ok(())
}

async fn redrive_dead_letters(config: AppConfig, data_dir: PathBuf) -> Result<()> {
  let store = open_store(&config, &data_dir).await?;
  let engine = build_engine(&config, store, Arc::new(NoopNotifier))?;

  let report = docflow_engine::redrive(&engine).await?;
  eprintln!(
    "Redrove {} dead letters, {} remain",
    report.started.len(),
    report.remaining
  );

  for execution_id in &report.started {
    match engine.wait(execution_id).await? {
      ExecutionOutcome::Success(_) => eprintln!("{}: succeeded", execution_id),
      ExecutionOutcome::Failed(reason) => eprintln!("{}: failed: {}", execution_id, reason),
    }
  }
  Ok(())
}

fn read_payload_from_stdin() -> Result<serde_json::Value> {
  use std::io::IsTerminal;

  if io::stdin().is_terminal() {
    anyhow::bail!("expected a start request on stdin");
  }

  let mut input = String::new();
  io::stdin()
    .read_to_string(&mut input)
    .context("failed to read start request from stdin")?;
  serde_json::from_str(&input).context("failed to parse start request JSON from stdin")
}
