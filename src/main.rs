use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use clap::{ArgAction, Args, Parser, Subcommand};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use vmport_compute::{EmulatorCloud, EmulatorState, Image};
use vmport_export::{ExportArgs, ExportSource, Exporter};
use vmport_import::{
  ImportArgs, ImportContext, ImportSource, Importer, InflationMethod, parse_labels,
};
use vmport_upgrade::{UpgradeArgs, Upgrader, WorkflowPhaseRunner};
use vmport_workflow::{LoadOptions, load_workflow};
use vmport_workflow_executor::{ExecutorConfig, WorkflowExecutor};
use vmport_workflow_utils::build_id;

/// vmport - import, export and upgrade VM images
#[derive(Parser)]
#[command(name = "vmport")]
#[command(version, about, long_about = None)]
struct Cli {
  /// Emulated cloud state file (default: ~/.vmport/emulator.json)
  #[arg(long, global = true)]
  emulator_state: Option<PathBuf>,

  /// Log filter used when RUST_LOG is not set
  #[arg(long, global = true, default_value = "info")]
  log_level: String,

  /// Project to work in (default: the emulator's project)
  #[arg(long, global = true)]
  project: Option<String>,

  /// Zone to work in (default: the emulator's zone)
  #[arg(long, global = true)]
  zone: Option<String>,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Import a disk file or an image as a bootable image
  Import(ImportCommand),
  /// Export a disk, an image or every disk of an instance to Cloud Storage
  Export(ExportCommand),
  /// Upgrade Windows Server in place
  Upgrade(UpgradeCommand),
  /// Run workflow files
  Run(RunCommand),
}

#[derive(Args)]
struct CommonArgs {
  /// Labels as k=v,k2=v2
  #[arg(long, default_value = "")]
  labels: String,

  #[arg(long)]
  network: Option<String>,

  #[arg(long)]
  subnet: Option<String>,

  /// Do not give worker instances an external IP
  #[arg(long)]
  no_external_ip: bool,

  /// Overall timeout, e.g. 2h or 90m
  #[arg(long, value_parser = humantime::parse_duration)]
  timeout: Option<Duration>,
}

#[derive(Args)]
struct ImportCommand {
  #[arg(long)]
  image_name: String,

  /// gs:// path of the disk file
  #[arg(long, conflicts_with = "source_image")]
  source_file: Option<String>,

  #[arg(long)]
  source_image: Option<String>,

  /// OS to translate for; detected when omitted
  #[arg(long)]
  os: Option<String>,

  /// Import as a non-bootable data disk
  #[arg(long)]
  data_disk: bool,

  #[arg(long)]
  custom_translate_workflow: Option<PathBuf>,

  #[arg(long)]
  uefi_compatible: bool,

  /// Skip disk inspection
  #[arg(long)]
  no_inspect: bool,

  #[arg(long)]
  family: Option<String>,

  #[arg(long)]
  description: Option<String>,

  #[arg(long)]
  storage_location: Option<String>,

  /// Root of the OS translate workflows
  #[arg(long)]
  workflow_dir: Option<PathBuf>,

  /// workflow or api
  #[arg(long, default_value = "workflow")]
  inflation_method: String,

  #[command(flatten)]
  common: CommonArgs,
}

#[derive(Args)]
struct ExportCommand {
  #[arg(long)]
  source_image: Option<String>,

  #[arg(long)]
  source_disk: Option<String>,

  #[arg(long)]
  instance_name: Option<String>,

  /// gs:// object (disk, image) or folder (instance)
  #[arg(long)]
  destination_uri: String,

  /// vmdk, vhdx, vpc, vdi or qcow2; raw tar.gz when omitted
  #[arg(long)]
  format: Option<String>,

  #[command(flatten)]
  common: CommonArgs,
}

#[derive(Args)]
struct UpgradeCommand {
  /// Instance name or URI
  #[arg(long)]
  instance: String,

  #[arg(long, default_value = "windows-2008r2")]
  source_os: String,

  #[arg(long, default_value = "windows-2012r2")]
  target_os: String,

  /// Restore the original OS disk when the upgrade fails
  #[arg(long)]
  auto_rollback: bool,

  #[arg(long, default_value_t = true, action = ArgAction::Set)]
  create_machine_backup: bool,

  #[arg(long)]
  install_media_image: Option<String>,

  /// Timeout for each wait on the upgrade, e.g. 90m
  #[arg(long, value_parser = humantime::parse_duration)]
  timeout: Option<Duration>,
}

#[derive(Args)]
struct RunCommand {
  /// Workflow files (JSON)
  #[arg(required = true)]
  workflow_files: Vec<PathBuf>,

  /// Workflow variables as k=v
  #[arg(long = "var", value_parser = parse_var)]
  vars: Vec<(String, String)>,

  /// How many workflows run at once
  #[arg(long, default_value_t = 5)]
  parallel: usize,
}

fn parse_var(value: &str) -> Result<(String, String), String> {
  match value.split_once('=') {
    Some((k, v)) if !k.is_empty() => Ok((k.to_string(), v.to_string())),
    _ => Err(format!("expected k=v, got `{}`", value)),
  }
}

fn main() -> ExitCode {
  let cli = Cli::parse();
  init_tracing(&cli.log_level);

  let rt = match tokio::runtime::Runtime::new() {
    Ok(rt) => rt,
    Err(e) => {
      eprintln!("error: failed to start runtime: {}", e);
      return ExitCode::FAILURE;
    }
  };
  match rt.block_on(run(cli)) {
    Ok(()) => ExitCode::SUCCESS,
    Err(e) => {
      eprintln!("error: {:#}", e);
      ExitCode::FAILURE
    }
  }
}

fn init_tracing(level: &str) {
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(std::io::stderr)
    .init();
}

async fn run(cli: Cli) -> Result<()> {
  let state_path = match cli.emulator_state {
    Some(path) => path,
    None => dirs::home_dir()
      .context("could not determine home directory")?
      .join(".vmport")
      .join("emulator.json"),
  };
  let cloud = open_emulator(&state_path).await?;
  let state = cloud.state();
  let project = cli.project.clone().unwrap_or(state.project);
  let zone = cli.zone.clone().unwrap_or(state.zone);

  let token = CancellationToken::new();
  let interrupt = token.clone();
  tokio::spawn(async move {
    if tokio::signal::ctrl_c().await.is_ok() {
      warn!("interrupted, cancelling");
      interrupt.cancel();
    }
  });

  let result = match cli.command {
    Commands::Import(cmd) => import(&cloud, project, zone, cmd, &token).await,
    Commands::Export(cmd) => export(&cloud, project, zone, cmd, &token).await,
    // Left unset, the upgrade asks the metadata server.
    Commands::Upgrade(cmd) => upgrade(&cloud, cli.project, cli.zone, cmd, &token).await,
    Commands::Run(cmd) => run_workflows(&cloud, project, zone, cmd, &token).await,
  };

  cloud
    .save(&state_path)
    .await
    .with_context(|| format!("failed to save emulator state to {}", state_path.display()))?;
  result
}

/// Load the emulator, or create one with the worker and install media
/// images the bundled workflows boot from.
async fn open_emulator(path: &Path) -> Result<EmulatorCloud> {
  if tokio::fs::try_exists(path).await.unwrap_or(false) {
    return EmulatorCloud::load(path)
      .await
      .with_context(|| format!("failed to load emulator state from {}", path.display()));
  }
  if let Some(parent) = path.parent() {
    tokio::fs::create_dir_all(parent)
      .await
      .with_context(|| format!("failed to create {}", parent.display()))?;
  }
  info!(path = %path.display(), "creating emulator state");

  let cloud = EmulatorCloud::from_state(EmulatorState {
    project: "vmport-project".to_string(),
    zone: "us-central1-a".to_string(),
    on_gce: true,
    zones: vec!["us-central1-a".to_string()],
    networks: vec!["default".to_string()],
    ..Default::default()
  });
  for (name, family) in [
    ("debian-11-worker-v20240101", "debian-11-worker"),
    ("windows-install-media-v20240101", "windows-install-media"),
  ] {
    cloud.add_image(
      "compute-image-tools",
      Image {
        name: name.to_string(),
        family: Some(family.to_string()),
        ..Default::default()
      },
    );
  }
  Ok(cloud)
}

fn labels(common: &CommonArgs) -> Result<BTreeMap<String, String>> {
  if common.labels.is_empty() {
    return Ok(BTreeMap::new());
  }
  parse_labels(&common.labels).context("invalid --labels")
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
  println!("{}", serde_json::to_string_pretty(value)?);
  Ok(())
}

async fn import(
  cloud: &EmulatorCloud,
  project: String,
  zone: String,
  cmd: ImportCommand,
  token: &CancellationToken,
) -> Result<()> {
  let source = ImportSource::from_flags(cmd.source_file.as_deref(), cmd.source_image.as_deref())?;
  let mut args = ImportArgs::new(project, zone, cmd.image_name, source);
  args.os = cmd.os;
  args.data_disk = cmd.data_disk;
  args.custom_workflow = cmd.custom_translate_workflow;
  args.uefi_compatible = cmd.uefi_compatible;
  args.inspect = !cmd.no_inspect;
  args.family = cmd.family;
  args.description = cmd.description;
  args.storage_location = cmd.storage_location;
  args.labels = labels(&cmd.common)?;
  args.network = cmd.common.network;
  args.subnet = cmd.common.subnet;
  args.no_external_ip = cmd.common.no_external_ip;
  args.inflation_method = cmd.inflation_method.parse::<InflationMethod>()?;
  if let Some(timeout) = cmd.common.timeout {
    args.timeout = timeout;
  }
  if let Some(dir) = cmd.workflow_dir {
    args.workflow_dir = dir;
  }

  let ctx = ImportContext::new(args, cloud.clients());
  let importer = Importer::with_parent(ctx, token);
  let outcome = importer.run().await.context("import failed")?;
  print_json(&outcome)
}

async fn export(
  cloud: &EmulatorCloud,
  project: String,
  zone: String,
  cmd: ExportCommand,
  token: &CancellationToken,
) -> Result<()> {
  let source = ExportSource::from_flags(
    cmd.source_disk.as_deref(),
    cmd.source_image.as_deref(),
    cmd.instance_name.as_deref(),
  )?;
  let mut args = ExportArgs::new(project, zone, source, cmd.destination_uri);
  args.format = cmd.format;
  args.labels = labels(&cmd.common)?;
  args.network = cmd.common.network;
  args.subnet = cmd.common.subnet;
  args.no_external_ip = cmd.common.no_external_ip;
  if let Some(timeout) = cmd.common.timeout {
    args.timeout = timeout;
  }

  let exporter = Exporter::new(args, cloud.clients()).with_parent(token);
  let outcome = exporter.run().await.context("export failed")?;
  print_json(&outcome)
}

async fn upgrade(
  cloud: &EmulatorCloud,
  project: Option<String>,
  zone: Option<String>,
  cmd: UpgradeCommand,
  token: &CancellationToken,
) -> Result<()> {
  let mut args = UpgradeArgs::new(cmd.instance);
  args.project = project;
  args.zone = zone;
  args.source_os = cmd.source_os;
  args.target_os = cmd.target_os;
  args.auto_rollback = cmd.auto_rollback;
  args.create_machine_backup = cmd.create_machine_backup;
  args.install_media_image = cmd.install_media_image;
  if let Some(timeout) = cmd.timeout {
    args.timeout = timeout;
  }

  let clients = cloud.clients();
  let runner = Arc::new(WorkflowPhaseRunner::new(clients.compute.clone(), args.timeout));
  let upgrader = Upgrader::new(args, clients, runner).with_parent(token);
  let outcome = upgrader.run().await.context("upgrade failed")?;
  print_json(&outcome)
}

async fn run_workflows(
  cloud: &EmulatorCloud,
  project: String,
  zone: String,
  cmd: RunCommand,
  token: &CancellationToken,
) -> Result<()> {
  if cmd.parallel == 0 {
    bail!("--parallel must be at least 1");
  }
  let mut vars: BTreeMap<String, String> = cmd.vars.into_iter().collect();
  vars
    .entry("build_id".to_string())
    .or_insert_with(build_id);
  let options = LoadOptions {
    project: Some(project),
    zone: Some(zone),
    vars,
    ignore_unknown_vars: true,
  };

  let semaphore = Arc::new(Semaphore::new(cmd.parallel));
  let mut handles = Vec::new();
  for path in cmd.workflow_files {
    let workflow = load_workflow(&path, &options)
      .with_context(|| format!("failed to load {}", path.display()))?;
    let semaphore = semaphore.clone();
    let executor = WorkflowExecutor::new(cloud.clients().compute, ExecutorConfig::default());
    let token = token.child_token();
    handles.push(tokio::spawn(async move {
      let _permit = semaphore.acquire_owned().await;
      info!(workflow = %workflow.name, path = %path.display(), "running workflow");
      let result = executor.run(&workflow, token).await;
      (path, result)
    }));
  }

  let mut failed = 0;
  let mut results = serde_json::Map::new();
  for handle in handles {
    let (path, result) = handle.await.map_err(|e| anyhow!("workflow task failed: {}", e))?;
    let key = path.display().to_string();
    match result {
      Ok(outcome) => {
        info!(path = %key, "workflow finished");
        results.insert(
          key,
          serde_json::json!({
            "status": "succeeded",
            "serialValues": outcome.serial_values,
          }),
        );
      }
      Err(e) => {
        error!(path = %key, error = %e, "workflow failed");
        failed += 1;
        results.insert(
          key,
          serde_json::json!({
            "status": "failed",
            "error": e.to_string(),
          }),
        );
      }
    }
  }
  print_json(&results)?;
  if failed > 0 {
    bail!("{} of {} workflows failed", failed, results.len());
  }
  Ok(())
}
