//! Export orchestration.

use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};
use vmport_compute::path::{GlobalResource, ZonalResource, disk_uri, image_uri, resource_name};
use vmport_compute::{Clients, GcsPath, InstanceStatus};
use vmport_workflow::Workflow;
use vmport_workflow_executor::{
  ExecutionNotifier, ExecutorConfig, NoopNotifier, RunOutcome, WorkflowExecutor,
};
use vmport_workflow_utils::{
  NetworkSettings, ResourceLabeler, apply_no_external_ip, random_suffix,
};

use crate::args::{ExportArgs, ExportSource};
use crate::error::ExportError;
use crate::manifest::write_manifest;
use crate::workflows::{
  DiskExport, disk_export_workflow, image_export_workflow, multi_disk_export_workflow,
};

/// One file written by an export.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportedFile {
  pub source: String,
  pub destination: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportOutcome {
  pub files: Vec<ExportedFile>,
  /// Written for instance exports only.
  pub manifest: Option<String>,
  pub trace_logs: Vec<String>,
}

pub struct Exporter {
  args: Arc<ExportArgs>,
  clients: Clients,
  executor_config: ExecutorConfig,
  notifier: Arc<dyn ExecutionNotifier>,
  token: CancellationToken,
  reason: Mutex<Option<String>>,
  trace_logs: Mutex<Vec<String>>,
}

impl Exporter {
  pub fn new(args: ExportArgs, clients: Clients) -> Self {
    Self {
      args: Arc::new(args),
      clients,
      executor_config: ExecutorConfig::default(),
      notifier: Arc::new(NoopNotifier),
      token: CancellationToken::new(),
      reason: Mutex::new(None),
      trace_logs: Mutex::new(Vec::new()),
    }
  }

  /// Also stop when `parent` is cancelled.
  pub fn with_parent(mut self, parent: &CancellationToken) -> Self {
    self.token = parent.child_token();
    self
  }

  pub fn with_executor_config(mut self, config: ExecutorConfig) -> Self {
    self.executor_config = config;
    self
  }

  pub fn with_notifier(mut self, notifier: Arc<dyn ExecutionNotifier>) -> Self {
    self.notifier = notifier;
    self
  }

  /// Stop the export. Workers created so far are still removed before
  /// `run` returns.
  pub fn cancel(&self, reason: &str) -> bool {
    self
      .reason
      .lock()
      .unwrap()
      .get_or_insert_with(|| reason.to_string());
    self.token.cancel();
    true
  }

  pub fn trace_logs(&self) -> Vec<String> {
    self.trace_logs.lock().unwrap().clone()
  }

  #[instrument(
    name = "export",
    skip_all,
    fields(source = %self.args.source, destination = %self.args.destination)
  )]
  pub async fn run(&self) -> Result<ExportOutcome, ExportError> {
    self.args.validate()?;
    let timeout = self.args.timeout;

    let export = self.export();
    tokio::pin!(export);
    let result = tokio::select! {
      result = &mut export => result,
      _ = tokio::time::sleep(timeout) => {
        self.cancel("export timed out");
        let _ = export.await;
        Err(ExportError::Timeout { timeout })
      }
    };

    match result {
      Ok(outcome) => {
        info!(files = outcome.files.len(), "export finished");
        Ok(outcome)
      }
      Err(e) if self.token.is_cancelled() && !matches!(e, ExportError::Timeout { .. }) => {
        Err(self.cancelled())
      }
      Err(e) => {
        error!(error = %e, "export failed");
        Err(e)
      }
    }
  }

  async fn export(&self) -> Result<ExportOutcome, ExportError> {
    match &self.args.source {
      ExportSource::Disk(disk) => self.export_disk(disk).await,
      ExportSource::Image(image) => self.export_image(image).await,
      ExportSource::Instance(instance) => self.export_instance(instance).await,
    }
  }

  async fn export_disk(&self, disk: &str) -> Result<ExportOutcome, ExportError> {
    let args = &self.args;
    let (project, zone, name) = match ZonalResource::parse(disk, "disks") {
      Some(r) => (r.project, r.zone, r.name),
      None => (args.project.clone(), args.zone.clone(), disk.to_string()),
    };
    let live = self
      .clients
      .compute
      .get_disk(&project, &zone, &name)
      .await
      .map_err(|e| ExportError::api("get_disk", disk, e))?;

    let source = disk_uri(&project, &zone, &name);
    let export = DiskExport {
      source: source.clone(),
      destination: self.destination_object()?,
      format: args.disk_format().map(str::to_string),
      size_gb: live.size_gb.unwrap_or_default(),
    };
    let mut workflow = disk_export_workflow(
      &args.project,
      &args.zone,
      &args.worker_image,
      &random_suffix(8),
      &export,
      args.timeout,
    )?;
    self.execute(&mut workflow).await?;

    Ok(self.outcome(vec![ExportedFile {
      source,
      destination: export.destination.to_string(),
    }]))
  }

  async fn export_image(&self, image: &str) -> Result<ExportOutcome, ExportError> {
    let args = &self.args;
    let (project, name) = match GlobalResource::parse(image, "images") {
      Some(r) => (r.project, r.name),
      None => (args.project.clone(), resource_name(image).to_string()),
    };
    let live = self
      .clients
      .compute
      .get_image(&project, &name)
      .await
      .map_err(|e| ExportError::api("get_image", image, e))?;

    let source = image_uri(&project, &name);
    let export = DiskExport {
      source: String::new(),
      destination: self.destination_object()?,
      format: args.disk_format().map(str::to_string),
      size_gb: live.disk_size_gb.unwrap_or_default(),
    };
    let mut workflow = image_export_workflow(
      &args.project,
      &args.zone,
      &args.worker_image,
      &random_suffix(8),
      &source,
      &export,
      args.timeout,
    )?;
    self.execute(&mut workflow).await?;

    Ok(self.outcome(vec![ExportedFile {
      source,
      destination: export.destination.to_string(),
    }]))
  }

  /// Export every disk of a stopped instance into the destination folder
  /// and write a manifest next to them. A running instance is stopped for
  /// the export and started again afterwards, whatever the result.
  async fn export_instance(&self, name: &str) -> Result<ExportOutcome, ExportError> {
    let args = &self.args;
    let compute = &self.clients.compute;
    let instance = compute
      .get_instance(&args.project, &args.zone, name)
      .await
      .map_err(|e| ExportError::api("get_instance", name, e))?;
    let folder =
      GcsPath::parse(&args.destination).map_err(|e| ExportError::invalid(e.to_string()))?;
    let format = args.disk_format().unwrap_or_default().to_string();

    let mut exports = Vec::new();
    for attached in &instance.disks {
      let disk_name = resource_name(&attached.source).to_string();
      let disk = compute
        .get_disk(&args.project, &args.zone, &disk_name)
        .await
        .map_err(|e| ExportError::api("get_disk", disk_name.clone(), e))?;
      exports.push(DiskExport {
        source: attached.source.clone(),
        destination: folder.join(&format!("{}.{}", disk_name, format)),
        format: Some(format.clone()),
        size_gb: disk.size_gb.unwrap_or_default(),
      });
    }
    if exports.is_empty() {
      return Err(ExportError::invalid(format!(
        "instance {} has no disks to export",
        name
      )));
    }

    let was_running = instance.status == InstanceStatus::Running;
    if was_running {
      info!(instance = %name, "stopping instance for export");
      compute
        .stop_instance(&args.project, &args.zone, name)
        .await
        .map_err(|e| ExportError::api("stop_instance", name, e))?;
    }

    let result = self.export_instance_disks(name, &folder, &exports).await;

    if was_running {
      match compute.start_instance(&args.project, &args.zone, name).await {
        Ok(()) => info!(instance = %name, "restarted instance"),
        Err(e) => warn!(instance = %name, error = %e, "failed to restart instance"),
      }
    }
    result
  }

  async fn export_instance_disks(
    &self,
    name: &str,
    folder: &GcsPath,
    exports: &[DiskExport],
  ) -> Result<ExportOutcome, ExportError> {
    let args = &self.args;
    let mut workflow = multi_disk_export_workflow(
      &args.project,
      &args.zone,
      &args.worker_image,
      &random_suffix(8),
      exports,
      args.timeout,
    )?;
    self.execute(&mut workflow).await?;

    let manifest = write_manifest(
      self.clients.storage.as_ref(),
      folder,
      &format!("{}.mf", name),
    )
    .await?;
    let files = exports
      .iter()
      .map(|e| ExportedFile {
        source: e.source.clone(),
        destination: e.destination.to_string(),
      })
      .collect();
    Ok(ExportOutcome {
      manifest: Some(manifest.to_string()),
      ..self.outcome(files)
    })
  }

  fn destination_object(&self) -> Result<GcsPath, ExportError> {
    GcsPath::parse_object(&self.args.destination).map_err(|e| ExportError::invalid(e.to_string()))
  }

  fn populate(&self, workflow: &mut Workflow) {
    let args = &self.args;
    ResourceLabeler::for_export(&args.build_id, args.labels.clone()).label_resources(workflow);
    NetworkSettings::new(args.network.clone(), args.subnet.clone())
      .resolve(&args.project, &args.zone)
      .apply(workflow);
    if args.no_external_ip {
      apply_no_external_ip(workflow);
    }
  }

  async fn execute(&self, workflow: &mut Workflow) -> Result<RunOutcome, ExportError> {
    self.populate(workflow);
    let executor = WorkflowExecutor::new(self.clients.compute.clone(), self.executor_config.clone())
      .with_notifier(self.notifier.clone());
    match executor.run(workflow, self.token.clone()).await {
      Ok(outcome) => {
        self
          .trace_logs
          .lock()
          .unwrap()
          .extend(outcome.trace_logs.iter().cloned());
        Ok(outcome)
      }
      Err(e) if e.is_cancelled() || self.token.is_cancelled() => Err(self.cancelled()),
      Err(e) => Err(ExportError::Workflow(e)),
    }
  }

  fn outcome(&self, files: Vec<ExportedFile>) -> ExportOutcome {
    ExportOutcome {
      files,
      manifest: None,
      trace_logs: self.trace_logs(),
    }
  }

  fn cancelled(&self) -> ExportError {
    let reason = self
      .reason
      .lock()
      .unwrap()
      .clone()
      .unwrap_or_else(|| "cancelled by caller".to_string());
    ExportError::Cancelled { reason }
  }
}
