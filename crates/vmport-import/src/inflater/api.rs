use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Instant;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};
use vmport_compute::path::disk_uri;
use vmport_compute::{AttachedDisk, Disk, DiskMode, GcsPath};
use vmport_workflow::{DiskDef, InstanceDef, InstanceSignal, SerialOutputSignal, StepKind};
use vmport_workflow_utils::random_suffix;

use super::{GIB, Inflater, attach, disk_features, worker_boot_disk, worker_instance};
use crate::args::ImportSource;
use crate::cancel::StageCancel;
use crate::context::ImportContext;
use crate::disk::PersistentDisk;
use crate::error::ImportError;

const STAGE: &str = "checksum";

pub const CHECKSUM_SCRIPT: &str = "disk_checksum.sh";
pub const CHECKSUM_KEY: &str = "disk-checksum";
pub const CHECKSUM_SUCCESS_MATCH: &str = "Checksum calculated.";
pub const CHECKSUM_FAILURE_MATCH: &str = "Checksum calculation failed";

/// Inflates by creating the disk straight from the Cloud Storage object
/// (a shadow disk), then checksums it on a worker.
pub struct ApiInflater {
  ctx: ImportContext,
  cancel: StageCancel,
  in_api_call: Mutex<bool>,
  trace_logs: Mutex<Vec<String>>,
}

impl ApiInflater {
  pub fn new(ctx: ImportContext, parent: &CancellationToken) -> Self {
    Self {
      ctx,
      cancel: StageCancel::child_of(parent),
      in_api_call: Mutex::new(false),
      trace_logs: Mutex::new(Vec::new()),
    }
  }

  async fn create_shadow_disk(&self, source: &GcsPath, name: &str) -> Result<(), ImportError> {
    let args = &self.ctx.args;
    let disk = Disk {
      name: name.to_string(),
      source_storage_object: Some(source.to_string()),
      guest_os_features: disk_features(&self.ctx),
      disk_type: Some("pd-ssd".to_string()),
      ..Default::default()
    };

    *self.in_api_call.lock().unwrap() = true;
    let result = self
      .ctx
      .clients
      .compute
      .create_disk(&args.project, &args.zone, &disk)
      .await;
    *self.in_api_call.lock().unwrap() = false;
    result.map_err(|e| ImportError::api("create_disk", name, e))
  }

  /// Attach the shadow disk read-only to a worker and read back the
  /// checksum it prints.
  async fn checksum(&self, disk_uri: &str, suffix: &str) -> Result<String, ImportError> {
    let worker_disk = format!("disk-checksum-worker-{}", suffix);
    let worker = format!("inst-checksum-{}", suffix);

    let shadow = AttachedDisk {
      source: disk_uri.to_string(),
      mode: Some(DiskMode::ReadOnly),
      ..Default::default()
    };
    let metadata = BTreeMap::from([
      ("startup-script".to_string(), CHECKSUM_SCRIPT.to_string()),
      ("disk_uri".to_string(), disk_uri.to_string()),
    ]);
    let instance = worker_instance(&worker, vec![attach(&worker_disk, true, true), shadow], metadata);

    let signal = SerialOutputSignal {
      port: 1,
      success_match: Some(CHECKSUM_SUCCESS_MATCH.to_string()),
      failure_match: vec![CHECKSUM_FAILURE_MATCH.to_string()],
      status_match: Some("Checksum:".to_string()),
    };

    let mut workflow = self.ctx.new_workflow("disk-checksum");
    let invalid = |e: vmport_workflow::WorkflowError| ImportError::invalid(e.to_string());
    workflow
      .add_step(
        "create-worker-disk",
        StepKind::CreateDisks(vec![DiskDef::new(worker_boot_disk(&self.ctx, &worker_disk))]),
      )
      .map_err(invalid)?;
    workflow
      .add_step(
        "create-worker",
        StepKind::CreateInstances(vec![InstanceDef::new(instance)]),
      )
      .map_err(invalid)?;
    workflow
      .add_step(
        "wait-for-checksum",
        StepKind::WaitForInstancesSignal(vec![InstanceSignal::serial(&worker, signal)]),
      )
      .map_err(invalid)?;
    workflow.add_sequence(&["create-worker-disk", "create-worker", "wait-for-checksum"]);
    self.ctx.populate(&mut workflow);

    let outcome = match self.ctx.executor().run(&workflow, self.cancel.token()).await {
      Ok(outcome) => outcome,
      Err(e) if e.is_cancelled() || self.cancel.is_cancelled() => return Err(self.cancel.error()),
      Err(source) => return Err(ImportError::Workflow { stage: STAGE, source }),
    };
    self
      .trace_logs
      .lock()
      .unwrap()
      .extend(outcome.trace_logs.iter().cloned());
    outcome
      .serial_values
      .get(CHECKSUM_KEY)
      .cloned()
      .ok_or_else(|| ImportError::MissingValue {
        stage: STAGE,
        key: CHECKSUM_KEY.to_string(),
      })
  }
}

#[async_trait]
impl Inflater for ApiInflater {
  #[instrument(name = "inflate_api", skip_all, fields(source = %self.ctx.args.source))]
  async fn inflate(&self) -> Result<PersistentDisk, ImportError> {
    let start = Instant::now();
    let args = &self.ctx.args;
    let ImportSource::File(source) = &args.source else {
      return Err(ImportError::invalid(
        "the api inflation method requires a source file",
      ));
    };

    let attrs = self
      .ctx
      .clients
      .storage
      .get_object_attrs(&source.bucket, &source.object)
      .await
      .map_err(|e| ImportError::api("get_object_attrs", source.to_string(), e))?;
    let source_size_gb = attrs.size.div_ceil(GIB) as i64;

    let suffix = random_suffix(8);
    let name = format!("disk-{}", suffix);
    let uri = disk_uri(&args.project, &args.zone, &name);
    self.create_shadow_disk(source, &name).await?;
    if self.cancel.is_cancelled() {
      self.ctx.delete_disk(&uri).await;
      return Err(self.cancel.error());
    }

    let disk = match self
      .ctx
      .clients
      .compute
      .get_disk(&args.project, &args.zone, &name)
      .await
    {
      Ok(disk) => disk,
      Err(e) => {
        self.ctx.delete_disk(&uri).await;
        return Err(ImportError::api("get_disk", name, e));
      }
    };

    let checksum = if args.compute_checksum {
      match self.checksum(&uri, &suffix).await {
        Ok(checksum) => Some(checksum),
        Err(e) => {
          warn!(disk = %uri, error = %e, "checksum calculation failed");
          self.ctx.delete_disk(&uri).await;
          return Err(e);
        }
      }
    } else {
      None
    };

    let pd = PersistentDisk {
      uri,
      size_gb: disk.size_gb.unwrap_or(source_size_gb),
      source_size_gb,
      source_type: args.source.file_format().unwrap_or_default(),
      checksum,
      inflation_time: start.elapsed(),
      ..Default::default()
    };
    info!(
      disk = %pd.uri,
      size_gb = pd.size_gb,
      checksum = pd.checksum.as_deref().unwrap_or(""),
      "shadow disk created"
    );
    Ok(pd)
  }

  /// A disk create call in flight cannot be interrupted; report that
  /// instead of pretending.
  fn cancel(&self, reason: &str) -> bool {
    if *self.in_api_call.lock().unwrap() {
      return false;
    }
    self.cancel.cancel(reason);
    true
  }

  fn trace_logs(&self) -> Vec<String> {
    self.trace_logs.lock().unwrap().clone()
  }
}
