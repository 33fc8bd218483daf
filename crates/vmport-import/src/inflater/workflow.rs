use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Instant;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};
use vmport_compute::path::disk_uri;
use vmport_compute::{Disk, GcsPath};
use vmport_workflow::{DiskDef, InstanceDef, InstanceSignal, SerialOutputSignal, StepKind, Workflow};
use vmport_workflow_executor::RunOutcome;
use vmport_workflow_utils::random_suffix;

use super::{GIB, Inflater, attach, disk_features, serial_number, worker_boot_disk, worker_instance};
use crate::args::ImportSource;
use crate::cancel::StageCancel;
use crate::context::ImportContext;
use crate::disk::PersistentDisk;
use crate::error::ImportError;

const STAGE: &str = "inflation";

pub const IMPORT_SCRIPT: &str = "import_image.sh";
pub const SUCCESS_MATCH: &str = "ImportSuccess";
pub const FAILURE_MATCH: &str = "ImportFailed:";
pub const STATUS_MATCH: &str = "Import:";
/// Printed by the guest agent when the startup script cannot be fetched.
pub const METADATA_SCRIPT_FAILURE: &str = "WARNING Failed to download metadata script";

pub const TARGET_SIZE_KEY: &str = "target-size-gb";
pub const SOURCE_SIZE_KEY: &str = "source-size-gb";
pub const FILE_FORMAT_KEY: &str = "import-file-format";

const MIN_DISK_SIZE_GB: i64 = 10;

/// Inflates by running a workflow: an image source is cloned into a disk,
/// a file source is converted by a worker instance.
pub struct WorkflowInflater {
  ctx: ImportContext,
  cancel: StageCancel,
  trace_logs: Mutex<Vec<String>>,
}

struct Plan {
  workflow: Workflow,
  disk_name: String,
}

impl WorkflowInflater {
  pub fn new(ctx: ImportContext, parent: &CancellationToken) -> Self {
    Self {
      ctx,
      cancel: StageCancel::child_of(parent),
      trace_logs: Mutex::new(Vec::new()),
    }
  }

  fn target_disk(&self, name: &str) -> Disk {
    Disk {
      name: name.to_string(),
      guest_os_features: disk_features(&self.ctx),
      disk_type: Some("pd-ssd".to_string()),
      ..Default::default()
    }
  }

  fn image_plan(&self, image: &str, suffix: &str) -> Result<Plan, ImportError> {
    let disk_name = format!("disk-{}", suffix);
    let mut workflow = self.ctx.new_workflow("inflate-image");
    workflow.force_cleanup_on_error = true;
    let mut disk = self.target_disk(&disk_name);
    disk.source_image = Some(image.to_string());

    let mut def = DiskDef::new(disk);
    def.no_cleanup = true;
    workflow
      .add_step("create-disk", StepKind::CreateDisks(vec![def]))
      .map_err(|e| ImportError::invalid(e.to_string()))?;
    Ok(Plan {
      workflow,
      disk_name,
    })
  }

  async fn file_plan(&self, source: &GcsPath, suffix: &str) -> Result<Plan, ImportError> {
    let attrs = self
      .ctx
      .clients
      .storage
      .get_object_attrs(&source.bucket, &source.object)
      .await
      .map_err(|e| ImportError::api("get_object_attrs", source.to_string(), e))?;
    let scratch_size = ((attrs.size.div_ceil(GIB)) as i64).max(MIN_DISK_SIZE_GB);

    let disk_name = format!("disk-{}", suffix);
    let worker_disk = format!("disk-importer-{}", suffix);
    let scratch_disk = format!("disk-importer-scratch-{}", suffix);
    let worker = format!("inst-importer-{}", suffix);

    let mut target = DiskDef::new(self.target_disk(&disk_name));
    target.no_cleanup = true;
    let scratch = DiskDef::new(Disk {
      name: scratch_disk.clone(),
      size_gb: Some(scratch_size),
      disk_type: Some("pd-ssd".to_string()),
      ..Default::default()
    });

    let metadata = BTreeMap::from([
      ("startup-script".to_string(), IMPORT_SCRIPT.to_string()),
      ("source_disk_file".to_string(), source.to_string()),
      ("scratch_disk_name".to_string(), scratch_disk.clone()),
      ("disk_name".to_string(), disk_name.clone()),
    ]);
    let instance = worker_instance(
      &worker,
      vec![
        attach(&worker_disk, true, true),
        attach(&scratch_disk, false, true),
        attach(&disk_name, false, false),
      ],
      metadata,
    );

    let signal = SerialOutputSignal {
      port: 1,
      success_match: Some(SUCCESS_MATCH.to_string()),
      failure_match: vec![FAILURE_MATCH.to_string(), METADATA_SCRIPT_FAILURE.to_string()],
      status_match: Some(STATUS_MATCH.to_string()),
    };

    let mut workflow = self.ctx.new_workflow("inflate-file");
    workflow.force_cleanup_on_error = true;
    let invalid = |e: vmport_workflow::WorkflowError| ImportError::invalid(e.to_string());
    workflow
      .add_step(
        "setup-disks",
        StepKind::CreateDisks(vec![
          DiskDef::new(worker_boot_disk(&self.ctx, &worker_disk)),
          scratch,
          target,
        ]),
      )
      .map_err(invalid)?;
    workflow
      .add_step(
        "import-virtual-disk",
        StepKind::CreateInstances(vec![InstanceDef::new(instance)]),
      )
      .map_err(invalid)?;
    workflow
      .add_step(
        "wait-for-signal",
        StepKind::WaitForInstancesSignal(vec![InstanceSignal::serial(&worker, signal)]),
      )
      .map_err(invalid)?;
    workflow.add_sequence(&["setup-disks", "import-virtual-disk", "wait-for-signal"]);

    Ok(Plan {
      workflow,
      disk_name,
    })
  }

  async fn describe(
    &self,
    disk_name: &str,
    uri: &str,
    outcome: &RunOutcome,
  ) -> Result<PersistentDisk, ImportError> {
    let args = &self.ctx.args;
    let disk = self
      .ctx
      .clients
      .compute
      .get_disk(&args.project, &args.zone, disk_name)
      .await
      .map_err(|e| ImportError::api("get_disk", disk_name, e))?;
    let live_size = disk.size_gb.unwrap_or(MIN_DISK_SIZE_GB);

    Ok(match &args.source {
      ImportSource::Image(_) => PersistentDisk {
        uri: uri.to_string(),
        size_gb: live_size,
        source_size_gb: live_size,
        source_type: "image".to_string(),
        ..Default::default()
      },
      ImportSource::File(_) => PersistentDisk {
        uri: uri.to_string(),
        size_gb: serial_number(outcome, STAGE, TARGET_SIZE_KEY)?,
        source_size_gb: serial_number(outcome, STAGE, SOURCE_SIZE_KEY)?,
        source_type: outcome
          .serial_values
          .get(FILE_FORMAT_KEY)
          .cloned()
          .or_else(|| args.source.file_format())
          .unwrap_or_default(),
        ..Default::default()
      },
    })
  }
}

#[async_trait]
impl Inflater for WorkflowInflater {
  #[instrument(name = "inflate", skip_all, fields(source = %self.ctx.args.source))]
  async fn inflate(&self) -> Result<PersistentDisk, ImportError> {
    let start = Instant::now();
    let args = &self.ctx.args;
    let suffix = random_suffix(8);
    let Plan {
      mut workflow,
      disk_name,
    } = match &args.source {
      ImportSource::Image(image) => self.image_plan(image, &suffix)?,
      ImportSource::File(path) => self.file_plan(path, &suffix).await?,
    };
    self.ctx.populate(&mut workflow);

    let uri = disk_uri(&args.project, &args.zone, &disk_name);
    let result = self.ctx.executor().run(&workflow, self.cancel.token()).await;
    let outcome = match result {
      Ok(outcome) => outcome,
      Err(e) => {
        // The target disk outlives the workflow's own cleanup.
        self.ctx.delete_disk(&uri).await;
        if e.is_cancelled() || self.cancel.is_cancelled() {
          return Err(self.cancel.error());
        }
        return Err(ImportError::Workflow {
          stage: STAGE,
          source: e,
        });
      }
    };
    self
      .trace_logs
      .lock()
      .unwrap()
      .extend(outcome.trace_logs.iter().cloned());

    let pd = match self.describe(&disk_name, &uri, &outcome).await {
      Ok(pd) => pd,
      Err(e) => {
        self.ctx.delete_disk(&uri).await;
        return Err(e);
      }
    };
    let pd = PersistentDisk {
      inflation_time: start.elapsed(),
      ..pd
    };

    info!(
      disk = %pd.uri,
      size_gb = pd.size_gb,
      source_type = %pd.source_type,
      elapsed = %humantime::format_duration(pd.inflation_time),
      "inflation complete"
    );
    Ok(pd)
  }

  fn cancel(&self, reason: &str) -> bool {
    self.cancel.cancel(reason);
    true
  }

  fn trace_logs(&self) -> Vec<String> {
    self.trace_logs.lock().unwrap().clone()
  }
}
