//! Workflows that copy disks out to Cloud Storage.
//!
//! Every exported disk gets its own worker: a boot disk, a buffer disk the
//! converted file is staged on, and an instance with the source disk
//! attached read-only. The worker prints `ExportSuccess` once the upload is
//! done.

use std::collections::BTreeMap;
use std::time::Duration;

use vmport_compute::{AttachedDisk, Disk, DiskMode, GcsPath, Instance};
use vmport_workflow::{
  DiskDef, InstanceDef, InstanceSignal, SerialOutputSignal, StepKind, Workflow, WorkflowError,
};

pub const EXPORT_SCRIPT: &str = "export_disk.sh";
pub const SUCCESS_MATCH: &str = "ExportSuccess";
pub const FAILURE_MATCH: &str = "ExportFailed:";
pub const STATUS_MATCH: &str = "Export:";
pub const METADATA_SCRIPT_FAILURE: &str = "WARNING Failed to download metadata script";

const MIN_BUFFER_SIZE_GB: i64 = 10;

/// One disk to export.
#[derive(Debug, Clone)]
pub struct DiskExport {
  /// Disk URI, or the name of a disk created earlier in the same workflow.
  pub source: String,
  pub destination: GcsPath,
  /// Target format; `None` writes a raw tarball.
  pub format: Option<String>,
  pub size_gb: i64,
}

/// First and last step of one disk's export chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportSteps {
  pub first: String,
  pub last: String,
}

pub fn worker_name(id: &str) -> String {
  format!("inst-export-disk-{}", id)
}

/// Add the steps exporting `export` to `workflow`. `id` keeps the names of
/// several exports in one workflow apart.
pub fn add_disk_export(
  workflow: &mut Workflow,
  worker_image: &str,
  id: &str,
  export: &DiskExport,
  timeout: Duration,
) -> Result<ExportSteps, WorkflowError> {
  let worker_disk = format!("disk-export-worker-{}", id);
  let buffer_disk = format!("disk-export-buffer-{}", id);
  let worker = worker_name(id);

  let disks = vec![
    DiskDef::new(Disk {
      name: worker_disk.clone(),
      source_image: Some(worker_image.to_string()),
      disk_type: Some("pd-ssd".to_string()),
      ..Default::default()
    }),
    DiskDef::new(Disk {
      name: buffer_disk.clone(),
      size_gb: Some(export.size_gb.max(MIN_BUFFER_SIZE_GB)),
      disk_type: Some("pd-ssd".to_string()),
      ..Default::default()
    }),
  ];

  let metadata = BTreeMap::from([
    ("startup-script".to_string(), EXPORT_SCRIPT.to_string()),
    ("gcs_path".to_string(), export.destination.to_string()),
    (
      "format".to_string(),
      export.format.clone().unwrap_or_else(|| "raw".to_string()),
    ),
    ("source_disk_device".to_string(), "source-disk".to_string()),
    ("buffer_disk_device".to_string(), "buffer-disk".to_string()),
  ]);
  let instance = Instance {
    name: worker.clone(),
    machine_type: Some("n1-standard-4".to_string()),
    disks: vec![
      AttachedDisk {
        source: worker_disk,
        boot: true,
        auto_delete: true,
        ..Default::default()
      },
      AttachedDisk {
        source: buffer_disk,
        device_name: Some("buffer-disk".to_string()),
        auto_delete: true,
        ..Default::default()
      },
      AttachedDisk {
        source: export.source.clone(),
        device_name: Some("source-disk".to_string()),
        mode: Some(DiskMode::ReadOnly),
        ..Default::default()
      },
    ],
    metadata,
    scopes: vec!["https://www.googleapis.com/auth/devstorage.read_write".to_string()],
    ..Default::default()
  };

  let signal = SerialOutputSignal {
    port: 1,
    success_match: Some(SUCCESS_MATCH.to_string()),
    failure_match: vec![FAILURE_MATCH.to_string(), METADATA_SCRIPT_FAILURE.to_string()],
    status_match: Some(STATUS_MATCH.to_string()),
  };

  let setup = format!("setup-disks-{}", id);
  let run = format!("run-export-{}", id);
  let wait = format!("wait-for-export-{}", id);
  workflow.add_step(&setup, StepKind::CreateDisks(disks))?;
  workflow.add_step(&run, StepKind::CreateInstances(vec![InstanceDef::new(instance)]))?;
  workflow
    .add_step(
      &wait,
      StepKind::WaitForInstancesSignal(vec![InstanceSignal::serial(&worker, signal)]),
    )?
    .timeout = Some(timeout);
  workflow.add_sequence(&[setup.as_str(), run.as_str(), wait.as_str()]);

  Ok(ExportSteps {
    first: setup,
    last: wait,
  })
}

/// Export an existing disk.
pub fn disk_export_workflow(
  project: &str,
  zone: &str,
  worker_image: &str,
  id: &str,
  export: &DiskExport,
  timeout: Duration,
) -> Result<Workflow, WorkflowError> {
  let mut workflow = Workflow::new("export-disk", project, zone);
  workflow.force_cleanup_on_error = true;
  add_disk_export(&mut workflow, worker_image, id, export, timeout)?;
  Ok(workflow)
}

/// Export an image: a temporary disk is created from it first and deleted
/// with the rest of the workers.
pub fn image_export_workflow(
  project: &str,
  zone: &str,
  worker_image: &str,
  id: &str,
  image: &str,
  export: &DiskExport,
  timeout: Duration,
) -> Result<Workflow, WorkflowError> {
  let mut workflow = Workflow::new("export-image", project, zone);
  workflow.force_cleanup_on_error = true;

  let disk_name = format!("disk-image-export-{}", id);
  workflow.add_step(
    "create-source-disk",
    StepKind::CreateDisks(vec![DiskDef::new(Disk {
      name: disk_name.clone(),
      source_image: Some(image.to_string()),
      disk_type: Some("pd-ssd".to_string()),
      ..Default::default()
    })]),
  )?;
  let export = DiskExport {
    source: disk_name,
    ..export.clone()
  };
  let steps = add_disk_export(&mut workflow, worker_image, id, &export, timeout)?;
  workflow.add_dependency(&steps.first, &["create-source-disk"]);
  Ok(workflow)
}

/// Export several disks at once, one worker each.
pub fn multi_disk_export_workflow(
  project: &str,
  zone: &str,
  worker_image: &str,
  id: &str,
  exports: &[DiskExport],
  timeout: Duration,
) -> Result<Workflow, WorkflowError> {
  let mut workflow = Workflow::new("export-instance-disks", project, zone);
  workflow.force_cleanup_on_error = true;
  for (i, export) in exports.iter().enumerate() {
    add_disk_export(&mut workflow, worker_image, &format!("{}-{}", id, i), export, timeout)?;
  }
  Ok(workflow)
}
