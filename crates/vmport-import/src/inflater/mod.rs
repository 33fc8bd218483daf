//! Inflation: turning the import source into a persistent disk.
//!
//! [`WorkflowInflater`] runs a worker instance that converts a disk file
//! (or simply clones an image). [`ApiInflater`] has the disks API read the
//! file directly and then computes a checksum of the result on a worker.

mod api;
mod workflow;

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use vmport_compute::{AttachedDisk, Disk, GuestOsFeature, Instance};
use vmport_workflow_executor::RunOutcome;

pub use api::{
  ApiInflater, CHECKSUM_FAILURE_MATCH, CHECKSUM_KEY, CHECKSUM_SCRIPT, CHECKSUM_SUCCESS_MATCH,
};
pub use workflow::{
  FAILURE_MATCH, FILE_FORMAT_KEY, IMPORT_SCRIPT, METADATA_SCRIPT_FAILURE, SOURCE_SIZE_KEY,
  STATUS_MATCH, SUCCESS_MATCH, TARGET_SIZE_KEY, WorkflowInflater,
};

use crate::args::{ImportSource, InflationMethod};
use crate::context::ImportContext;
use crate::disk::PersistentDisk;
use crate::error::ImportError;

pub(crate) const GIB: u64 = 1 << 30;

#[async_trait]
pub trait Inflater: Send + Sync {
  async fn inflate(&self) -> Result<PersistentDisk, ImportError>;

  /// Request cancellation. Returns `false` when the inflater is inside a
  /// call that cannot be interrupted.
  fn cancel(&self, reason: &str) -> bool;

  fn trace_logs(&self) -> Vec<String>;
}

/// Pick the inflater for the import's source and method.
pub fn create_inflater(ctx: &ImportContext, cancel: &CancellationToken) -> Box<dyn Inflater> {
  match (&ctx.args.source, ctx.args.inflation_method) {
    (ImportSource::File(_), InflationMethod::Api) => Box::new(ApiInflater::new(ctx.clone(), cancel)),
    _ => Box::new(WorkflowInflater::new(ctx.clone(), cancel)),
  }
}

/// Guest OS features the inflated disk is created with.
pub(crate) fn disk_features(ctx: &ImportContext) -> Vec<GuestOsFeature> {
  if ctx.args.is_windows() {
    vec![GuestOsFeature::Windows]
  } else {
    Vec::new()
  }
}

pub(crate) fn worker_boot_disk(ctx: &ImportContext, name: &str) -> Disk {
  Disk {
    name: name.to_string(),
    source_image: Some(ctx.args.worker_image.clone()),
    disk_type: Some("pd-ssd".to_string()),
    ..Default::default()
  }
}

pub(crate) fn worker_instance(
  name: &str,
  disks: Vec<AttachedDisk>,
  metadata: BTreeMap<String, String>,
) -> Instance {
  Instance {
    name: name.to_string(),
    machine_type: Some("n1-standard-4".to_string()),
    disks,
    metadata,
    scopes: vec!["https://www.googleapis.com/auth/devstorage.read_write".to_string()],
    ..Default::default()
  }
}

pub(crate) fn attach(source: &str, boot: bool, auto_delete: bool) -> AttachedDisk {
  AttachedDisk {
    source: source.to_string(),
    boot,
    auto_delete,
    ..Default::default()
  }
}

/// Read a required numeric serial value.
pub(crate) fn serial_number(
  outcome: &RunOutcome,
  stage: &'static str,
  key: &str,
) -> Result<i64, ImportError> {
  let value = outcome
    .serial_values
    .get(key)
    .ok_or_else(|| ImportError::MissingValue {
      stage,
      key: key.to_string(),
    })?;
  value.trim().parse().map_err(|_| ImportError::InvalidValue {
    stage,
    key: key.to_string(),
    value: value.clone(),
  })
}
