//! Resource definitions carried by workflow steps.
//!
//! Each definition wraps the API model type with workflow metadata: optional
//! project/zone overrides and the `no_cleanup` flag that keeps a created
//! resource alive after the workflow exits.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use vmport_compute::{AttachedDisk, Disk, Image, Instance, MachineImage, Snapshot};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiskDef {
  #[serde(flatten)]
  pub disk: Disk,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub project: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub zone: Option<String>,
  #[serde(default)]
  pub no_cleanup: bool,
}

impl DiskDef {
  pub fn new(disk: Disk) -> Self {
    Self {
      disk,
      ..Default::default()
    }
  }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceDef {
  #[serde(flatten)]
  pub instance: Instance,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub project: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub zone: Option<String>,
  #[serde(default)]
  pub no_cleanup: bool,
}

impl InstanceDef {
  pub fn new(instance: Instance) -> Self {
    Self {
      instance,
      ..Default::default()
    }
  }
}

/// Whether an image is the published result of a run or a throwaway
/// intermediate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageKind {
  Final,
  Intermediate,
}

/// Name marker used by workflow files for images that have not been
/// translated yet.
pub const UNTRANSLATED_IMAGE_MARKER: &str = "untranslated";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageDef {
  #[serde(flatten)]
  pub image: Image,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub project: Option<String>,
  #[serde(default)]
  pub no_cleanup: bool,
  #[serde(default, rename = "imageKind", skip_serializing_if = "Option::is_none")]
  pub kind: Option<ImageKind>,
}

impl ImageDef {
  pub fn new(image: Image, kind: ImageKind) -> Self {
    Self {
      image,
      kind: Some(kind),
      ..Default::default()
    }
  }

  /// The explicit kind, or a guess from the image name for definitions that
  /// came from a workflow file without one.
  pub fn effective_kind(&self) -> ImageKind {
    match self.kind {
      Some(kind) => kind,
      None if self.image.name.contains(UNTRANSLATED_IMAGE_MARKER) => ImageKind::Intermediate,
      None => ImageKind::Final,
    }
  }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotDef {
  #[serde(flatten)]
  pub snapshot: Snapshot,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub project: Option<String>,
  /// Zone of the source disk when it is given by name.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub zone: Option<String>,
  #[serde(default)]
  pub no_cleanup: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineImageDef {
  #[serde(flatten)]
  pub machine_image: MachineImage,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub project: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub zone: Option<String>,
  #[serde(default)]
  pub no_cleanup: bool,
}

/// Attach `attached_disk` to `instance` (a name or URI).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachDiskDef {
  pub instance: String,
  pub attached_disk: AttachedDisk,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetachDiskDef {
  pub instance: String,
  pub device_name: String,
}

/// Merge `metadata` into an instance's metadata and drop the `remove` keys.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataUpdateDef {
  pub instance: String,
  #[serde(default)]
  pub metadata: BTreeMap<String, String>,
  #[serde(default)]
  pub remove: Vec<String>,
}

/// Resources removed by a delete step, as names or URIs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeleteResourcesDef {
  pub instances: Vec<String>,
  pub disks: Vec<String>,
  pub images: Vec<String>,
  pub snapshots: Vec<String>,
  pub machine_images: Vec<String>,
}

impl DeleteResourcesDef {
  pub fn is_empty(&self) -> bool {
    self.instances.is_empty()
      && self.disks.is_empty()
      && self.images.is_empty()
      && self.snapshots.is_empty()
      && self.machine_images.is_empty()
  }
}

/// Serial console patterns watched by a wait step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SerialOutputSignal {
  pub port: i64,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub success_match: Option<String>,
  #[serde(skip_serializing_if = "Vec::is_empty")]
  pub failure_match: Vec<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub status_match: Option<String>,
}

/// What a wait step waits for on one instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InstanceSignal {
  /// Instance name or URI.
  pub name: String,
  /// Succeed once the instance has stopped.
  pub stopped: bool,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub serial_output: Option<SerialOutputSignal>,
}

impl InstanceSignal {
  pub fn serial(name: impl Into<String>, signal: SerialOutputSignal) -> Self {
    Self {
      name: name.into(),
      stopped: false,
      serial_output: Some(signal),
    }
  }

  pub fn stopped(name: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      stopped: true,
      serial_output: None,
    }
  }
}
