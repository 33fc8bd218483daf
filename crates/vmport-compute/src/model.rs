//! Cloud resource model.
//!
//! These types mirror the subset of the compute and storage APIs that the
//! workflows touch. They serialize with the API's camelCase field names so
//! workflow files and emulator state can embed them directly.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// An immutable tag on a disk or image consumed by the platform at boot time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GuestOsFeature {
  UefiCompatible,
  Windows,
  VirtioScsiMultiqueue,
  MultiIpSubnet,
  SecureBoot,
  Gvnic,
}

impl GuestOsFeature {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::UefiCompatible => "UEFI_COMPATIBLE",
      Self::Windows => "WINDOWS",
      Self::VirtioScsiMultiqueue => "VIRTIO_SCSI_MULTIQUEUE",
      Self::MultiIpSubnet => "MULTI_IP_SUBNET",
      Self::SecureBoot => "SECURE_BOOT",
      Self::Gvnic => "GVNIC",
    }
  }
}

impl fmt::Display for GuestOsFeature {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Adds `feature` to `features` unless it is already present.
pub fn add_guest_os_feature(features: &mut Vec<GuestOsFeature>, feature: GuestOsFeature) {
  if !features.contains(&feature) {
    features.push(feature);
  }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Disk {
  pub name: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub size_gb: Option<i64>,
  #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
  pub disk_type: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub source_image: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub source_disk: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub source_snapshot: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub source_storage_object: Option<String>,
  #[serde(skip_serializing_if = "Vec::is_empty")]
  pub licenses: Vec<String>,
  #[serde(skip_serializing_if = "Vec::is_empty")]
  pub guest_os_features: Vec<GuestOsFeature>,
  #[serde(skip_serializing_if = "BTreeMap::is_empty")]
  pub labels: BTreeMap<String, String>,
  #[serde(skip_serializing_if = "Vec::is_empty")]
  pub users: Vec<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub self_link: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AttachedDisk {
  /// Disk URI (or, inside workflow definitions, a disk name).
  pub source: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub device_name: Option<String>,
  pub boot: bool,
  pub auto_delete: bool,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub mode: Option<DiskMode>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DiskMode {
  ReadWrite,
  ReadOnly,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AccessConfig {
  pub name: String,
  #[serde(rename = "type")]
  pub access_type: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub nat_ip: Option<String>,
}

impl AccessConfig {
  /// The default one-to-one NAT config that gives an instance an external IP.
  pub fn external_nat() -> Self {
    Self {
      name: "External NAT".to_string(),
      access_type: "ONE_TO_ONE_NAT".to_string(),
      nat_ip: None,
    }
  }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NetworkInterface {
  #[serde(skip_serializing_if = "Option::is_none")]
  pub network: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub subnetwork: Option<String>,
  /// `None` means "use the platform default" (an external NAT), while
  /// `Some(vec![])` explicitly requests no external IP.
  #[serde(skip_serializing_if = "Option::is_none")]
  pub access_configs: Option<Vec<AccessConfig>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceStatus {
  Provisioning,
  Staging,
  #[default]
  Running,
  Stopping,
  Terminated,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Instance {
  pub name: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub machine_type: Option<String>,
  pub disks: Vec<AttachedDisk>,
  pub network_interfaces: Vec<NetworkInterface>,
  #[serde(skip_serializing_if = "BTreeMap::is_empty")]
  pub metadata: BTreeMap<String, String>,
  #[serde(skip_serializing_if = "BTreeMap::is_empty")]
  pub labels: BTreeMap<String, String>,
  #[serde(skip_serializing_if = "Vec::is_empty")]
  pub scopes: Vec<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub service_account: Option<String>,
  pub status: InstanceStatus,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub self_link: Option<String>,
}

impl Instance {
  /// The disk attached as the boot device, if any.
  pub fn boot_disk(&self) -> Option<&AttachedDisk> {
    self.disks.iter().find(|d| d.boot)
  }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Image {
  pub name: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub family: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub description: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub source_disk: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub source_image: Option<String>,
  #[serde(skip_serializing_if = "Vec::is_empty")]
  pub licenses: Vec<String>,
  #[serde(skip_serializing_if = "Vec::is_empty")]
  pub guest_os_features: Vec<GuestOsFeature>,
  #[serde(skip_serializing_if = "BTreeMap::is_empty")]
  pub labels: BTreeMap<String, String>,
  #[serde(skip_serializing_if = "Vec::is_empty")]
  pub storage_locations: Vec<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub disk_size_gb: Option<i64>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub self_link: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Snapshot {
  pub name: String,
  /// Disk the snapshot is taken from (name or URI).
  pub source_disk: String,
  #[serde(skip_serializing_if = "Vec::is_empty")]
  pub storage_locations: Vec<String>,
  #[serde(skip_serializing_if = "BTreeMap::is_empty")]
  pub labels: BTreeMap<String, String>,
  #[serde(skip_serializing_if = "Vec::is_empty")]
  pub licenses: Vec<String>,
  #[serde(skip_serializing_if = "Vec::is_empty")]
  pub guest_os_features: Vec<GuestOsFeature>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub disk_size_gb: Option<i64>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub self_link: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MachineImage {
  pub name: String,
  /// Instance the machine image is taken from (name or URI).
  pub source_instance: String,
  #[serde(skip_serializing_if = "Vec::is_empty")]
  pub storage_locations: Vec<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub self_link: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SerialPortOutput {
  pub contents: String,
  /// Offset to pass as `start` on the next poll.
  pub next: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineType {
  pub name: String,
  pub guest_cpus: i64,
  pub memory_mb: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectAttrs {
  pub bucket: String,
  pub name: String,
  pub size: u64,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub content_type: Option<String>,
}

/// Kinds of resources workflows create and delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
  Instance,
  Disk,
  Image,
  Snapshot,
  MachineImage,
}

impl fmt::Display for ResourceKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      Self::Instance => "instance",
      Self::Disk => "disk",
      Self::Image => "image",
      Self::Snapshot => "snapshot",
      Self::MachineImage => "machine image",
    };
    f.write_str(s)
  }
}
