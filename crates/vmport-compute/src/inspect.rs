//! Disk inspection results.

use serde::{Deserialize, Serialize};

/// An operating system found on an inspected disk.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DetectedOs {
  /// Lowercase distribution name, e.g. `ubuntu`, `centos`, `windows`.
  pub distro: String,
  pub major_version: String,
  pub minor_version: String,
  pub architecture: String,
}

/// What the inspector learned about a disk.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InspectionResult {
  /// Number of operating systems found.
  pub os_count: u32,
  /// Set only when exactly one OS was found.
  pub os: Option<DetectedOs>,
  pub has_efi_partition: bool,
  pub uefi_bootable: bool,
  pub bios_bootable: bool,
}

impl InspectionResult {
  /// Bootable through both BIOS and UEFI.
  pub fn is_hybrid(&self) -> bool {
    self.uefi_bootable && self.bios_bootable
  }
}
