//! The working disk handed from stage to stage.

use std::time::Duration;

use serde::Serialize;

/// A persistent disk produced by inflation.
///
/// Processors may replace the disk and return a handle with a new `uri`.
/// The handle does not own the disk; the importer deletes it once the
/// image is published or the import fails.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistentDisk {
  pub uri: String,
  pub size_gb: i64,
  pub source_size_gb: i64,
  /// Format of the source, e.g. `vmdk`, or `image` for image sources.
  pub source_type: String,
  pub checksum: Option<String>,
  pub is_uefi_detected: bool,
  pub is_uefi_compatible: bool,
  pub inflation_time: Duration,
}

