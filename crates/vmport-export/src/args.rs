//! Export arguments and their validation.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use vmport_compute::GcsPath;

use crate::error::ExportError;

/// Image the export workers boot from.
pub const WORKER_IMAGE: &str = "projects/compute-image-tools/global/images/family/debian-11-worker";

/// Formats the export worker can convert to. Without a format the disk is
/// exported as a raw `disk.raw` inside a gzipped tarball.
pub const EXPORT_FORMATS: &[&str] = &["vmdk", "vhdx", "vpc", "vdi", "qcow2"];

/// Format used for the disks of an exported instance.
pub const DEFAULT_INSTANCE_FORMAT: &str = "vmdk";

const RAW_SUFFIX: &str = ".tar.gz";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2 * 60 * 60);

/// What gets exported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExportSource {
  /// A disk name or URI.
  Disk(String),
  /// An image name or URI.
  Image(String),
  /// An instance name; every attached disk is exported.
  Instance(String),
}

impl ExportSource {
  /// Build the source from the mutually exclusive `--source-disk`,
  /// `--source-image` and `--instance-name` values.
  pub fn from_flags(
    disk: Option<&str>,
    image: Option<&str>,
    instance: Option<&str>,
  ) -> Result<Self, ExportError> {
    let given: Vec<Self> = [
      disk.map(|d| Self::Disk(d.to_string())),
      image.map(|i| Self::Image(i.to_string())),
      instance.map(|i| Self::Instance(i.to_string())),
    ]
    .into_iter()
    .flatten()
    .collect();
    match <[Self; 1]>::try_from(given) {
      Ok([source]) if !source.name().is_empty() => Ok(source),
      Ok(_) => Err(ExportError::invalid("the export source must not be empty")),
      Err(_) => Err(ExportError::invalid(
        "exactly one of source disk, source image or instance name must be specified",
      )),
    }
  }

  pub fn name(&self) -> &str {
    match self {
      Self::Disk(name) | Self::Image(name) | Self::Instance(name) => name,
    }
  }
}

impl fmt::Display for ExportSource {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Disk(name) => write!(f, "disk {}", name),
      Self::Image(name) => write!(f, "image {}", name),
      Self::Instance(name) => write!(f, "instance {}", name),
    }
  }
}

#[derive(Debug, Clone)]
pub struct ExportArgs {
  pub project: String,
  pub zone: String,
  pub source: ExportSource,
  /// An object for disk and image exports, a folder for instance exports.
  pub destination: String,
  pub format: Option<String>,
  pub labels: BTreeMap<String, String>,
  pub network: Option<String>,
  pub subnet: Option<String>,
  pub no_external_ip: bool,
  pub timeout: Duration,
  pub build_id: String,
  pub worker_image: String,
}

impl ExportArgs {
  pub fn new(
    project: impl Into<String>,
    zone: impl Into<String>,
    source: ExportSource,
    destination: impl Into<String>,
  ) -> Self {
    Self {
      project: project.into(),
      zone: zone.into(),
      source,
      destination: destination.into(),
      format: None,
      labels: BTreeMap::new(),
      network: None,
      subnet: None,
      no_external_ip: false,
      timeout: DEFAULT_TIMEOUT,
      build_id: vmport_workflow_utils::build_id(),
      worker_image: WORKER_IMAGE.to_string(),
    }
  }

  /// Reject inconsistent arguments before any resource is created.
  pub fn validate(&self) -> Result<(), ExportError> {
    if self.project.is_empty() {
      return Err(ExportError::invalid("project must be provided"));
    }
    if self.zone.is_empty() {
      return Err(ExportError::invalid("zone must be provided"));
    }
    if let Some(format) = self.format.as_deref() {
      if !EXPORT_FORMATS.contains(&format) {
        return Err(ExportError::invalid(format!(
          "format `{}` is invalid. Allowed values: {}",
          format,
          EXPORT_FORMATS.join(", ")
        )));
      }
    }

    match &self.source {
      ExportSource::Instance(_) => {
        GcsPath::parse(&self.destination).map_err(|e| ExportError::invalid(e.to_string()))?;
      }
      ExportSource::Disk(_) | ExportSource::Image(_) => {
        GcsPath::parse_object(&self.destination)
          .map_err(|e| ExportError::invalid(e.to_string()))?;
        if self.format.is_none() && !self.destination.ends_with(RAW_SUFFIX) {
          return Err(ExportError::invalid(format!(
            "destination must end with {} when no format is given",
            RAW_SUFFIX
          )));
        }
      }
    }

    if self.timeout.is_zero() {
      return Err(ExportError::invalid("timeout must be greater than zero"));
    }
    if self.labels.keys().any(|k| k.is_empty()) {
      return Err(ExportError::invalid("label keys must not be empty"));
    }
    Ok(())
  }

  /// The format disks are written in; `None` for raw tarballs.
  pub(crate) fn disk_format(&self) -> Option<&str> {
    match (&self.source, self.format.as_deref()) {
      (_, Some(format)) => Some(format),
      (ExportSource::Instance(_), None) => Some(DEFAULT_INSTANCE_FORMAT),
      _ => None,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn disk_args(destination: &str) -> ExportArgs {
    ExportArgs::new(
      "p",
      "us-central1-b",
      ExportSource::Disk("d".to_string()),
      destination,
    )
  }

  #[test]
  fn test_source_flags() {
    assert_eq!(
      ExportSource::from_flags(Some("d"), None, None).unwrap(),
      ExportSource::Disk("d".to_string())
    );
    assert_eq!(
      ExportSource::from_flags(None, None, Some("vm")).unwrap(),
      ExportSource::Instance("vm".to_string())
    );
    assert!(ExportSource::from_flags(None, None, None).is_err());
    assert!(ExportSource::from_flags(Some("d"), Some("i"), None).is_err());
    assert!(ExportSource::from_flags(None, Some(""), None).is_err());
  }

  #[test]
  fn test_raw_export_needs_tarball() {
    assert!(disk_args("gs://b/disk.tar.gz").validate().is_ok());
    assert!(disk_args("gs://b/disk.vmdk").validate().is_err());

    let mut args = disk_args("gs://b/disk.vmdk");
    args.format = Some("vmdk".to_string());
    assert!(args.validate().is_ok());
  }

  #[test]
  fn test_invalid_format_lists_allowed_values() {
    let mut args = disk_args("gs://b/disk.img");
    args.format = Some("iso".to_string());
    let err = args.validate().unwrap_err().to_string();
    assert!(err.contains("iso"));
    assert!(err.contains("qcow2"));
  }

  #[test]
  fn test_instance_export_goes_to_folder() {
    let args = ExportArgs::new(
      "p",
      "z",
      ExportSource::Instance("vm".to_string()),
      "gs://bucket/exports/",
    );
    assert!(args.validate().is_ok());
    assert_eq!(args.disk_format(), Some("vmdk"));
    assert!(disk_args("gs://bucket/").validate().is_err());
    assert_eq!(disk_args("gs://b/d.tar.gz").disk_format(), None);
  }
}
