//! Import arguments and their validation.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use vmport_compute::GcsPath;
use vmport_workflow_utils::os;

use crate::error::ImportError;

/// Image the conversion and checksum workers boot from.
pub const WORKER_IMAGE: &str = "projects/compute-image-tools/global/images/family/debian-11-worker";

/// The translate workflows shipped with this crate.
pub fn bundled_workflow_dir() -> PathBuf {
  PathBuf::from(concat!(env!("CARGO_MANIFEST_DIR"), "/workflows"))
}

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2 * 60 * 60);

/// Where the disk content comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImportSource {
  /// A disk file in Cloud Storage, in any format the worker can convert.
  File(GcsPath),
  /// An existing image.
  Image(String),
}

impl ImportSource {
  /// Build the source from the mutually exclusive `--source-file` and
  /// `--source-image` values.
  pub fn from_flags(file: Option<&str>, image: Option<&str>) -> Result<Self, ImportError> {
    match (file, image) {
      (Some(file), None) => {
        let path = GcsPath::parse_object(file).map_err(|e| ImportError::invalid(e.to_string()))?;
        Ok(Self::File(path))
      }
      (None, Some(image)) if !image.is_empty() => Ok(Self::Image(image.to_string())),
      (Some(_), Some(_)) => Err(ImportError::invalid(
        "either source file or source image must be specified, not both",
      )),
      _ => Err(ImportError::invalid(
        "either source file or source image must be specified",
      )),
    }
  }

  /// File extension of a file source, e.g. `vmdk`.
  pub fn file_format(&self) -> Option<String> {
    match self {
      Self::File(path) => path
        .object
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_lowercase())
        .filter(|ext| !ext.contains('/')),
      Self::Image(_) => None,
    }
  }
}

impl fmt::Display for ImportSource {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::File(path) => write!(f, "{}", path),
      Self::Image(image) => write!(f, "{}", image),
    }
  }
}

/// How the source is turned into a persistent disk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum InflationMethod {
  /// Convert on a worker instance.
  #[default]
  Workflow,
  /// Let the disks API read the file directly.
  Api,
}

impl FromStr for InflationMethod {
  type Err = ImportError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "workflow" | "daisy" => Ok(Self::Workflow),
      "api" => Ok(Self::Api),
      other => Err(ImportError::invalid(format!(
        "inflation method `{}` is invalid. Allowed values: workflow, api",
        other
      ))),
    }
  }
}

#[derive(Debug, Clone)]
pub struct ImportArgs {
  pub project: String,
  pub zone: String,
  pub image_name: String,
  pub source: ImportSource,
  /// Requested OS id; inspection decides when unset.
  pub os: Option<String>,
  pub data_disk: bool,
  /// Translate workflow to run instead of the OS-specific one.
  pub custom_workflow: Option<PathBuf>,
  pub uefi_compatible: bool,
  pub inspect: bool,
  pub family: Option<String>,
  pub description: Option<String>,
  pub labels: BTreeMap<String, String>,
  pub storage_location: Option<String>,
  pub network: Option<String>,
  pub subnet: Option<String>,
  pub no_external_ip: bool,
  pub timeout: Duration,
  /// Root of the OS translate workflows.
  pub workflow_dir: PathBuf,
  pub inflation_method: InflationMethod,
  /// Compute a checksum of API-inflated disks.
  pub compute_checksum: bool,
  pub build_id: String,
  pub worker_image: String,
}

impl ImportArgs {
  pub fn new(
    project: impl Into<String>,
    zone: impl Into<String>,
    image_name: impl Into<String>,
    source: ImportSource,
  ) -> Self {
    Self {
      project: project.into(),
      zone: zone.into(),
      image_name: image_name.into(),
      source,
      os: None,
      data_disk: false,
      custom_workflow: None,
      uefi_compatible: false,
      inspect: true,
      family: None,
      description: None,
      labels: BTreeMap::new(),
      storage_location: None,
      network: None,
      subnet: None,
      no_external_ip: false,
      timeout: DEFAULT_TIMEOUT,
      workflow_dir: bundled_workflow_dir(),
      inflation_method: InflationMethod::default(),
      compute_checksum: true,
      build_id: vmport_workflow_utils::build_id(),
      worker_image: WORKER_IMAGE.to_string(),
    }
  }

  /// Reject inconsistent arguments before any resource is created.
  pub fn validate(&self) -> Result<(), ImportError> {
    if self.project.is_empty() {
      return Err(ImportError::invalid("project must be provided"));
    }
    if self.zone.is_empty() {
      return Err(ImportError::invalid("zone must be provided"));
    }
    if self.image_name.is_empty() {
      return Err(ImportError::invalid("image name must be provided"));
    }

    let exclusive = [
      self.os.is_some(),
      self.data_disk,
      self.custom_workflow.is_some(),
    ];
    if exclusive.iter().filter(|set| **set).count() > 1 {
      return Err(ImportError::invalid(
        "os, data disk and custom translate workflow are mutually exclusive",
      ));
    }
    if let Some(os) = &self.os {
      os::validate_os(os)?;
    }
    if self
      .custom_workflow
      .as_ref()
      .is_some_and(|path| path.as_os_str().is_empty())
    {
      return Err(ImportError::invalid("custom translate workflow path is empty"));
    }

    if self.inflation_method == InflationMethod::Api && !matches!(self.source, ImportSource::File(_)) {
      return Err(ImportError::invalid(
        "the api inflation method requires a source file",
      ));
    }
    if self.timeout.is_zero() {
      return Err(ImportError::invalid("timeout must be greater than zero"));
    }
    if self.labels.keys().any(|k| k.is_empty()) {
      return Err(ImportError::invalid("label keys must not be empty"));
    }
    Ok(())
  }

  pub(crate) fn is_windows(&self) -> bool {
    self.os.as_deref().is_some_and(os::is_windows)
  }
}

/// Parse `key=value,key=value` into a map.
pub fn parse_labels(value: &str) -> Result<BTreeMap<String, String>, ImportError> {
  let mut labels = BTreeMap::new();
  for pair in value.split(',').map(str::trim).filter(|p| !p.is_empty()) {
    let (key, value) = pair
      .split_once('=')
      .ok_or_else(|| ImportError::invalid(format!("label `{}` is not of the form key=value", pair)))?;
    labels.insert(key.trim().to_string(), value.trim().to_string());
  }
  Ok(labels)
}

#[cfg(test)]
mod tests {
  use super::*;

  fn args() -> ImportArgs {
    ImportArgs::new(
      "p",
      "us-central1-b",
      "img",
      ImportSource::from_flags(Some("gs://bucket/disk.vmdk"), None).unwrap(),
    )
  }

  #[test]
  fn test_source_flags() {
    assert!(matches!(
      ImportSource::from_flags(None, Some("projects/p/global/images/i")).unwrap(),
      ImportSource::Image(_)
    ));
    assert!(ImportSource::from_flags(None, None).is_err());
    assert!(ImportSource::from_flags(Some("gs://b/f"), Some("i")).is_err());
    assert!(ImportSource::from_flags(Some("gs://bucket-only"), None).is_err());
  }

  #[test]
  fn test_file_format() {
    assert_eq!(args().source.file_format().as_deref(), Some("vmdk"));
    assert_eq!(ImportSource::Image("i".to_string()).file_format(), None);
  }

  #[test]
  fn test_validate() {
    assert!(args().validate().is_ok());

    let mut a = args();
    a.os = Some("ubuntu-1804".to_string());
    a.data_disk = true;
    assert!(matches!(a.validate(), Err(ImportError::InvalidArgs { .. })));

    let mut a = args();
    a.os = Some("beos".to_string());
    assert!(matches!(a.validate(), Err(ImportError::Os(_))));

    let mut a = args();
    a.source = ImportSource::Image("i".to_string());
    a.inflation_method = InflationMethod::Api;
    assert!(a.validate().is_err());

    let mut a = args();
    a.image_name.clear();
    assert!(a.validate().is_err());
  }

  #[test]
  fn test_parse_labels() {
    let labels = parse_labels("team=infra, env=prod").unwrap();
    assert_eq!(labels["team"], "infra");
    assert_eq!(labels["env"], "prod");
    assert!(parse_labels("").unwrap().is_empty());
    assert!(parse_labels("novalue").is_err());
  }
}
