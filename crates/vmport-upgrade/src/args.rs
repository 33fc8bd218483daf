//! Upgrade arguments, supported upgrade paths and instance resolution.

use std::fmt;
use std::time::Duration;

use vmport_compute::MetadataClient;
use vmport_compute::path::{ZonalResource, instance_uri};
use vmport_workflow_utils::build_id;

use crate::error::UpgradeError;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(90 * 60);

/// One supported in-place upgrade.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpgradePath {
  pub source_os: &'static str,
  pub target_os: &'static str,
  /// License the boot disk must carry before the upgrade.
  pub source_license: &'static str,
  /// License attached to the new OS disk. Its presence means the disk has
  /// already been upgraded.
  pub upgraded_license: &'static str,
  pub install_media_image: &'static str,
  /// Printed on COM3 once the target version is running.
  pub success_marker: &'static str,
}

pub const UPGRADE_PATHS: &[UpgradePath] = &[UpgradePath {
  source_os: "windows-2008r2",
  target_os: "windows-2012r2",
  source_license: "projects/windows-cloud/global/licenses/windows-server-2008-r2-dc",
  upgraded_license: "projects/windows-cloud/global/licenses/windows-server-2012-r2-dc-in-place-upgrade",
  install_media_image: "projects/compute-image-tools/global/images/family/windows-install-media",
  success_marker: "windows_upgrade_current_version=6.3",
}];

pub fn upgrade_path(source_os: &str, target_os: &str) -> Result<&'static UpgradePath, UpgradeError> {
  UPGRADE_PATHS
    .iter()
    .find(|p| p.source_os == source_os && p.target_os == target_os)
    .ok_or_else(|| {
      let supported: Vec<String> = UPGRADE_PATHS
        .iter()
        .map(|p| format!("{} -> {}", p.source_os, p.target_os))
        .collect();
      UpgradeError::invalid(format!(
        "upgrading from {} to {} is not supported; supported upgrades: {}",
        source_os,
        target_os,
        supported.join(", ")
      ))
    })
}

#[derive(Debug, Clone)]
pub struct UpgradeArgs {
  /// Defaults to the instance URI, then the metadata server.
  pub project: Option<String>,
  pub zone: Option<String>,
  /// Instance name or URI.
  pub instance: String,
  pub source_os: String,
  pub target_os: String,
  /// Take a machine image of the instance before touching it.
  pub create_machine_backup: bool,
  /// Put the original OS disk back when the upgrade fails.
  pub auto_rollback: bool,
  /// Overrides the install media of the upgrade path.
  pub install_media_image: Option<String>,
  /// Applies to each wait for the upgrade to finish.
  pub timeout: Duration,
  pub build_id: String,
}

impl UpgradeArgs {
  pub fn new(instance: impl Into<String>) -> Self {
    let path = &UPGRADE_PATHS[0];
    Self {
      project: None,
      zone: None,
      instance: instance.into(),
      source_os: path.source_os.to_string(),
      target_os: path.target_os.to_string(),
      create_machine_backup: true,
      auto_rollback: false,
      install_media_image: None,
      timeout: DEFAULT_TIMEOUT,
      build_id: build_id(),
    }
  }

  pub fn validate(&self) -> Result<&'static UpgradePath, UpgradeError> {
    if self.instance.is_empty() {
      return Err(UpgradeError::invalid("an instance must be specified"));
    }
    if self.instance.contains('/') && ZonalResource::parse(&self.instance, "instances").is_none() {
      return Err(UpgradeError::invalid(format!(
        "{} is not a valid instance; expected a name or projects/<project>/zones/<zone>/instances/<name>",
        self.instance
      )));
    }
    if self.timeout.is_zero() {
      return Err(UpgradeError::invalid("the timeout must be positive"));
    }
    upgrade_path(&self.source_os, &self.target_os)
  }

  /// Resolve the instance to a full reference. Missing project or zone come
  /// from the metadata server when running on GCE.
  pub async fn resolve_instance(
    &self,
    metadata: &dyn MetadataClient,
  ) -> Result<InstanceRef, UpgradeError> {
    if let Some(r) = ZonalResource::parse(&self.instance, "instances") {
      return Ok(InstanceRef {
        project: r.project,
        zone: r.zone,
        name: r.name,
      });
    }

    let on_gce = metadata.on_gce().await;
    let project = match &self.project {
      Some(project) => project.clone(),
      None if on_gce => metadata
        .project_id()
        .await
        .map_err(|e| UpgradeError::api("metadata project id", &self.instance, e))?,
      None => {
        return Err(UpgradeError::invalid(
          "project is required when the instance is not a URI and not running on GCE",
        ));
      }
    };
    let zone = match &self.zone {
      Some(zone) => zone.clone(),
      None if on_gce => metadata
        .zone()
        .await
        .map_err(|e| UpgradeError::api("metadata zone", &self.instance, e))?,
      None => {
        return Err(UpgradeError::invalid(
          "zone is required when the instance is not a URI and not running on GCE",
        ));
      }
    };
    Ok(InstanceRef {
      project,
      zone,
      name: self.instance.clone(),
    })
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceRef {
  pub project: String,
  pub zone: String,
  pub name: String,
}

impl InstanceRef {
  pub fn uri(&self) -> String {
    instance_uri(&self.project, &self.zone, &self.name)
  }
}

impl fmt::Display for InstanceRef {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.uri())
  }
}

#[cfg(test)]
mod tests {
  use vmport_compute::EmulatorCloud;

  use super::*;

  #[test]
  fn test_unsupported_path() {
    let mut args = UpgradeArgs::new("vm");
    args.target_os = "windows-2016".to_string();
    let err = args.validate().unwrap_err();
    assert!(err.to_string().contains("windows-2008r2 -> windows-2012r2"));
  }

  #[test]
  fn test_malformed_instance_uri() {
    assert!(UpgradeArgs::new("projects/p/instances/vm").validate().is_err());
    assert!(UpgradeArgs::new("").validate().is_err());
    assert!(UpgradeArgs::new("projects/p/zones/z/instances/vm").validate().is_ok());
  }

  #[tokio::test]
  async fn test_uri_wins_over_flags() {
    let cloud = EmulatorCloud::new("meta-project", "meta-zone");
    let mut args = UpgradeArgs::new("projects/p/zones/z/instances/vm");
    args.project = Some("other".to_string());
    let r = args.resolve_instance(&cloud).await.unwrap();
    assert_eq!(r.uri(), "projects/p/zones/z/instances/vm");
  }

  #[tokio::test]
  async fn test_name_needs_project_off_gce() {
    let cloud = EmulatorCloud::new("meta-project", "meta-zone");
    cloud.set_on_gce(false);
    let args = UpgradeArgs::new("vm");
    assert!(args.resolve_instance(&cloud).await.is_err());

    cloud.set_on_gce(true);
    let r = args.resolve_instance(&cloud).await.unwrap();
    assert_eq!(r.project, "meta-project");
    assert_eq!(r.zone, "meta-zone");

    let mut explicit = UpgradeArgs::new("vm");
    explicit.zone = Some("z".to_string());
    let r = explicit.resolve_instance(&cloud).await.unwrap();
    assert_eq!(r.zone, "z");
    assert_eq!(r.project, "meta-project");
  }
}
