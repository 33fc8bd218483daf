//! Pre-flight validation and the names every phase works with.

use std::collections::BTreeMap;

use serde::Serialize;
use vmport_compute::path::resource_name;
use vmport_compute::{ComputeClient, Disk, Instance};

use crate::args::{InstanceRef, UpgradeArgs, UpgradePath};
use crate::error::UpgradeError;

/// Startup script the user may have configured; it must not run during the
/// upgrade.
pub const STARTUP_SCRIPT_URL_KEY: &str = "windows-startup-script-url";
pub const STARTUP_SCRIPT_URL_BACKUP_KEY: &str = "windows-startup-script-url-backup";
/// Carries the upgrade script itself.
pub const UPGRADE_SCRIPT_KEY: &str = "windows-startup-script-ps1";

const MAX_NAME_LEN: usize = 63;

/// Everything the phases need, fixed before the first phase runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DerivedVars {
  pub project: String,
  pub zone: String,
  pub instance_name: String,
  pub instance_uri: String,

  pub os_disk_uri: String,
  pub os_disk_name: String,
  pub os_disk_type: Option<String>,
  pub os_disk_device_name: String,
  pub os_disk_auto_delete: bool,

  /// `None` when no backup was requested.
  pub machine_image_backup_name: Option<String>,
  pub snapshot_name: String,
  pub new_os_disk_name: String,
  pub install_media_disk_name: String,

  pub upgraded_license: String,
  pub install_media_image: String,
  pub original_startup_script_url: Option<String>,
}

impl DerivedVars {
  /// Whether the instance boots from the disk prepared for the upgrade.
  pub fn new_os_disk_attached(&self, instance: &Instance) -> bool {
    instance
      .boot_disk()
      .is_some_and(|d| resource_name(&d.source) == self.new_os_disk_name)
  }
}

/// Check that `disk` is licensed for the upgrade and was not upgraded
/// already.
pub fn validate_license(disk: &Disk, path: &UpgradePath) -> Result<(), UpgradeError> {
  if disk.licenses.iter().any(|l| same_license(l, path.upgraded_license)) {
    return Err(UpgradeError::AlreadyUpgraded {
      disk: disk.name.clone(),
      target_os: path.target_os.to_string(),
    });
  }
  if !disk.licenses.iter().any(|l| same_license(l, path.source_license)) {
    return Err(UpgradeError::NoValidLicense {
      disk: disk.name.clone(),
      source_os: path.source_os.to_string(),
      license: path.source_license.to_string(),
    });
  }
  Ok(())
}

// License URIs may carry the compute API prefix.
fn same_license(license: &str, expected: &str) -> bool {
  license == expected || license.ends_with(&format!("/{}", expected))
}

/// The user's startup script URL. A backup left by an interrupted attempt
/// holds the real original; the live key then points at nothing useful.
pub fn original_startup_script_url(metadata: &BTreeMap<String, String>) -> Option<String> {
  metadata
    .get(STARTUP_SCRIPT_URL_BACKUP_KEY)
    .or_else(|| metadata.get(STARTUP_SCRIPT_URL_KEY))
    .cloned()
}

/// `<base>-<suffix>`, shortening `base` to stay a valid resource name.
pub(crate) fn generated_name(base: &str, suffix: &str) -> String {
  let room = MAX_NAME_LEN.saturating_sub(suffix.len() + 1);
  let base: String = base.chars().take(room).collect();
  format!("{}-{}", base.trim_end_matches('-'), suffix)
}

/// Validate the live instance and derive the phase variables.
pub async fn derive_vars(
  compute: &dyn ComputeClient,
  args: &UpgradeArgs,
  path: &UpgradePath,
  target: &InstanceRef,
  suffix: &str,
) -> Result<DerivedVars, UpgradeError> {
  let instance = compute
    .get_instance(&target.project, &target.zone, &target.name)
    .await
    .map_err(|e| UpgradeError::api("get_instance", target.uri(), e))?;
  let boot = instance
    .boot_disk()
    .ok_or_else(|| UpgradeError::NoBootDisk {
      instance: target.uri(),
    })?;
  let os_disk_name = resource_name(&boot.source).to_string();
  let disk = compute
    .get_disk(&target.project, &target.zone, &os_disk_name)
    .await
    .map_err(|e| UpgradeError::api("get_disk", boot.source.clone(), e))?;
  validate_license(&disk, path)?;

  Ok(DerivedVars {
    project: target.project.clone(),
    zone: target.zone.clone(),
    instance_name: target.name.clone(),
    instance_uri: target.uri(),

    os_disk_uri: boot.source.clone(),
    os_disk_type: disk.disk_type.as_deref().map(|t| resource_name(t).to_string()),
    os_disk_device_name: boot
      .device_name
      .clone()
      .unwrap_or_else(|| os_disk_name.clone()),
    os_disk_auto_delete: boot.auto_delete,

    machine_image_backup_name: args
      .create_machine_backup
      .then(|| generated_name(&format!("{}-backup", target.name), suffix)),
    snapshot_name: generated_name(&format!("{}-snapshot", os_disk_name), suffix),
    new_os_disk_name: generated_name(&format!("{}-{}", os_disk_name, path.target_os), suffix),
    install_media_disk_name: generated_name("windows-install-media", suffix),
    os_disk_name,

    upgraded_license: path.upgraded_license.to_string(),
    install_media_image: args
      .install_media_image
      .clone()
      .unwrap_or_else(|| path.install_media_image.to_string()),
    original_startup_script_url: original_startup_script_url(&instance.metadata),
  })
}
