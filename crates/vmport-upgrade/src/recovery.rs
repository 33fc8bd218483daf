//! Instructions printed when the instance has to be fixed by hand.

use std::fmt::Write;

use crate::vars::{
  DerivedVars, STARTUP_SCRIPT_URL_BACKUP_KEY, STARTUP_SCRIPT_URL_KEY, UPGRADE_SCRIPT_KEY,
};

pub fn manual_rollback_steps(vars: &DerivedVars) -> String {
  let mut text = format!(
    "To roll back {} to its original OS disk manually:\n",
    vars.instance_uri
  );
  let steps = [
    format!("stop the instance {}", vars.instance_name),
    format!(
      "detach the upgraded OS disk {} (device name {})",
      vars.new_os_disk_name, vars.os_disk_device_name
    ),
    format!(
      "attach the original OS disk {} as the boot disk with device name {}{}",
      vars.os_disk_name,
      vars.os_disk_device_name,
      if vars.os_disk_auto_delete {
        " and auto-delete enabled"
      } else {
        ""
      }
    ),
    format!(
      "detach the install media disk {} if it is still attached",
      vars.install_media_disk_name
    ),
    startup_script_step(vars),
    format!(
      "delete the disks {} and {} once the instance works again",
      vars.new_os_disk_name, vars.install_media_disk_name
    ),
  ];
  push_steps(&mut text, &steps);
  push_backups(&mut text, vars);
  text
}

pub fn manual_cleanup_steps(vars: &DerivedVars) -> String {
  let mut text = format!(
    "To remove what the upgrade left behind on {}:\n",
    vars.instance_uri
  );
  let steps = [
    format!(
      "detach and delete the install media disk {} if it exists",
      vars.install_media_disk_name
    ),
    startup_script_step(vars),
  ];
  push_steps(&mut text, &steps);
  push_backups(&mut text, vars);
  text
}

fn startup_script_step(vars: &DerivedVars) -> String {
  match &vars.original_startup_script_url {
    Some(url) => format!(
      "remove the metadata keys {} and {} and set {} back to {}",
      UPGRADE_SCRIPT_KEY, STARTUP_SCRIPT_URL_BACKUP_KEY, STARTUP_SCRIPT_URL_KEY, url
    ),
    None => format!("remove the metadata key {}", UPGRADE_SCRIPT_KEY),
  }
}

fn push_steps(text: &mut String, steps: &[String]) {
  for (i, step) in steps.iter().enumerate() {
    let _ = writeln!(text, "  {}. {}", i + 1, step);
  }
}

fn push_backups(text: &mut String, vars: &DerivedVars) {
  let _ = write!(text, "The OS disk snapshot {} was kept", vars.snapshot_name);
  if let Some(backup) = &vars.machine_image_backup_name {
    let _ = write!(text, ", as was the machine image {}", backup);
  }
  text.push_str(". Delete them when they are no longer needed.\n");
}

#[cfg(test)]
mod tests {
  use super::*;

  fn vars() -> DerivedVars {
    DerivedVars {
      project: "p".to_string(),
      zone: "z".to_string(),
      instance_name: "win".to_string(),
      instance_uri: "projects/p/zones/z/instances/win".to_string(),
      os_disk_uri: "projects/p/zones/z/disks/win-boot".to_string(),
      os_disk_name: "win-boot".to_string(),
      os_disk_type: None,
      os_disk_device_name: "win-boot".to_string(),
      os_disk_auto_delete: false,
      machine_image_backup_name: None,
      snapshot_name: "win-boot-snapshot-s".to_string(),
      new_os_disk_name: "win-boot-windows-2012r2-s".to_string(),
      install_media_disk_name: "windows-install-media-s".to_string(),
      upgraded_license: "l".to_string(),
      install_media_image: "media".to_string(),
      original_startup_script_url: Some("gs://b/user.ps1".to_string()),
    }
  }

  #[test]
  fn test_rollback_steps_name_every_resource() {
    let text = manual_rollback_steps(&vars());
    assert!(text.contains("  1. stop the instance win\n"));
    assert!(text.contains(
      "attach the original OS disk win-boot as the boot disk with device name win-boot\n"
    ));
    assert!(text.contains("set windows-startup-script-url back to gs://b/user.ps1"));
    assert!(text.contains("The OS disk snapshot win-boot-snapshot-s was kept."));
  }

  #[test]
  fn test_cleanup_steps_without_user_script() {
    let vars = DerivedVars {
      original_startup_script_url: None,
      machine_image_backup_name: Some("win-backup-s".to_string()),
      ..vars()
    };
    let text = manual_cleanup_steps(&vars);
    assert!(text.contains("  2. remove the metadata key windows-startup-script-ps1\n"));
    assert!(text.contains("as was the machine image win-backup-s."));
  }
}
