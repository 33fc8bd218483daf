//! Supported guest operating systems.
//!
//! Each entry names the translate workflow (relative to the workflow
//! directory) and the license the imported image carries.

use thiserror::Error;
use vmport_compute::DetectedOs;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OsError {
  #[error("os `{os}` is invalid. Allowed values: {allowed}")]
  Unsupported { os: String, allowed: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OsInfo {
  pub id: &'static str,
  pub translate_workflow: &'static str,
  pub license: &'static str,
}

const fn os(id: &'static str, translate_workflow: &'static str, license: &'static str) -> OsInfo {
  OsInfo {
    id,
    translate_workflow,
    license,
  }
}

pub const SUPPORTED_OS: [OsInfo; 20] = [
  os(
    "centos-7",
    "enterprise_linux/translate_centos_7.wf.json",
    "projects/centos-cloud/global/licenses/centos-7",
  ),
  os(
    "centos-8",
    "enterprise_linux/translate_centos_8.wf.json",
    "projects/centos-cloud/global/licenses/centos-8",
  ),
  os(
    "debian-9",
    "debian/translate_debian_9.wf.json",
    "projects/debian-cloud/global/licenses/debian-9-stretch",
  ),
  os(
    "debian-10",
    "debian/translate_debian_10.wf.json",
    "projects/debian-cloud/global/licenses/debian-10-buster",
  ),
  os(
    "debian-11",
    "debian/translate_debian_11.wf.json",
    "projects/debian-cloud/global/licenses/debian-11-bullseye",
  ),
  os(
    "opensuse-15",
    "suse/translate_opensuse_15.wf.json",
    "projects/opensuse-cloud/global/licenses/opensuse-leap",
  ),
  os(
    "rhel-7",
    "enterprise_linux/translate_rhel_7_licensed.wf.json",
    "projects/rhel-cloud/global/licenses/rhel-7-server",
  ),
  os(
    "rhel-7-byol",
    "enterprise_linux/translate_rhel_7_byol.wf.json",
    "projects/rhel-cloud/global/licenses/rhel-7-byos",
  ),
  os(
    "rhel-8",
    "enterprise_linux/translate_rhel_8_licensed.wf.json",
    "projects/rhel-cloud/global/licenses/rhel-8-server",
  ),
  os(
    "rhel-8-byol",
    "enterprise_linux/translate_rhel_8_byol.wf.json",
    "projects/rhel-cloud/global/licenses/rhel-8-byos",
  ),
  os(
    "sles-12-byol",
    "suse/translate_sles_12_byol.wf.json",
    "projects/suse-byos-cloud/global/licenses/sles-12-byos",
  ),
  os(
    "sles-15-byol",
    "suse/translate_sles_15_byol.wf.json",
    "projects/suse-byos-cloud/global/licenses/sles-15-byos",
  ),
  os(
    "ubuntu-1604",
    "ubuntu/translate_ubuntu_1604.wf.json",
    "projects/ubuntu-os-cloud/global/licenses/ubuntu-1604-xenial",
  ),
  os(
    "ubuntu-1804",
    "ubuntu/translate_ubuntu_1804.wf.json",
    "projects/ubuntu-os-cloud/global/licenses/ubuntu-1804-lts",
  ),
  os(
    "ubuntu-2004",
    "ubuntu/translate_ubuntu_2004.wf.json",
    "projects/ubuntu-os-cloud/global/licenses/ubuntu-2004-lts",
  ),
  os(
    "windows-10-x64-byol",
    "windows/translate_windows_10_x64_byol.wf.json",
    "projects/windows-cloud/global/licenses/windows-10-x64-byol",
  ),
  os(
    "windows-2008r2",
    "windows/translate_windows_2008_r2.wf.json",
    "projects/windows-cloud/global/licenses/windows-server-2008-r2-dc",
  ),
  os(
    "windows-2012r2",
    "windows/translate_windows_2012_r2.wf.json",
    "projects/windows-cloud/global/licenses/windows-server-2012-r2-dc",
  ),
  os(
    "windows-2016",
    "windows/translate_windows_2016.wf.json",
    "projects/windows-cloud/global/licenses/windows-server-2016-dc",
  ),
  os(
    "windows-2019",
    "windows/translate_windows_2019.wf.json",
    "projects/windows-cloud/global/licenses/windows-server-2019-dc",
  ),
];

/// Comma separated list of every supported OS id.
pub fn allowed_values() -> String {
  SUPPORTED_OS
    .iter()
    .map(|os| os.id)
    .collect::<Vec<_>>()
    .join(", ")
}

pub fn lookup(os: &str) -> Result<&'static OsInfo, OsError> {
  SUPPORTED_OS
    .iter()
    .find(|info| info.id == os)
    .ok_or_else(|| OsError::Unsupported {
      os: os.to_string(),
      allowed: allowed_values(),
    })
}

pub fn validate_os(os: &str) -> Result<(), OsError> {
  lookup(os).map(|_| ())
}

pub fn translate_workflow_path(os: &str) -> Result<&'static str, OsError> {
  lookup(os).map(|info| info.translate_workflow)
}

pub fn is_windows(os: &str) -> bool {
  os.contains("windows")
}

/// Map an inspected OS onto a supported id, if there is one.
pub fn from_detected(detected: &DetectedOs) -> Option<&'static str> {
  let distro = detected.distro.to_lowercase();
  let major = detected.major_version.as_str();
  let minor = detected.minor_version.to_lowercase();
  let candidate = match distro.as_str() {
    "ubuntu" => format!("ubuntu-{}{:0>2}", major, minor),
    "sles" => format!("sles-{}-byol", major),
    "windows" if major == "10" => "windows-10-x64-byol".to_string(),
    "windows" => format!("windows-{}{}", major, minor),
    "rhel" | "centos" | "debian" | "opensuse" => format!("{}-{}", distro, major),
    _ => return None,
  };
  SUPPORTED_OS
    .iter()
    .find(|info| info.id == candidate)
    .map(|info| info.id)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_every_entry_resolves_to_its_path() {
    for info in SUPPORTED_OS.iter() {
      assert_eq!(translate_workflow_path(info.id).unwrap(), info.translate_workflow);
    }
    assert_eq!(
      translate_workflow_path("ubuntu-1604").unwrap(),
      "ubuntu/translate_ubuntu_1604.wf.json"
    );
    assert_eq!(
      translate_workflow_path("windows-2012r2").unwrap(),
      "windows/translate_windows_2012_r2.wf.json"
    );
  }

  #[test]
  fn test_ids_are_unique() {
    let mut ids: Vec<_> = SUPPORTED_OS.iter().map(|o| o.id).collect();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), SUPPORTED_OS.len());
  }

  #[test]
  fn test_unknown_os_lists_allowed_values() {
    let err = translate_workflow_path("plan9").unwrap_err();
    let message = err.to_string();
    assert!(message.starts_with("os `plan9` is invalid"));
    for info in SUPPORTED_OS.iter() {
      assert!(message.contains(info.id));
    }
  }

  #[test]
  fn test_from_detected() {
    let detected = |distro: &str, major: &str, minor: &str| DetectedOs {
      distro: distro.to_string(),
      major_version: major.to_string(),
      minor_version: minor.to_string(),
      architecture: "x64".to_string(),
    };
    assert_eq!(from_detected(&detected("ubuntu", "16", "04")), Some("ubuntu-1604"));
    assert_eq!(from_detected(&detected("centos", "7", "9")), Some("centos-7"));
    assert_eq!(from_detected(&detected("windows", "2012", "R2")), Some("windows-2012r2"));
    assert_eq!(from_detected(&detected("windows", "10", "")), Some("windows-10-x64-byol"));
    assert_eq!(from_detected(&detected("sles", "15", "1")), Some("sles-15-byol"));
    assert_eq!(from_detected(&detected("ubuntu", "12", "04")), None);
    assert_eq!(from_detected(&detected("freebsd", "13", "0")), None);
  }
}
