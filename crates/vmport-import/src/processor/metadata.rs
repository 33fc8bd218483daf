use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, instrument};
use vmport_compute::path::{ZonalResource, disk_uri};
use vmport_compute::{Disk, GuestOsFeature, add_guest_os_feature};
use vmport_workflow_utils::random_suffix;

use super::Processor;
use crate::context::ImportContext;
use crate::disk::PersistentDisk;
use crate::error::ImportError;
use crate::planner::ProcessingPlan;

const MAX_NAME_LEN: usize = 63;

/// Adds the plan's licenses and guest OS features to the disk.
///
/// Both are immutable once a disk exists, so a missing one means creating
/// a replacement disk from the current one and deleting the original.
pub struct MetadataProcessor {
  ctx: ImportContext,
  plan: Arc<ProcessingPlan>,
}

impl MetadataProcessor {
  pub fn new(ctx: ImportContext, plan: Arc<ProcessingPlan>) -> Self {
    Self { ctx, plan }
  }
}

#[async_trait]
impl Processor for MetadataProcessor {
  #[instrument(name = "update_disk_metadata", skip_all, fields(disk = %pd.uri))]
  async fn process(&self, mut pd: PersistentDisk) -> Result<PersistentDisk, ImportError> {
    let current = ZonalResource::parse(&pd.uri, "disks")
      .ok_or_else(|| ImportError::invalid(format!("{} is not a disk URI", pd.uri)))?;
    let compute = &self.ctx.clients.compute;
    let disk = compute
      .get_disk(&current.project, &current.zone, &current.name)
      .await
      .map_err(|e| ImportError::api("get_disk", pd.uri.clone(), e))?;

    let missing_licenses: Vec<_> = self
      .plan
      .required_licenses
      .iter()
      .filter(|l| !disk.licenses.contains(l))
      .cloned()
      .collect();
    let missing_features: Vec<_> = self
      .plan
      .required_features
      .iter()
      .filter(|f| !disk.guest_os_features.contains(f))
      .copied()
      .collect();
    if missing_licenses.is_empty() && missing_features.is_empty() {
      pd.is_uefi_compatible |= disk.guest_os_features.contains(&GuestOsFeature::UefiCompatible);
      return Ok(pd);
    }

    let mut licenses = disk.licenses.clone();
    licenses.extend(missing_licenses.iter().cloned());
    let mut features = disk.guest_os_features.clone();
    for feature in &missing_features {
      add_guest_os_feature(&mut features, *feature);
    }

    let name = replacement_name(&current.name, &random_suffix(4));
    let replacement = Disk {
      name: name.clone(),
      source_disk: Some(pd.uri.clone()),
      size_gb: disk.size_gb,
      disk_type: disk.disk_type.clone(),
      licenses,
      guest_os_features: features,
      labels: disk.labels.clone(),
      ..Default::default()
    };
    compute
      .create_disk(&current.project, &current.zone, &replacement)
      .await
      .map_err(|e| ImportError::api("create_disk", name.clone(), e))?;
    info!(
      replacement = %name,
      licenses = ?missing_licenses,
      features = ?missing_features,
      "created disk with updated metadata"
    );

    self.ctx.delete_disk(&pd.uri).await;

    pd.uri = disk_uri(&current.project, &current.zone, &name);
    pd.is_uefi_compatible |= replacement
      .guest_os_features
      .contains(&GuestOsFeature::UefiCompatible);
    Ok(pd)
  }

  fn cancel(&self, _reason: &str) -> bool {
    false
  }

  fn trace_logs(&self) -> Vec<String> {
    Vec::new()
  }
}

fn replacement_name(name: &str, suffix: &str) -> String {
  let keep = MAX_NAME_LEN - suffix.len() - 1;
  let base: String = name.chars().take(keep).collect();
  format!("{}-{}", base.trim_end_matches('-'), suffix)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_replacement_name_fits() {
    assert_eq!(replacement_name("disk-abc", "x1y2"), "disk-abc-x1y2");
    let long = "d".repeat(80);
    let name = replacement_name(&long, "x1y2");
    assert_eq!(name.len(), MAX_NAME_LEN);
    assert!(name.ends_with("-x1y2"));
  }
}
