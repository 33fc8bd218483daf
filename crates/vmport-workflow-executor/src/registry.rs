//! Tracking of resources created during a run.

use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use vmport_compute::ResourceKind;
use vmport_compute::path::{disk_uri, image_uri, instance_uri, machine_image_uri, snapshot_uri};

/// A resource created by a step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedResource {
  pub kind: ResourceKind,
  pub project: String,
  /// Set for zonal resources.
  pub zone: Option<String>,
  pub name: String,
  pub no_cleanup: bool,
}

impl CreatedResource {
  pub fn uri(&self) -> String {
    let zone = self.zone.as_deref().unwrap_or("");
    match self.kind {
      ResourceKind::Instance => instance_uri(&self.project, zone, &self.name),
      ResourceKind::Disk => disk_uri(&self.project, zone, &self.name),
      ResourceKind::Image => image_uri(&self.project, &self.name),
      ResourceKind::Snapshot => snapshot_uri(&self.project, &self.name),
      ResourceKind::MachineImage => machine_image_uri(&self.project, &self.name),
    }
  }
}

#[derive(Debug)]
struct Entry {
  resource: CreatedResource,
  deleted: bool,
}

/// Records created resources in creation order. Shared by a workflow and all
/// of its included workflows.
#[derive(Debug, Default)]
pub struct ResourceRegistry {
  entries: Mutex<Vec<Entry>>,
}

impl ResourceRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Record a resource about to be created. Returns a handle for
  /// [`ResourceRegistry::forget`].
  pub fn record(&self, resource: CreatedResource) -> usize {
    let mut entries = self.entries.lock().unwrap();
    entries.push(Entry {
      resource,
      deleted: false,
    });
    entries.len() - 1
  }

  /// Drop a recorded resource whose create call was rejected.
  pub fn forget(&self, handle: usize) {
    if let Some(entry) = self.entries.lock().unwrap().get_mut(handle) {
      entry.deleted = true;
    }
  }

  /// Mark the resource with this URI as already deleted.
  pub fn mark_deleted(&self, kind: ResourceKind, uri: &str) {
    let mut entries = self.entries.lock().unwrap();
    for entry in entries.iter_mut() {
      if entry.resource.kind == kind && entry.resource.uri() == uri {
        entry.deleted = true;
      }
    }
  }

  /// Resources that still exist, in creation order.
  pub fn live(&self) -> Vec<CreatedResource> {
    self
      .entries
      .lock()
      .unwrap()
      .iter()
      .filter(|e| !e.deleted)
      .map(|e| e.resource.clone())
      .collect()
  }

  /// Resources to delete at the end of a run, most recent first.
  /// `no_cleanup` resources are never returned.
  pub fn cleanup_candidates(&self) -> Vec<CreatedResource> {
    self
      .entries
      .lock()
      .unwrap()
      .iter()
      .rev()
      .filter(|e| !e.deleted && !e.resource.no_cleanup)
      .map(|e| e.resource.clone())
      .collect()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn disk(name: &str, no_cleanup: bool) -> CreatedResource {
    CreatedResource {
      kind: ResourceKind::Disk,
      project: "p".to_string(),
      zone: Some("z".to_string()),
      name: name.to_string(),
      no_cleanup,
    }
  }

  #[test]
  fn test_cleanup_order_and_no_cleanup() {
    let registry = ResourceRegistry::new();
    registry.record(disk("a", false));
    registry.record(disk("b", true));
    registry.record(disk("c", false));

    let names: Vec<_> = registry
      .cleanup_candidates()
      .into_iter()
      .map(|r| r.name)
      .collect();
    assert_eq!(names, vec!["c", "a"]);
  }

  #[test]
  fn test_forgotten_resources_are_not_cleaned_up() {
    let registry = ResourceRegistry::new();
    registry.record(disk("a", false));
    let rejected = registry.record(disk("b", false));
    registry.forget(rejected);
    let names: Vec<_> = registry
      .cleanup_candidates()
      .into_iter()
      .map(|r| r.name)
      .collect();
    assert_eq!(names, vec!["a"]);
  }

  #[test]
  fn test_deleted_resources_are_skipped() {
    let registry = ResourceRegistry::new();
    registry.record(disk("a", false));
    registry.mark_deleted(ResourceKind::Disk, "projects/p/zones/z/disks/a");
    assert!(registry.cleanup_candidates().is_empty());
    assert!(registry.live().is_empty());
  }
}
