//! Tracking labels for workflow-created resources.

use std::collections::BTreeMap;

use tracing::debug;
use vmport_workflow::{DiskDef, ImageDef, ImageKind, InstanceDef, StepKind, Workflow};

pub const IMPORT_LABEL: &str = "gce-image-import";
pub const IMPORT_TMP_LABEL: &str = "gce-image-import-tmp";
pub const IMPORT_BUILD_ID_LABEL: &str = "gce-image-import-build-id";
pub const EXPORT_LABEL: &str = "gce-image-export";
pub const EXPORT_TMP_LABEL: &str = "gce-image-export-tmp";
pub const EXPORT_BUILD_ID_LABEL: &str = "gce-image-export-build-id";

/// Value stored under the type key.
const TYPE_LABEL_VALUE: &str = "true";

pub type InstanceLabelKeyRetriever = Box<dyn Fn(&InstanceDef) -> String + Send + Sync>;
pub type DiskLabelKeyRetriever = Box<dyn Fn(&DiskDef) -> String + Send + Sync>;
pub type ImageLabelKeyRetriever = Box<dyn Fn(&ImageDef, ImageKind) -> String + Send + Sync>;

/// Adds tracking and user labels to every instance, disk and image a
/// workflow creates, including those of included workflows.
///
/// The type key returned by the retrievers and the build-ID key are always
/// set by the labeler; user labels cannot override them.
pub struct ResourceLabeler {
  pub build_id: String,
  pub build_id_label_key: String,
  pub user_labels: BTreeMap<String, String>,
  /// Replaces the storage locations of every created image.
  pub image_location: Option<String>,
  instance_label_key: InstanceLabelKeyRetriever,
  disk_label_key: DiskLabelKeyRetriever,
  image_label_key: ImageLabelKeyRetriever,
}

impl ResourceLabeler {
  pub fn new(
    build_id: impl Into<String>,
    build_id_label_key: impl Into<String>,
    user_labels: BTreeMap<String, String>,
    instance_label_key: InstanceLabelKeyRetriever,
    disk_label_key: DiskLabelKeyRetriever,
    image_label_key: ImageLabelKeyRetriever,
  ) -> Self {
    Self {
      build_id: build_id.into(),
      build_id_label_key: build_id_label_key.into(),
      user_labels,
      image_location: None,
      instance_label_key,
      disk_label_key,
      image_label_key,
    }
  }

  /// Labels used by image import: workers and disks are temporary, final
  /// images are tagged as imports, intermediate images as temporary.
  pub fn for_import(build_id: impl Into<String>, user_labels: BTreeMap<String, String>) -> Self {
    Self::new(
      build_id,
      IMPORT_BUILD_ID_LABEL,
      user_labels,
      Box::new(|_| IMPORT_TMP_LABEL.to_string()),
      Box::new(|_| IMPORT_TMP_LABEL.to_string()),
      Box::new(|_, kind| match kind {
        ImageKind::Final => IMPORT_LABEL.to_string(),
        ImageKind::Intermediate => IMPORT_TMP_LABEL.to_string(),
      }),
    )
  }

  pub fn for_export(build_id: impl Into<String>, user_labels: BTreeMap<String, String>) -> Self {
    Self::new(
      build_id,
      EXPORT_BUILD_ID_LABEL,
      user_labels,
      Box::new(|_| EXPORT_TMP_LABEL.to_string()),
      Box::new(|_| EXPORT_TMP_LABEL.to_string()),
      Box::new(|_, kind| match kind {
        ImageKind::Final => EXPORT_LABEL.to_string(),
        ImageKind::Intermediate => EXPORT_TMP_LABEL.to_string(),
      }),
    )
  }

  pub fn with_image_location(mut self, location: Option<String>) -> Self {
    self.image_location = location;
    self
  }

  pub fn label_resources(&self, workflow: &mut Workflow) {
    debug!(workflow = %workflow.name, build_id = %self.build_id, "labeling created resources");
    workflow.visit_steps_mut(&mut |step| match &mut step.kind {
      StepKind::CreateInstances(defs) => {
        for def in defs.iter_mut() {
          let key = (self.instance_label_key)(def);
          self.apply(&mut def.instance.labels, &key);
        }
      }
      StepKind::CreateDisks(defs) => {
        for def in defs.iter_mut() {
          let key = (self.disk_label_key)(def);
          self.apply(&mut def.disk.labels, &key);
        }
      }
      StepKind::CreateImages(defs) => {
        for def in defs.iter_mut() {
          self.label_image(def);
        }
      }
      _ => {}
    });
  }

  /// Label and place a single image, for images created outside a
  /// workflow.
  pub fn label_image(&self, def: &mut ImageDef) {
    if let Some(location) = &self.image_location {
      def.image.storage_locations = vec![location.clone()];
    }
    let key = (self.image_label_key)(def, def.effective_kind());
    self.apply(&mut def.image.labels, &key);
  }

  fn apply(&self, labels: &mut BTreeMap<String, String>, type_key: &str) {
    for (key, value) in &self.user_labels {
      labels.insert(key.clone(), value.clone());
    }
    labels.insert(type_key.to_string(), TYPE_LABEL_VALUE.to_string());
    labels.insert(self.build_id_label_key.clone(), self.build_id.clone());
  }
}
