//! Publishing the import result.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, instrument};
use vmport_compute::path::image_uri;
use vmport_compute::{GuestOsFeature, Image, add_guest_os_feature};
use vmport_workflow::{ImageDef, ImageKind};

use crate::context::ImportContext;
use crate::disk::PersistentDisk;
use crate::error::ImportError;
use crate::planner::ProcessingPlan;

/// License attached to every image imported as a data disk.
pub const DATA_DISK_LICENSE: &str = "projects/compute-image-tools/global/licenses/virtual-disk-import";

#[async_trait]
pub trait Finisher: Send + Sync {
  /// Publish the image. Returns its URI.
  async fn finish(&self, pd: &PersistentDisk) -> Result<String, ImportError>;

  fn cancel(&self, reason: &str) -> bool;

  fn trace_logs(&self) -> Vec<String>;
}

pub fn create_finisher(ctx: &ImportContext, plan: &Arc<ProcessingPlan>) -> Box<dyn Finisher> {
  if ctx.args.data_disk {
    Box::new(DataDiskFinisher::new(ctx.clone(), plan.clone()))
  } else {
    Box::new(BootableFinisher::new(ctx.clone()))
  }
}

/// Creates the image straight from the disk.
pub struct DataDiskFinisher {
  ctx: ImportContext,
  plan: Arc<ProcessingPlan>,
}

impl DataDiskFinisher {
  pub fn new(ctx: ImportContext, plan: Arc<ProcessingPlan>) -> Self {
    Self { ctx, plan }
  }

  /// The image definition, labelled and placed like workflow-created
  /// images.
  pub(crate) fn image(&self, pd: &PersistentDisk) -> Image {
    let args = &self.ctx.args;
    let mut guest_os_features = Vec::new();
    if pd.is_uefi_compatible || self.plan.uefi {
      add_guest_os_feature(&mut guest_os_features, GuestOsFeature::UefiCompatible);
    }
    let image = Image {
      name: args.image_name.clone(),
      family: args.family.clone().filter(|f| !f.is_empty()),
      description: args.description.clone().filter(|d| !d.is_empty()),
      source_disk: Some(pd.uri.clone()),
      licenses: vec![DATA_DISK_LICENSE.to_string()],
      guest_os_features,
      ..Default::default()
    };
    let mut def = ImageDef::new(image, ImageKind::Final);
    self.ctx.labeler().label_image(&mut def);
    def.image
  }
}

#[async_trait]
impl Finisher for DataDiskFinisher {
  #[instrument(name = "finish_data_disk", skip_all, fields(disk = %pd.uri))]
  async fn finish(&self, pd: &PersistentDisk) -> Result<String, ImportError> {
    let args = &self.ctx.args;
    let image = self.image(pd);
    self
      .ctx
      .clients
      .compute
      .create_image(&args.project, &image)
      .await
      .map_err(|e| ImportError::api("create_image", image.name.clone(), e))?;
    let uri = image_uri(&args.project, &image.name);
    info!(image = %uri, "created data disk image");
    Ok(uri)
  }

  fn cancel(&self, _reason: &str) -> bool {
    false
  }

  fn trace_logs(&self) -> Vec<String> {
    Vec::new()
  }
}

/// The translate workflow already created the image; check that it did.
pub struct BootableFinisher {
  ctx: ImportContext,
}

impl BootableFinisher {
  pub fn new(ctx: ImportContext) -> Self {
    Self { ctx }
  }
}

#[async_trait]
impl Finisher for BootableFinisher {
  async fn finish(&self, _pd: &PersistentDisk) -> Result<String, ImportError> {
    let args = &self.ctx.args;
    match self
      .ctx
      .clients
      .compute
      .get_image(&args.project, &args.image_name)
      .await
    {
      Ok(_) => Ok(image_uri(&args.project, &args.image_name)),
      Err(e) if e.is_not_found() => Err(ImportError::ImageMissing {
        image: args.image_name.clone(),
      }),
      Err(e) => Err(ImportError::api("get_image", args.image_name.clone(), e)),
    }
  }

  fn cancel(&self, _reason: &str) -> bool {
    false
  }

  fn trace_logs(&self) -> Vec<String> {
    Vec::new()
  }
}
