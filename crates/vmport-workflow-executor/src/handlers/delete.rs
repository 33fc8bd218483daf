use futures::future::try_join_all;
use tracing::{info, warn};
use vmport_compute::path::{
  disk_uri, image_uri, instance_uri, machine_image_uri, snapshot_uri,
};
use vmport_compute::{ApiError, ResourceKind};
use vmport_workflow::DeleteResourcesDef;

use super::StepContext;
use crate::error::StepError;

/// Treat "not found" as already deleted.
fn ignore_missing(result: Result<(), ApiError>, resource: &str) -> Result<bool, ApiError> {
  match result {
    Ok(()) => Ok(true),
    Err(e) if e.is_not_found() => {
      warn!(resource = %resource, "resource already deleted");
      Ok(false)
    }
    Err(e) => Err(e),
  }
}

/// Instances go first so their disks are free; images, snapshots and machine
/// images have no ordering constraints.
pub(super) async fn delete_resources(
  ctx: &StepContext,
  def: &DeleteResourcesDef,
) -> Result<(), StepError> {
  try_join_all(def.instances.iter().map(|name| delete_instance(ctx, name))).await?;
  try_join_all(def.disks.iter().map(|name| delete_disk(ctx, name))).await?;
  try_join_all(def.images.iter().map(|name| delete_image(ctx, name))).await?;
  try_join_all(def.snapshots.iter().map(|name| delete_snapshot(ctx, name))).await?;
  try_join_all(
    def
      .machine_images
      .iter()
      .map(|name| delete_machine_image(ctx, name)),
  )
  .await?;
  Ok(())
}

async fn delete_instance(ctx: &StepContext, reference: &str) -> Result<(), StepError> {
  let r = ctx.zonal(reference, "instances");
  let uri = instance_uri(&r.project, &r.zone, &r.name);

  // Disks deleted along with the instance must not be cleaned up again.
  let auto_deleted: Vec<String> = match ctx.compute.get_instance(&r.project, &r.zone, &r.name).await {
    Ok(instance) => instance
      .disks
      .iter()
      .filter(|d| d.auto_delete)
      .map(|d| d.source.clone())
      .collect(),
    Err(_) => Vec::new(),
  };

  let result = ctx.compute.delete_instance(&r.project, &r.zone, &r.name).await;
  let deleted = ignore_missing(result, &uri).map_err(|e| StepError::api("delete instance", &uri, e))?;
  ctx.state.registry.mark_deleted(ResourceKind::Instance, &uri);
  for disk in auto_deleted {
    let d = ctx.zonal(&disk, "disks");
    ctx
      .state
      .registry
      .mark_deleted(ResourceKind::Disk, &disk_uri(&d.project, &d.zone, &d.name));
  }
  if deleted {
    info!(step = %ctx.step, instance = %r.name, "instance deleted");
  }
  Ok(())
}

async fn delete_disk(ctx: &StepContext, reference: &str) -> Result<(), StepError> {
  let r = ctx.zonal(reference, "disks");
  let uri = disk_uri(&r.project, &r.zone, &r.name);
  let result = ctx.compute.delete_disk(&r.project, &r.zone, &r.name).await;
  let deleted = ignore_missing(result, &uri).map_err(|e| StepError::api("delete disk", &uri, e))?;
  ctx.state.registry.mark_deleted(ResourceKind::Disk, &uri);
  if deleted {
    info!(step = %ctx.step, disk = %r.name, "disk deleted");
  }
  Ok(())
}

async fn delete_image(ctx: &StepContext, reference: &str) -> Result<(), StepError> {
  let (project, name) = ctx.global(reference, "images");
  let uri = image_uri(&project, &name);
  let result = ctx.compute.delete_image(&project, &name).await;
  let deleted = ignore_missing(result, &uri).map_err(|e| StepError::api("delete image", &uri, e))?;
  ctx.state.registry.mark_deleted(ResourceKind::Image, &uri);
  if deleted {
    info!(step = %ctx.step, image = %name, "image deleted");
  }
  Ok(())
}

async fn delete_snapshot(ctx: &StepContext, reference: &str) -> Result<(), StepError> {
  let (project, name) = ctx.global(reference, "snapshots");
  let uri = snapshot_uri(&project, &name);
  let result = ctx.compute.delete_snapshot(&project, &name).await;
  ignore_missing(result, &uri).map_err(|e| StepError::api("delete snapshot", &uri, e))?;
  ctx.state.registry.mark_deleted(ResourceKind::Snapshot, &uri);
  Ok(())
}

async fn delete_machine_image(ctx: &StepContext, reference: &str) -> Result<(), StepError> {
  let (project, name) = ctx.global(reference, "machineImages");
  let uri = machine_image_uri(&project, &name);
  let result = ctx.compute.delete_machine_image(&project, &name).await;
  ignore_missing(result, &uri).map_err(|e| StepError::api("delete machine image", &uri, e))?;
  ctx.state.registry.mark_deleted(ResourceKind::MachineImage, &uri);
  Ok(())
}
