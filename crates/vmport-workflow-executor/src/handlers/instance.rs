use futures::future::try_join_all;
use tracing::info;
use vmport_compute::path::{ZonalResource, disk_uri};
use vmport_workflow::{AttachDiskDef, DetachDiskDef, MetadataUpdateDef};

use super::StepContext;
use crate::error::StepError;

pub(super) async fn attach_disks(ctx: &StepContext, defs: &[AttachDiskDef]) -> Result<(), StepError> {
  // Attachments to the same instance are applied in order.
  for def in defs {
    let instance = ctx.zonal(&def.instance, "instances");
    let mut attached = def.attached_disk.clone();
    if ZonalResource::parse(&attached.source, "disks").is_none() {
      attached.source = disk_uri(&instance.project, &instance.zone, &attached.source);
    }
    ctx
      .compute
      .attach_disk(&instance.project, &instance.zone, &instance.name, &attached)
      .await
      .map_err(|e| StepError::api("attach disk", &attached.source, e))?;
    info!(step = %ctx.step, instance = %instance.name, disk = %attached.source, "disk attached");
  }
  Ok(())
}

pub(super) async fn detach_disks(ctx: &StepContext, defs: &[DetachDiskDef]) -> Result<(), StepError> {
  for def in defs {
    let instance = ctx.zonal(&def.instance, "instances");
    ctx
      .compute
      .detach_disk(&instance.project, &instance.zone, &instance.name, &def.device_name)
      .await
      .map_err(|e| StepError::api("detach disk", &def.device_name, e))?;
    info!(step = %ctx.step, instance = %instance.name, device = %def.device_name, "disk detached");
  }
  Ok(())
}

pub(super) async fn start_instances(ctx: &StepContext, names: &[String]) -> Result<(), StepError> {
  try_join_all(names.iter().map(|name| async move {
    let instance = ctx.zonal(name, "instances");
    ctx
      .compute
      .start_instance(&instance.project, &instance.zone, &instance.name)
      .await
      .map_err(|e| StepError::api("start instance", &instance.name, e))?;
    info!(step = %ctx.step, instance = %instance.name, "instance started");
    Ok::<_, StepError>(())
  }))
  .await?;
  Ok(())
}

pub(super) async fn stop_instances(ctx: &StepContext, names: &[String]) -> Result<(), StepError> {
  try_join_all(names.iter().map(|name| async move {
    let instance = ctx.zonal(name, "instances");
    ctx
      .compute
      .stop_instance(&instance.project, &instance.zone, &instance.name)
      .await
      .map_err(|e| StepError::api("stop instance", &instance.name, e))?;
    info!(step = %ctx.step, instance = %instance.name, "instance stopped");
    Ok::<_, StepError>(())
  }))
  .await?;
  Ok(())
}

pub(super) async fn update_metadata(
  ctx: &StepContext,
  defs: &[MetadataUpdateDef],
) -> Result<(), StepError> {
  for def in defs {
    let instance = ctx.zonal(&def.instance, "instances");
    let current = ctx
      .compute
      .get_instance(&instance.project, &instance.zone, &instance.name)
      .await
      .map_err(|e| StepError::api("get instance", &instance.name, e))?;

    let mut metadata = current.metadata;
    for key in &def.remove {
      metadata.remove(key);
    }
    for (key, value) in &def.metadata {
      metadata.insert(key.clone(), value.clone());
    }

    ctx
      .compute
      .set_instance_metadata(&instance.project, &instance.zone, &instance.name, &metadata)
      .await
      .map_err(|e| StepError::api("set metadata", &instance.name, e))?;
    info!(step = %ctx.step, instance = %instance.name, "instance metadata updated");
  }
  Ok(())
}
