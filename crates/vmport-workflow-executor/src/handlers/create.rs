use std::future::Future;

use futures::future::try_join_all;
use tracing::info;
use vmport_compute::{ApiError, ResourceKind};
use vmport_compute::path::{ZonalResource, disk_uri, instance_uri};
use vmport_workflow::{DiskDef, ImageDef, InstanceDef, MachineImageDef, SnapshotDef};

use super::StepContext;
use crate::error::StepError;
use crate::registry::CreatedResource;

fn is_uri(reference: &str) -> bool {
  reference.contains("projects/")
}

/// Run `create` with `resource` already recorded, so a step dropped while
/// the call is in flight still cleans it up. A rejected call is forgotten:
/// the name may belong to a resource this run does not own.
async fn tracked(
  ctx: &StepContext,
  resource: CreatedResource,
  create: impl Future<Output = Result<(), ApiError>>,
) -> Result<(), ApiError> {
  let handle = ctx.state.registry.record(resource);
  let result = create.await;
  if result.is_err() {
    ctx.state.registry.forget(handle);
  }
  result
}

pub(super) async fn create_disks(ctx: &StepContext, defs: &[DiskDef]) -> Result<(), StepError> {
  try_join_all(defs.iter().map(|def| create_disk(ctx, def))).await?;
  Ok(())
}

async fn create_disk(ctx: &StepContext, def: &DiskDef) -> Result<(), StepError> {
  let project = def.project.as_deref().unwrap_or(&ctx.project);
  let zone = def.zone.as_deref().unwrap_or(&ctx.zone);
  let mut disk = def.disk.clone();
  if let Some(source) = &def.disk.source_disk {
    if !is_uri(source) {
      disk.source_disk = Some(disk_uri(project, zone, source));
    }
  }

  tracked(
    ctx,
    CreatedResource {
      kind: ResourceKind::Disk,
      project: project.to_string(),
      zone: Some(zone.to_string()),
      name: disk.name.clone(),
      no_cleanup: def.no_cleanup,
    },
    ctx.compute.create_disk(project, zone, &disk),
  )
  .await
  .map_err(|e| StepError::api("create disk", &disk.name, e))?;
  info!(step = %ctx.step, disk = %disk.name, "disk created");
  Ok(())
}

pub(super) async fn create_instances(
  ctx: &StepContext,
  defs: &[InstanceDef],
) -> Result<(), StepError> {
  try_join_all(defs.iter().map(|def| create_instance(ctx, def))).await?;
  Ok(())
}

async fn create_instance(ctx: &StepContext, def: &InstanceDef) -> Result<(), StepError> {
  let project = def.project.as_deref().unwrap_or(&ctx.project);
  let zone = def.zone.as_deref().unwrap_or(&ctx.zone);
  let mut instance = def.instance.clone();
  for attached in instance.disks.iter_mut() {
    if !is_uri(&attached.source) {
      attached.source = disk_uri(project, zone, &attached.source);
    }
  }
  // The first disk boots unless another one says so.
  if !instance.disks.iter().any(|d| d.boot) {
    if let Some(first) = instance.disks.first_mut() {
      first.boot = true;
    }
  }

  tracked(
    ctx,
    CreatedResource {
      kind: ResourceKind::Instance,
      project: project.to_string(),
      zone: Some(zone.to_string()),
      name: instance.name.clone(),
      no_cleanup: def.no_cleanup,
    },
    ctx.compute.create_instance(project, zone, &instance),
  )
  .await
  .map_err(|e| StepError::api("create instance", &instance.name, e))?;
  info!(step = %ctx.step, instance = %instance.name, "instance created");
  Ok(())
}

pub(super) async fn create_images(ctx: &StepContext, defs: &[ImageDef]) -> Result<(), StepError> {
  try_join_all(defs.iter().map(|def| create_image(ctx, def))).await?;
  Ok(())
}

async fn create_image(ctx: &StepContext, def: &ImageDef) -> Result<(), StepError> {
  let project = def.project.as_deref().unwrap_or(&ctx.project);
  let mut image = def.image.clone();
  if let Some(source) = &def.image.source_disk {
    if ZonalResource::parse(source, "disks").is_none() {
      image.source_disk = Some(disk_uri(&ctx.project, &ctx.zone, source));
    }
  }

  tracked(
    ctx,
    CreatedResource {
      kind: ResourceKind::Image,
      project: project.to_string(),
      zone: None,
      name: image.name.clone(),
      no_cleanup: def.no_cleanup,
    },
    ctx.compute.create_image(project, &image),
  )
  .await
  .map_err(|e| StepError::api("create image", &image.name, e))?;
  info!(step = %ctx.step, image = %image.name, "image created");
  Ok(())
}

pub(super) async fn create_snapshots(
  ctx: &StepContext,
  defs: &[SnapshotDef],
) -> Result<(), StepError> {
  try_join_all(defs.iter().map(|def| create_snapshot(ctx, def))).await?;
  Ok(())
}

async fn create_snapshot(ctx: &StepContext, def: &SnapshotDef) -> Result<(), StepError> {
  let project = def.project.as_deref().unwrap_or(&ctx.project);
  let source = ctx.zonal(&def.snapshot.source_disk, "disks");
  let zone = def.zone.clone().unwrap_or(source.zone.clone());

  tracked(
    ctx,
    CreatedResource {
      kind: ResourceKind::Snapshot,
      project: project.to_string(),
      zone: None,
      name: def.snapshot.name.clone(),
      no_cleanup: def.no_cleanup,
    },
    ctx.compute.create_snapshot(&source.project, &zone, &source.name, &def.snapshot),
  )
  .await
  .map_err(|e| StepError::api("create snapshot", &def.snapshot.name, e))?;
  info!(step = %ctx.step, snapshot = %def.snapshot.name, "snapshot created");
  Ok(())
}

pub(super) async fn create_machine_images(
  ctx: &StepContext,
  defs: &[MachineImageDef],
) -> Result<(), StepError> {
  try_join_all(defs.iter().map(|def| create_machine_image(ctx, def))).await?;
  Ok(())
}

async fn create_machine_image(ctx: &StepContext, def: &MachineImageDef) -> Result<(), StepError> {
  let project = def.project.as_deref().unwrap_or(&ctx.project);
  let mut machine_image = def.machine_image.clone();
  if !is_uri(&machine_image.source_instance) {
    let zone = def.zone.as_deref().unwrap_or(&ctx.zone);
    machine_image.source_instance = instance_uri(project, zone, &machine_image.source_instance);
  }

  tracked(
    ctx,
    CreatedResource {
      kind: ResourceKind::MachineImage,
      project: project.to_string(),
      zone: None,
      name: machine_image.name.clone(),
      no_cleanup: def.no_cleanup,
    },
    ctx.compute.create_machine_image(project, &machine_image),
  )
  .await
  .map_err(|e| StepError::api("create machine image", &machine_image.name, e))?;
  info!(step = %ctx.step, machine_image = %machine_image.name, "machine image created");
  Ok(())
}
