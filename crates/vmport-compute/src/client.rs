//! Collaborator interfaces consumed by the workflow engine and pipelines.
//!
//! Concrete REST implementations live outside this workspace; the in-process
//! [`EmulatorCloud`](crate::EmulatorCloud) implements every trait here.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::ApiError;
use crate::inspect::InspectionResult;
use crate::model::{
  AttachedDisk, Disk, Image, Instance, MachineImage, MachineType, ObjectAttrs, SerialPortOutput,
  Snapshot,
};

/// Compute API operations used by workflow steps and pipeline stages.
#[async_trait]
pub trait ComputeClient: Send + Sync {
  async fn create_disk(&self, project: &str, zone: &str, disk: &Disk) -> Result<(), ApiError>;
  async fn get_disk(&self, project: &str, zone: &str, name: &str) -> Result<Disk, ApiError>;
  async fn delete_disk(&self, project: &str, zone: &str, name: &str) -> Result<(), ApiError>;

  async fn create_instance(
    &self,
    project: &str,
    zone: &str,
    instance: &Instance,
  ) -> Result<(), ApiError>;
  async fn get_instance(&self, project: &str, zone: &str, name: &str)
  -> Result<Instance, ApiError>;
  async fn delete_instance(&self, project: &str, zone: &str, name: &str) -> Result<(), ApiError>;
  async fn start_instance(&self, project: &str, zone: &str, name: &str) -> Result<(), ApiError>;
  async fn stop_instance(&self, project: &str, zone: &str, name: &str) -> Result<(), ApiError>;

  async fn attach_disk(
    &self,
    project: &str,
    zone: &str,
    instance: &str,
    disk: &AttachedDisk,
  ) -> Result<(), ApiError>;
  async fn detach_disk(
    &self,
    project: &str,
    zone: &str,
    instance: &str,
    device_name: &str,
  ) -> Result<(), ApiError>;

  /// Replaces the instance's metadata items with `metadata`.
  async fn set_instance_metadata(
    &self,
    project: &str,
    zone: &str,
    instance: &str,
    metadata: &BTreeMap<String, String>,
  ) -> Result<(), ApiError>;

  async fn create_image(&self, project: &str, image: &Image) -> Result<(), ApiError>;
  async fn get_image(&self, project: &str, name: &str) -> Result<Image, ApiError>;
  async fn delete_image(&self, project: &str, name: &str) -> Result<(), ApiError>;

  async fn create_snapshot(
    &self,
    project: &str,
    zone: &str,
    disk: &str,
    snapshot: &Snapshot,
  ) -> Result<(), ApiError>;
  async fn delete_snapshot(&self, project: &str, name: &str) -> Result<(), ApiError>;

  async fn create_machine_image(
    &self,
    project: &str,
    machine_image: &MachineImage,
  ) -> Result<(), ApiError>;
  async fn delete_machine_image(&self, project: &str, name: &str) -> Result<(), ApiError>;

  async fn get_serial_port_output(
    &self,
    project: &str,
    zone: &str,
    instance: &str,
    port: i64,
    start: i64,
  ) -> Result<SerialPortOutput, ApiError>;

  async fn get_machine_type(
    &self,
    project: &str,
    zone: &str,
    name: &str,
  ) -> Result<MachineType, ApiError>;
  async fn list_zones(&self, project: &str) -> Result<Vec<String>, ApiError>;
  async fn list_networks(&self, project: &str) -> Result<Vec<String>, ApiError>;
  async fn list_subnetworks(&self, project: &str, region: &str) -> Result<Vec<String>, ApiError>;
}

/// Cloud Storage operations.
#[async_trait]
pub trait StorageClient: Send + Sync {
  async fn get_object_attrs(&self, bucket: &str, object: &str) -> Result<ObjectAttrs, ApiError>;
  async fn read_object(&self, bucket: &str, object: &str) -> Result<Vec<u8>, ApiError>;
  async fn write_object(&self, bucket: &str, object: &str, data: Vec<u8>) -> Result<(), ApiError>;
  /// Lists objects under `prefix` in the storage service's listing order.
  async fn list_objects(&self, bucket: &str, prefix: &str) -> Result<Vec<ObjectAttrs>, ApiError>;
  async fn compose_objects(
    &self,
    bucket: &str,
    sources: &[String],
    destination: &str,
  ) -> Result<(), ApiError>;
  async fn copy_object(
    &self,
    src_bucket: &str,
    src_object: &str,
    dst_bucket: &str,
    dst_object: &str,
  ) -> Result<(), ApiError>;
  async fn delete_object(&self, bucket: &str, object: &str) -> Result<(), ApiError>;
}

/// The instance metadata service, used as a fallback for project and zone.
#[async_trait]
pub trait MetadataClient: Send + Sync {
  async fn on_gce(&self) -> bool;
  async fn project_id(&self) -> Result<String, ApiError>;
  async fn zone(&self) -> Result<String, ApiError>;
}

/// Disk content inspection.
#[async_trait]
pub trait Inspector: Send + Sync {
  async fn inspect(&self, disk_uri: &str, full: bool) -> Result<InspectionResult, ApiError>;
}

/// The collaborators a pipeline talks to, built once at startup and passed
/// down explicitly.
#[derive(Clone)]
pub struct Clients {
  pub compute: Arc<dyn ComputeClient>,
  pub storage: Arc<dyn StorageClient>,
  pub metadata: Arc<dyn MetadataClient>,
  pub inspector: Arc<dyn Inspector>,
}
