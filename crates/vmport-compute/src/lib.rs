//! vmport Compute
//!
//! Cloud resource model and the collaborator interfaces every other vmport
//! crate talks to:
//!
//! - [`ComputeClient`]: disks, instances, images, snapshots, serial output
//! - [`StorageClient`]: Cloud Storage objects
//! - [`MetadataClient`]: project/zone fallback when running on GCE
//! - [`Inspector`]: black-box disk inspection
//!
//! [`EmulatorCloud`] implements all of them in memory. It backs the CLI and
//! every test in the workspace.

mod client;
mod emulator;
mod error;
mod inspect;
mod model;
pub mod path;

pub use client::{Clients, ComputeClient, Inspector, MetadataClient, StorageClient};
pub use emulator::{
  BootScript, EmulatorCloud, EmulatorState, InjectedFailure, InjectedLatency, StoredObject,
};
pub use error::ApiError;
pub use inspect::{DetectedOs, InspectionResult};
pub use model::{
  AccessConfig, AttachedDisk, Disk, DiskMode, GuestOsFeature, Image, Instance, InstanceStatus,
  MachineImage, MachineType, NetworkInterface, ObjectAttrs, ResourceKind, SerialPortOutput,
  Snapshot, add_guest_os_feature,
};
pub use path::GcsPath;
