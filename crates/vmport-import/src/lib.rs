//! vmport Import
//!
//! Imports a disk file or an existing image as a bootable (or data) image:
//!
//! 1. an [`Inflater`] turns the source into a persistent disk;
//! 2. the [`ProcessPlanner`] inspects it and decides what it needs;
//! 3. the [`Processor`] chain grafts licenses/features onto the disk and
//!    runs the OS translate workflow;
//! 4. a [`Finisher`] publishes the image.
//!
//! [`Importer`] drives the stages, owns cancellation and deletes the
//! working disk at the end.

mod args;
mod cancel;
mod context;
mod disk;
mod error;
mod finisher;
pub mod inflater;
mod importer;
mod planner;
pub mod processor;

pub use args::{
  ImportArgs, ImportSource, InflationMethod, WORKER_IMAGE, bundled_workflow_dir, parse_labels,
};
pub use context::ImportContext;
pub use disk::PersistentDisk;
pub use error::ImportError;
pub use finisher::{BootableFinisher, DATA_DISK_LICENSE, DataDiskFinisher, Finisher, create_finisher};
pub use importer::{ImportOutcome, Importer};
pub use inflater::{ApiInflater, Inflater, WorkflowInflater, create_inflater};
pub use planner::{ProcessPlanner, ProcessingPlan};
pub use processor::{
  BootableDiskProcessor, InspectionProcessor, MetadataProcessor, Processor, build_chain,
};
