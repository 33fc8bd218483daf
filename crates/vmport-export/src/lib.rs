//! vmport Export
//!
//! Copies disks, images and whole instances out to Cloud Storage. Each disk
//! is read by a worker instance that converts it (or tars it up raw) and
//! uploads the result; instance exports also get a SHA1 manifest of the
//! destination folder.

mod args;
mod error;
mod exporter;
mod manifest;
mod reader;
pub mod workflows;

pub use args::{DEFAULT_INSTANCE_FORMAT, EXPORT_FORMATS, ExportArgs, ExportSource, WORKER_IMAGE};
pub use error::ExportError;
pub use exporter::{ExportOutcome, ExportedFile, Exporter};
pub use manifest::{generate_manifest, manifest_line, sha1_hex, write_manifest};
pub use reader::{ByteCounter, ByteCountingReader};
