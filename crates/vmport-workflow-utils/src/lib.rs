//! vmport Workflow Utils
//!
//! Hooks applied to a populated workflow before it runs, and the lookups
//! the pipelines share:
//!
//! - [`ResourceLabeler`]: tracking and user labels on created resources
//! - [`apply_no_external_ip`] and [`NetworkSettings`]: instance networking
//! - [`build_id_from`]: the build ID used for tracking labels
//! - [`os`]: the supported OS table
//! - [`PrivacyFilterNotifier`]: privacy-tag handling for serial output

mod build_id;
mod labeler;
mod network;
pub mod os;
mod privacy;

pub use build_id::{BUILD_ID_ENV, build_id, build_id_from, random_suffix};
pub use labeler::{
  DiskLabelKeyRetriever, EXPORT_BUILD_ID_LABEL, EXPORT_LABEL, EXPORT_TMP_LABEL,
  IMPORT_BUILD_ID_LABEL, IMPORT_LABEL, IMPORT_TMP_LABEL, ImageLabelKeyRetriever,
  InstanceLabelKeyRetriever, ResourceLabeler,
};
pub use network::{NetworkSettings, apply_no_external_ip, region_of};
pub use os::{OsError, OsInfo};
pub use privacy::{PrivacyFilterNotifier, strip_privacy_info, strip_privacy_tags};
