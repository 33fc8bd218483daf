//! vmport Upgrade
//!
//! In-place upgrade of a Windows Server instance. The [`Upgrader`] checks the
//! boot disk's license, derives the names of everything it will create
//! ([`DerivedVars`]) and then runs phases through a [`PhaseRunner`]:
//!
//! - prepare: back up the instance, swap the OS disk for an upgradable
//!   copy, attach install media and install the upgrade script;
//! - upgrade: boot and wait for the script's result;
//! - reboot and retry-upgrade, when Windows asks for a restart first;
//! - rollback or cleanup after a failure.
//!
//! [`WorkflowPhaseRunner`] turns each phase into a workflow and executes it.

mod args;
mod error;
pub mod phases;
mod recovery;
mod runner;
mod upgrader;
mod vars;

pub use args::{InstanceRef, UPGRADE_PATHS, UpgradeArgs, UpgradePath, upgrade_path};
pub use error::{PhaseError, Recovery, UpgradeError};
pub use phases::LiveState;
pub use recovery::{manual_cleanup_steps, manual_rollback_steps};
pub use runner::{Phase, PhaseRunner, WorkflowPhaseRunner};
pub use upgrader::{UpgradeOutcome, Upgrader};
pub use vars::{
  DerivedVars, STARTUP_SCRIPT_URL_BACKUP_KEY, STARTUP_SCRIPT_URL_KEY, UPGRADE_SCRIPT_KEY,
  derive_vars, original_startup_script_url, validate_license,
};
