//! vmport Workflow Executor
//!
//! Runs validated [`Workflow`](vmport_workflow::Workflow) graphs against a
//! [`ComputeClient`](vmport_compute::ComputeClient):
//!
//! - steps run as soon as all of their prerequisites have completed, with no
//!   concurrency cap
//! - the first failure or cancellation stops scheduling and cancels in-flight
//!   steps
//! - every resource is recorded before its create call and deleted at the
//!   end of the run unless it is marked `no_cleanup` or the workflow keeps
//!   its resources
//! - wait steps poll serial console output and collect
//!   `<serial-output key:'k' value:'v'>` tags into the [`RunOutcome`]

mod error;
mod events;
mod executor;
mod handlers;
mod registry;
mod result;

pub use error::{ErrorKind, ExecutionError, FailureMatch, StepError};
pub use events::{ChannelNotifier, ExecutionEvent, ExecutionNotifier, NoopNotifier, RecordingNotifier};
pub use executor::{ExecutorConfig, WorkflowExecutor};
pub use registry::{CreatedResource, ResourceRegistry};
pub use result::{RunOutcome, parse_serial_tags, serial_tag};
