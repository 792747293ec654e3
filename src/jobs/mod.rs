//! Analysis jobs: the job table, the container wire protocol and the dispatcher.

pub mod dispatch;
pub mod model;
pub mod protocol;
pub mod registry;

pub use dispatch::{DispatchContext, Dispatcher, DispatcherConfig};
pub use model::{CONTAINER_LOG_FILE, Job, JobStatus, REPORT_FILE};
pub use registry::JobRegistry;
