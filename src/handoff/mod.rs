//! Filesystem hand-off between processes that share no memory.
//!
//! Delegation requests and worker reports travel through [`DirectoryQueue`]s;
//! task outcomes are published as [`ResultRecord`] files for out-of-band
//! pollers.

mod delegation;
mod queue;
mod report;
mod result;

pub use delegation::{DelegationRequest, DELEGATION_PREFIX};
pub use queue::{encode_key, write_atomic, Delivery, DirectoryQueue};
pub use report::{ReportKind, WorkerReport, REPORT_PREFIX};
pub use result::{ResultRecord, ResultStore};
