//! Job scheduling
//!
//! The scheduler decides which job runs next and who may submit more:
//!
//! - `queue`: per-tier FIFO queues served by weighted round-robin with aging
//! - `admission`: global overload protection with progressive tier shedding
//! - `quota`: per-tenant sliding-window page quotas
//! - `registry`: every known job, the dedup index and finished-job retention
//! - `dispatch`: the `Scheduler` tying them together behind one lock

mod admission;
mod dispatch;
mod queue;
mod quota;
mod registry;

pub use admission::AdmissionController;
pub use dispatch::{
    Assignment, CancelOutcome, JobOutcome, Scheduler, SchedulerStats, WorkerReport,
};
pub use queue::TieredQueue;
pub use quota::QuotaTracker;
pub use registry::JobRegistry;
