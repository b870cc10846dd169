//! trialgrid-scheduler: decides which tasks of a job run next.
//!
//! The scheduler is pure bookkeeping over a [`trial_core::Job`] snapshot:
//! it never talks to the network or spawns anything. The driving loop asks
//! it for a [`Decision`], starts what it is told to, and reports back.

pub mod error;
pub mod scheduler;

pub use error::{SchedulerError, SchedulerResult};
pub use scheduler::{Decision, Scheduler, job_status_from_tasks};
