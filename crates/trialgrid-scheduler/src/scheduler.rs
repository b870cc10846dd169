//! Scheduler: task ordering, status derivation and admission.
//!
//! ```text
//!   decide(job)
//!     ├─ task errored, nothing running ──► Finish(failed | crashed | aborted)
//!     ├─ task errored, others running  ──► Wait (no new starts)
//!     ├─ nothing running/next/pending  ──► Finish(done)
//!     ├─ runnable tasks                ──► Start([...])
//!     └─ otherwise                     ──► Wait
//! ```
//!
//! Running siblings of an errored task are left alone here; whether they
//! are cancelled is up to the driving loop.

use std::collections::{BTreeSet, HashSet};

use tracing::debug;
use trial_core::{AssignedResources, Job, JobResources, JobStatus, JobTask, TaskStatus};
use trialgrid_resources::{FitsStatus, NodeResources};

use crate::error::{SchedulerError, SchedulerResult};

/// What the driving loop should do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Start(Vec<String>),
    Wait,
    Finish(JobStatus),
}

#[derive(Debug, Default)]
pub struct Scheduler {
    /// Tasks handed to the driving loop and not reported finished.
    running: BTreeSet<String>,
    /// `(task, replica)` pairs already claimed for execution.
    claimed: HashSet<(String, u32)>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Running set ───────────────────────────────────────────────

    pub fn task_started(&mut self, task: &str) {
        self.running.insert(task.to_string());
    }

    pub fn task_finished(&mut self, task: &str) {
        self.running.remove(task);
    }

    pub fn is_running(&self, task: &str) -> bool {
        self.running.contains(task)
    }

    pub fn has_running(&self) -> bool {
        !self.running.is_empty()
    }

    pub fn running(&self) -> impl Iterator<Item = &String> {
        self.running.iter()
    }

    // ── Queries ───────────────────────────────────────────────────

    /// Tasks that have not started, whose dependencies are all done, and
    /// that are not already running. Configuration order.
    pub fn next_tasks_to_start(&self, job: &Job) -> Vec<String> {
        job.config
            .tasks
            .iter()
            .filter(|config| !self.running.contains(&config.name))
            .filter(|config| job.task(&config.name).is_some_and(|t| !t.is_started()))
            .filter(|config| {
                config
                    .depends_on
                    .iter()
                    .all(|dep| job.task(dep).is_some_and(|t| t.status == TaskStatus::Done))
            })
            .map(|config| config.name.clone())
            .collect()
    }

    /// Whether some task can still run: not ended, and no dependency
    /// errored.
    pub fn has_pending_tasks(job: &Job) -> bool {
        job.config.tasks.iter().any(|config| {
            let Some(task) = job.task(&config.name) else {
                return false;
            };
            !task.is_ended()
                && config
                    .depends_on
                    .iter()
                    .all(|dep| job.task(dep).is_none_or(|t| !t.is_errored()))
        })
    }

    /// First errored task in configuration order.
    pub fn errored_task(job: &Job) -> Option<&JobTask> {
        job.ordered_tasks().find(|t| t.is_errored())
    }

    pub fn decide(&self, job: &Job) -> Decision {
        if let Some(errored) = Self::errored_task(job) {
            if self.has_running() {
                debug!(task = %errored.name, "task errored, waiting for running tasks");
                return Decision::Wait;
            }
            return Decision::Finish(job_status_from_tasks(job));
        }

        let next = self.next_tasks_to_start(job);
        if next.is_empty() {
            if !self.has_running() && !Self::has_pending_tasks(job) {
                return Decision::Finish(JobStatus::Done);
            }
            return Decision::Wait;
        }
        Decision::Start(next)
    }

    // ── Claims ────────────────────────────────────────────────────

    /// Claim a replica for execution.
    ///
    /// Returns `false` if it was claimed before or has already started,
    /// so a replica is never executed twice.
    pub fn claim_instance(&mut self, job: &Job, task: &str, replica: u32) -> SchedulerResult<bool> {
        let record = job
            .task(task)
            .ok_or_else(|| SchedulerError::TaskNotFound(task.to_string()))?;
        let instance = record
            .instance(replica)
            .ok_or_else(|| SchedulerError::InstanceNotFound {
                task: task.to_string(),
                replica,
            })?;
        if instance.is_started() {
            return Ok(false);
        }
        Ok(self.claimed.insert((task.to_string(), replica)))
    }

    // ── Admission ─────────────────────────────────────────────────

    /// Reserve resources for one replica on the node's ledger.
    pub fn admit(
        &self,
        task: &str,
        req: &JobResources,
        ledger: &mut NodeResources,
    ) -> SchedulerResult<AssignedResources> {
        match ledger.requirement_fits(req) {
            FitsStatus::Fits => ledger
                .consume(req)
                .map_err(|e| SchedulerError::NotFree(format!("{task}: {e}"))),
            FitsStatus::NotFree => Err(SchedulerError::NotFree(task.to_string())),
            FitsStatus::NeverFits => Err(SchedulerError::NeverFits(task.to_string())),
        }
    }

    /// Whether all replicas would fit the node once it is idle.
    pub fn fits_ever(req: &JobResources, replicas: u32, ledger: &NodeResources) -> bool {
        let mut idle = ledger.unreserved();
        (0..replicas).all(|_| idle.requirement_fits(req) == FitsStatus::Fits && idle.consume(req).is_ok())
    }
}

/// Terminal job status from its tasks: crashed, then failed, then aborted,
/// otherwise done.
pub fn job_status_from_tasks(job: &Job) -> JobStatus {
    let statuses: Vec<TaskStatus> = job.tasks.values().map(|t| t.status).collect();
    for (task, status) in [
        (TaskStatus::Crashed, JobStatus::Crashed),
        (TaskStatus::Failed, JobStatus::Failed),
        (TaskStatus::Aborted, JobStatus::Aborted),
    ] {
        if statuses.contains(&task) {
            return status;
        }
    }
    JobStatus::Done
}

#[cfg(test)]
mod tests {
    use super::*;
    use trial_core::{JobConfig, JobTaskConfig};
    use trialgrid_resources::HostCapacity;

    fn test_job(tasks: &[(&str, &[&str])]) -> Job {
        let mut config = JobConfig::default();
        for (name, deps) in tasks {
            let mut task = JobTaskConfig::named(name);
            task.depends_on = deps.iter().map(|d| d.to_string()).collect();
            config.tasks.push(task);
        }
        Job::new("job-1", "token", config)
    }

    fn set_status(job: &mut Job, task: &str, status: TaskStatus) {
        job.task_mut(task).unwrap().status = status;
    }

    #[test]
    fn dependencies_gate_start() {
        let mut job = test_job(&[("a", &[]), ("b", &["a"]), ("c", &[])]);
        let mut scheduler = Scheduler::new();
        assert_eq!(scheduler.next_tasks_to_start(&job), vec!["a", "c"]);

        scheduler.task_started("a");
        set_status(&mut job, "a", TaskStatus::Started);
        assert_eq!(scheduler.next_tasks_to_start(&job), vec!["c"]);

        set_status(&mut job, "a", TaskStatus::Done);
        scheduler.task_finished("a");
        assert_eq!(scheduler.next_tasks_to_start(&job), vec!["b", "c"]);
    }

    #[test]
    fn failed_dependency_fails_job_and_blocks_dependents() {
        let mut job = test_job(&[("a", &[]), ("b", &["a"])]);
        let mut scheduler = Scheduler::new();
        assert_eq!(scheduler.decide(&job), Decision::Start(vec!["a".into()]));

        scheduler.task_started("a");
        set_status(&mut job, "a", TaskStatus::Started);
        assert_eq!(scheduler.decide(&job), Decision::Wait);

        set_status(&mut job, "a", TaskStatus::Failed);
        scheduler.task_finished("a");
        assert!(scheduler.next_tasks_to_start(&job).is_empty());
        assert!(!Scheduler::has_pending_tasks(&job));
        assert_eq!(scheduler.decide(&job), Decision::Finish(JobStatus::Failed));
    }

    #[test]
    fn errored_task_waits_for_running_siblings() {
        let mut job = test_job(&[("a", &[]), ("b", &[]), ("c", &["a"])]);
        let mut scheduler = Scheduler::new();
        scheduler.task_started("a");
        scheduler.task_started("b");
        set_status(&mut job, "a", TaskStatus::Crashed);
        set_status(&mut job, "b", TaskStatus::Started);
        scheduler.task_finished("a");

        assert_eq!(scheduler.decide(&job), Decision::Wait);
        set_status(&mut job, "b", TaskStatus::Aborted);
        scheduler.task_finished("b");
        assert_eq!(scheduler.decide(&job), Decision::Finish(JobStatus::Crashed));
        assert_eq!(Scheduler::errored_task(&job).unwrap().name, "a");
    }

    #[test]
    fn all_done_finishes() {
        let mut job = test_job(&[("a", &[]), ("b", &["a"])]);
        set_status(&mut job, "a", TaskStatus::Done);
        set_status(&mut job, "b", TaskStatus::Done);
        assert_eq!(Scheduler::new().decide(&job), Decision::Finish(JobStatus::Done));
    }

    #[test]
    fn claim_is_idempotent() {
        let mut job = test_job(&[("a", &[])]);
        let mut scheduler = Scheduler::new();
        assert!(scheduler.claim_instance(&job, "a", 0).unwrap());
        assert!(!scheduler.claim_instance(&job, "a", 0).unwrap());
        assert!(matches!(
            scheduler.claim_instance(&job, "a", 5),
            Err(SchedulerError::InstanceNotFound { .. })
        ));

        let mut other = Scheduler::new();
        job.task_mut("a").unwrap().instances[0].status = trial_core::InstanceStatus::Started;
        assert!(!other.claim_instance(&job, "a", 0).unwrap());
    }

    #[test]
    fn admission_reserves_or_refuses() {
        let scheduler = Scheduler::new();
        let mut ledger = NodeResources::from_capacity(&HostCapacity {
            cpu: 4,
            memory: 8,
            gpus: Vec::new(),
        });
        let req = JobResources {
            cpu: 3,
            ..Default::default()
        };

        let assigned = scheduler.admit("a", &req, &mut ledger).unwrap();
        assert_eq!(assigned.cpu, 3);
        assert!(matches!(
            scheduler.admit("a", &req, &mut ledger),
            Err(SchedulerError::NotFree(_))
        ));

        let huge = JobResources {
            cpu: 64,
            ..Default::default()
        };
        assert!(matches!(
            scheduler.admit("b", &huge, &mut ledger),
            Err(SchedulerError::NeverFits(_))
        ));
        assert!(Scheduler::fits_ever(&req, 1, &ledger));
        assert!(!Scheduler::fits_ever(&req, 2, &ledger));
    }
}
