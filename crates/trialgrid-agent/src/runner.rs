//! Local job runner: drives a whole job on this machine.
//!
//! ```text
//!   decide ──Start(tasks)──► queue replicas ──admit──► spawn executor
//!     ▲                            │ not free: retry next pass
//!     │                            └ never fits: task crashed
//!     └──────── instance ended ◄── JoinSet
//! ```
//!
//! The ledger is recomputed from the running replicas on every pass, so a
//! finished replica frees its reservation without bookkeeping.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use trial_core::{
    AssignedResources, AssignedTaskInstance, EXIT_ABORTED, EXIT_CRASHED, EXIT_FAILED, InstanceStatus, Job,
    JobStatus, StartPolicy, TaskStatus, epoch_secs, instance_key, status_for_exit_code,
};
use trialgrid_executor::{ContainerRuntime, ExecutorConfig, ExecutorResult, TaskExecutor, cancelled};
use trialgrid_metrics::{GpuReader, HostProbe};
use trialgrid_resources::{HostCapacity, compute_resources};
use trialgrid_scheduler::{Decision, Scheduler, SchedulerError};
use trialgrid_sync::{InstanceChange, JobPatch, JobStorage, TaskChange};

use crate::error::AgentResult;

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub executor: ExecutorConfig,
    pub capacity: HostCapacity,
    pub policy: StartPolicy,
    /// Abort running replicas once any task errors.
    pub cancel_siblings_on_failure: bool,
    /// How often replicas waiting for resources are retried.
    pub retry_interval: Duration,
    pub gpus: GpuReader,
    /// Node name recorded on every instance.
    pub node: String,
}

impl RunnerConfig {
    pub fn new(capacity: HostCapacity) -> Self {
        Self {
            executor: ExecutorConfig::default(),
            capacity,
            policy: StartPolicy::local(),
            cancel_siblings_on_failure: true,
            retry_interval: Duration::from_secs(1),
            gpus: GpuReader::new(),
            node: "local".to_string(),
        }
    }
}

fn sentinel(status: JobStatus) -> i32 {
    match status {
        JobStatus::Aborted => EXIT_ABORTED,
        JobStatus::Failed => EXIT_FAILED,
        _ => EXIT_CRASHED,
    }
}

type Replica = (String, u32);

pub struct JobRunner {
    storage: Arc<JobStorage>,
    runtime: Arc<dyn ContainerRuntime>,
    probe: Arc<dyn HostProbe>,
    config: RunnerConfig,
}

/// State of one `run`.
struct Pass {
    scheduler: Scheduler,
    waiting: VecDeque<Replica>,
    active: BTreeMap<Replica, AssignedTaskInstance>,
    running: JoinSet<ExecutorResult<i32>>,
    ids: HashMap<tokio::task::Id, Replica>,
    abort_tx: watch::Sender<bool>,
    aborting: bool,
}

impl Pass {
    fn has_work(&self, task: &str) -> bool {
        self.active.keys().chain(self.waiting.iter()).any(|(t, _)| t == task)
    }
}

impl JobRunner {
    pub fn new(
        storage: Arc<JobStorage>,
        runtime: Arc<dyn ContainerRuntime>,
        probe: Arc<dyn HostProbe>,
        config: RunnerConfig,
    ) -> Self {
        Self {
            storage,
            runtime,
            probe,
            config,
        }
    }

    /// Run the job to its end. Returns `0` when it is done, otherwise the
    /// exit code of the task that ended it.
    pub async fn run(&self, mut cancel: watch::Receiver<bool>) -> AgentResult<i32> {
        let job_id = self.storage.with_job(|j| j.id.clone());
        info!(%job_id, "job started");
        self.storage.patch_job(JobPatch::Status(JobStatus::Running))?;
        self.storage.patch_job(JobPatch::Started(epoch_secs()))?;

        let (abort_tx, _) = watch::channel(false);
        let mut pass = Pass {
            scheduler: Scheduler::new(),
            waiting: VecDeque::new(),
            active: BTreeMap::new(),
            running: JoinSet::new(),
            ids: HashMap::new(),
            abort_tx,
            aborting: false,
        };

        loop {
            self.settle(&mut pass)?;
            let job = self.storage.job();

            if pass.aborting {
                if pass.running.is_empty() {
                    return self.finish(JobStatus::Aborted);
                }
            } else {
                let decision = pass.scheduler.decide(&job);
                match &decision {
                    Decision::Finish(status) => return self.finish(*status),
                    Decision::Start(tasks) => self.queue_tasks(&mut pass, &job, tasks)?,
                    Decision::Wait => {}
                }
                self.admit_waiting(&mut pass)?;

                if pass.running.is_empty() && pass.waiting.is_empty() {
                    if decision == Decision::Wait {
                        error!(%job_id, "no task can run");
                        return self.finish(JobStatus::Crashed);
                    }
                    continue;
                }
            }

            tokio::select! {
                Some(joined) = pass.running.join_next_with_id() => {
                    let (id, result) = match joined {
                        Ok((id, result)) => (id, result),
                        Err(e) => {
                            error!(error = %e, "executor task panicked");
                            (e.id(), Ok(EXIT_CRASHED))
                        }
                    };
                    if let Some(replica) = pass.ids.remove(&id) {
                        let code = result.unwrap_or_else(|e| {
                            warn!(error = %e, "executor refused to run");
                            EXIT_CRASHED
                        });
                        self.on_instance_end(&mut pass, replica, code)?;
                    }
                }
                _ = cancelled(&mut cancel), if !pass.aborting => {
                    info!(%job_id, "job abort requested");
                    pass.aborting = true;
                    pass.waiting.clear();
                    pass.abort_tx.send_replace(true);
                }
                _ = tokio::time::sleep(self.config.retry_interval), if !pass.waiting.is_empty() => {}
            }
        }
    }

    fn queue_tasks(&self, pass: &mut Pass, job: &Job, tasks: &[String]) -> AgentResult<()> {
        for task in tasks {
            let replicas = job.config.task(task).map(|t| t.replicas()).unwrap_or(1);
            debug!(%task, replicas, "task started");
            pass.scheduler.task_started(task);
            self.storage.patch_task(task, TaskChange::Status(TaskStatus::Started))?;
            self.storage.patch_task(task, TaskChange::Started(epoch_secs()))?;
            pass.waiting.extend((0..replicas).map(|r| (task.clone(), r)));
        }
        Ok(())
    }

    fn admit_waiting(&self, pass: &mut Pass) -> AgentResult<()> {
        let job = self.storage.job();
        let mut ledger = compute_resources(&self.config.capacity, pass.active.values());
        let mut still_waiting = VecDeque::new();
        let mut crashed = BTreeSet::new();

        while let Some((task, replica)) = pass.waiting.pop_front() {
            if crashed.contains(&task) {
                continue;
            }
            let Some(task_config) = job.config.task(&task) else {
                continue;
            };
            match pass.scheduler.admit(&task, &task_config.settings.resources, &mut ledger) {
                Ok(assigned) => {
                    if pass.scheduler.claim_instance(&job, &task, replica)? {
                        self.spawn_instance(pass, &job, (task, replica), assigned)?;
                    }
                }
                Err(SchedulerError::NotFree(_)) => still_waiting.push_back((task, replica)),
                Err(SchedulerError::NeverFits(_)) => {
                    warn!(%task, "resources never fit this node");
                    self.crash_task(&task, replica)?;
                    crashed.insert(task);
                }
                Err(e) => return Err(e.into()),
            }
        }

        pass.waiting = still_waiting;
        let errored = self.storage.with_job(|j| j.tasks.values().any(|t| t.is_errored()));
        if errored {
            pass.waiting.clear();
        }
        Ok(())
    }

    fn crash_task(&self, task: &str, replica: u32) -> AgentResult<()> {
        self.storage
            .patch_instance(task, replica, InstanceChange::Error("resources never fit this node".into()))?;
        self.storage
            .patch_instance(task, replica, InstanceChange::Status(InstanceStatus::Crashed))?;
        self.storage.patch_task(task, TaskChange::Status(TaskStatus::Crashed))?;
        self.storage.patch_task(task, TaskChange::ExitCode(EXIT_CRASHED))?;
        self.storage.patch_task(task, TaskChange::Ended(epoch_secs()))?;
        Ok(())
    }

    fn spawn_instance(
        &self,
        pass: &mut Pass,
        job: &Job,
        (task, replica): Replica,
        assigned: AssignedResources,
    ) -> AgentResult<()> {
        let Some(task_config) = job.config.task(&task).cloned() else {
            return Ok(());
        };
        self.storage
            .patch_instance(&task, replica, InstanceChange::Node(self.config.node.clone()))?;
        self.storage
            .patch_instance(&task, replica, InstanceChange::AssignedResources(assigned.clone()))?;
        self.storage
            .patch_instance(&task, replica, InstanceChange::Status(InstanceStatus::CheckoutFiles))?;

        debug!(%task, replica, cpu = assigned.cpu, memory = assigned.memory, "instance admitted");
        pass.active.insert(
            (task.clone(), replica),
            AssignedTaskInstance {
                job_id: job.id.clone(),
                job_access_token: job.access_token.clone(),
                task_name: task.clone(),
                instance: replica,
                assigned_resources: assigned,
            },
        );

        let executor = TaskExecutor::new(
            self.storage.clone(),
            self.runtime.clone(),
            self.probe.clone(),
            self.config.policy.clone(),
            task_config,
            replica,
            self.config.executor.clone(),
        )
        .with_gpu_reader(self.config.gpus.clone());
        let abort = pass.abort_tx.subscribe();
        let handle = pass.running.spawn(async move { executor.start(true, abort).await });
        pass.ids.insert(handle.id(), (task, replica));
        Ok(())
    }

    fn on_instance_end(&self, pass: &mut Pass, (task, replica): Replica, code: i32) -> AgentResult<()> {
        let key = instance_key(&self.storage.with_job(|j| j.id.clone()), replica, &task);
        pass.active.remove(&(task.clone(), replica));
        info!(%key, code, "instance ended");
        if code == 0 {
            return Ok(());
        }

        let status = status_for_exit_code(code).as_task_status().unwrap_or(TaskStatus::Crashed);
        let (already_errored, exit_code) = self.storage.with_job(|j| {
            let errored = j.task(&task).is_some_and(|t| t.is_errored());
            let exit = j.instance(&task, replica).and_then(|i| i.exit_code);
            (errored, exit.unwrap_or(code))
        });
        if !already_errored {
            self.storage.patch_task(&task, TaskChange::Status(status))?;
            self.storage.patch_task(&task, TaskChange::ExitCode(exit_code))?;
            self.storage.patch_task(&task, TaskChange::Ended(epoch_secs()))?;
        }

        pass.waiting.clear();
        if self.config.cancel_siblings_on_failure && !pass.running.is_empty() {
            info!(%task, "task errored, aborting running replicas");
            pass.abort_tx.send_replace(true);
        }
        Ok(())
    }

    /// Report tasks with no running or waiting replica as finished and
    /// give them their final status.
    fn settle(&self, pass: &mut Pass) -> AgentResult<()> {
        let idle: Vec<String> = pass
            .scheduler
            .running()
            .filter(|task| !pass.has_work(task))
            .cloned()
            .collect();
        for task in idle {
            pass.scheduler.task_finished(&task);
            let Some(record) = self.storage.with_job(|j| j.task(&task).cloned()) else {
                continue;
            };
            if record.is_ended() {
                continue;
            }
            let status = record.status_from_instances();
            if !status.is_ended() {
                continue;
            }
            debug!(%task, ?status, "task finished");
            self.storage.patch_task(&task, TaskChange::Status(status))?;
            if status == TaskStatus::Done {
                self.storage.patch_task(&task, TaskChange::ExitCode(0))?;
            }
            self.storage.patch_task(&task, TaskChange::Ended(epoch_secs()))?;
        }
        Ok(())
    }

    fn finish(&self, status: JobStatus) -> AgentResult<i32> {
        self.storage.patch_job(JobPatch::Status(status))?;
        self.storage.patch_job(JobPatch::Ended(epoch_secs()))?;
        let code = if status == JobStatus::Done {
            0
        } else {
            // The task that set the job status, not a sibling aborted after it.
            self.storage.with_job(|job| {
                job.ordered_tasks()
                    .find(|t| t.status.as_job_status() == Some(status))
                    .or_else(|| Scheduler::errored_task(job))
                    .and_then(|t| t.exit_code)
                    .unwrap_or(sentinel(status))
            })
        };
        info!(?status, code, "job ended");
        Ok(code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinels_follow_job_status() {
        assert_eq!(sentinel(JobStatus::Aborted), EXIT_ABORTED);
        assert_eq!(sentinel(JobStatus::Failed), EXIT_FAILED);
        assert_eq!(sentinel(JobStatus::Crashed), EXIT_CRASHED);
    }

    #[test]
    fn local_defaults() {
        let config = RunnerConfig::new(HostCapacity::default());
        assert!(config.cancel_siblings_on_failure);
        assert!(config.policy.host_execution_allowed);
        assert_eq!(config.node, "local");
    }
}
