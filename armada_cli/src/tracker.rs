use std::sync::Arc;
use std::time::Duration;

use armada_definitions::{Task, TaskStatus};

use super::asgard::{self, Asgard, RemoteTask};
use super::scheduler::Scheduler;
use super::store::DeploymentStore;
use super::{is_transient, Result};

/// Callbacks into the pipeline once a tracked task stops moving.
pub trait TaskOutcomes: Send + Sync {
    fn task_finished(&self, deployment_id: &str, task: Task);
    fn task_timed_out(&self, deployment_id: &str, task: Task);
}

/// Polls remote task URLs until they go terminal or the retry budget runs
/// out.
///
/// Each poll fetches the remote document, folds it into the stored task and
/// either finishes, times out, or reschedules itself with one retry fewer.
/// For every poll sequence that is at most `retries + 1` fetches.
#[derive(Clone)]
pub struct Tracker {
    scheduler: Arc<Scheduler>,
    asgard: Arc<Asgard>,
    store: Arc<DeploymentStore>,
    interval: Duration,
}

impl Tracker {
    pub fn new(
        scheduler: Arc<Scheduler>,
        asgard: Arc<Asgard>,
        store: Arc<DeploymentStore>,
        interval: Duration,
    ) -> Tracker {
        Tracker { scheduler, asgard, store, interval }
    }

    /// Begin polling `task.url`, invoking `outcomes` when tracking ends.
    pub fn track(
        &self,
        outcomes: &Arc<dyn TaskOutcomes>,
        deployment_id: &str,
        task: Task,
        retries: u32,
    ) {
        let tracker = self.clone();
        let outcomes = Arc::clone(outcomes);
        let id = deployment_id.to_string();
        self.scheduler.schedule(self.interval, move || {
            tracker.poll(&outcomes, &id, task, retries)
        });
    }

    fn poll(&self, outcomes: &Arc<dyn TaskOutcomes>, deployment_id: &str, mut task: Task, retries: u32) {
        match self.refresh(deployment_id, &mut task) {
            Ok(true) => outcomes.task_finished(deployment_id, task),
            Ok(false) => self.continue_or_time_out(outcomes, deployment_id, task, retries),
            Err(ref e) if is_transient(e) => {
                warn!(
                    "recoverable poll failure for {} task {}: {}",
                    deployment_id, task.task_id, e
                );
                self.continue_or_time_out(outcomes, deployment_id, task, retries)
            }
            Err(e) => {
                // not a failure class we recover from in place; the restart
                // sweep picks the deployment up again if the process bounces
                error!(
                    "abandoning poll of {} task {}: {}",
                    deployment_id, task.task_id, e
                );
            }
        }
    }

    fn continue_or_time_out(
        &self,
        outcomes: &Arc<dyn TaskOutcomes>,
        deployment_id: &str,
        task: Task,
        retries: u32,
    ) {
        if retries == 0 {
            outcomes.task_timed_out(deployment_id, task);
        } else {
            self.track(outcomes, deployment_id, task, retries - 1);
        }
    }

    /// One poll: fetch the remote document and fold it into the stored task.
    /// `Ok(true)` once the remote task is terminal.
    fn refresh(&self, deployment_id: &str, task: &mut Task) -> Result<bool> {
        let url = match task.url {
            Some(ref u) => u.clone(),
            None => bail!("task {} has no url to poll", task.task_id),
        };
        let remote = self.asgard.get_task(&url)?;
        merge_remote(task, &remote);
        self.store.update_task(deployment_id, task)?;
        Ok(remote.is_terminal())
    }
}

/// Fold the remote document's status, log and update time into our task.
pub fn merge_remote(task: &mut Task, remote: &RemoteTask) {
    if let Some(status) = remote_status(&remote.status) {
        task.status = status;
    }
    task.log = remote.log.iter().map(|l| asgard::normalize_log_line(l)).collect();
    if let Some(ref raw) = remote.updateTime {
        match asgard::parse_update_time(raw) {
            Ok(ts) => task.updated = Some(ts),
            Err(e) => warn!("unparseable updateTime '{}': {}", raw, e),
        }
    }
}

fn remote_status(status: &str) -> Option<TaskStatus> {
    match status {
        "completed" => Some(TaskStatus::Completed),
        "failed" => Some(TaskStatus::Failed),
        "terminated" => Some(TaskStatus::Terminated),
        "running" => Some(TaskStatus::Running),
        _ => None,
    }
}
