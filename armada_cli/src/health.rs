use std::sync::Arc;
use std::time::Duration;

use armada_definitions::Task;

use super::asgard::{AErrKind, Asgard};
use super::scheduler::Scheduler;
use super::store::DeploymentStore;
use super::tracker::TaskOutcomes;
use super::{is_transient, Error, Result};

/// What `wait-for-instance-health` is waiting for.
#[derive(Clone, Debug)]
pub struct InstanceCheck {
    pub environment: String,
    pub region: String,
    pub asg: String,
    /// Healthy instances needed before the task completes
    pub min: u64,
    pub port: u64,
    pub path: String,
}

/// What `wait-for-elb-health` is waiting for.
#[derive(Clone, Debug)]
pub struct ElbCheck {
    pub environment: String,
    pub region: String,
    pub asg: String,
    pub load_balancers: Vec<String>,
}

/// Scheduled polls for the two wait actions.
///
/// Same recovery model as the task tracker: transient failures spend
/// retries, anything else stops the poll and is left to the restart sweep.
#[derive(Clone)]
pub struct HealthWatcher {
    scheduler: Arc<Scheduler>,
    asgard: Arc<Asgard>,
    store: Arc<DeploymentStore>,
    client: reqwest::Client,
    interval: Duration,
}

impl HealthWatcher {
    pub fn new(
        scheduler: Arc<Scheduler>,
        asgard: Arc<Asgard>,
        store: Arc<DeploymentStore>,
        interval: Duration,
    ) -> Result<HealthWatcher> {
        // instance healthchecks answer fast or not at all
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(2))
            .timeout(Duration::from_secs(5))
            .build()?;
        Ok(HealthWatcher { scheduler, asgard, store, client, interval })
    }

    /// Poll instance healthchecks until at least `check.min` answer 2xx.
    pub fn await_instance_health(
        &self,
        outcomes: &Arc<dyn TaskOutcomes>,
        deployment_id: &str,
        task: Task,
        check: InstanceCheck,
        retries: u32,
    ) {
        let watcher = self.clone();
        let outcomes = Arc::clone(outcomes);
        let id = deployment_id.to_string();
        self.scheduler.schedule(self.interval, move || {
            watcher.poll_instances(&outcomes, &id, task, check, retries, None)
        });
    }

    fn poll_instances(
        &self,
        outcomes: &Arc<dyn TaskOutcomes>,
        deployment_id: &str,
        mut task: Task,
        check: InstanceCheck,
        retries: u32,
        last_count: Option<u64>,
    ) {
        match self.healthy_instances(&check) {
            Ok((healthy, total)) => {
                if last_count != Some(healthy) {
                    task.record(format!("{}/{} instances healthy", healthy, total));
                    self.persist(deployment_id, &task);
                }
                if healthy >= check.min {
                    outcomes.task_finished(deployment_id, task);
                    return;
                }
                if retries == 0 {
                    outcomes.task_timed_out(deployment_id, task);
                    return;
                }
                let watcher = self.clone();
                let outcomes = Arc::clone(outcomes);
                let id = deployment_id.to_string();
                self.scheduler.schedule(self.interval, move || {
                    watcher.poll_instances(&outcomes, &id, task, check, retries - 1, Some(healthy))
                });
            }
            Err(e) => self.recover_instances(outcomes, deployment_id, task, check, retries, last_count, e),
        }
    }

    fn recover_instances(
        &self,
        outcomes: &Arc<dyn TaskOutcomes>,
        deployment_id: &str,
        task: Task,
        check: InstanceCheck,
        retries: u32,
        last_count: Option<u64>,
        e: Error,
    ) {
        if !is_transient(&e) {
            error!("abandoning instance-health poll of {}: {}", deployment_id, e);
            return;
        }
        warn!("recoverable instance-health failure for {}: {}", deployment_id, e);
        if retries == 0 {
            outcomes.task_timed_out(deployment_id, task);
            return;
        }
        let watcher = self.clone();
        let outcomes = Arc::clone(outcomes);
        let id = deployment_id.to_string();
        self.scheduler.schedule(self.interval, move || {
            watcher.poll_instances(&outcomes, &id, task, check, retries - 1, last_count)
        });
    }

    /// Count instances of the group whose healthcheck endpoint answers 2xx.
    fn healthy_instances(&self, check: &InstanceCheck) -> Result<(u64, u64)> {
        let group = self
            .asgard
            .show_group(&check.environment, &check.region, &check.asg)?
            .ok_or_else(|| {
                Error::from(AErrKind::MissingAsg(check.asg.clone(), check.region.clone()))
            })?;
        let total = group.instances.len() as u64;
        let mut healthy = 0;
        for instance in &group.instances {
            let details =
                self.asgard
                    .show_instance(&check.environment, &check.region, &instance.instanceId)?;
            let ip = match details.privateIpAddress {
                Some(ip) => ip,
                None => continue,
            };
            let url = format!("http://{}:{}{}", ip, check.port, check.path);
            // an unreachable or unhappy instance is simply not healthy yet
            match self.client.get(&url).send() {
                Ok(res) if res.status().is_success() => healthy += 1,
                Ok(res) => debug!("{} answered {}", url, res.status()),
                Err(e) => debug!("{} unreachable: {}", url, e),
            }
        }
        Ok((healthy, total))
    }

    /// Poll the load balancers until every instance of the group is in
    /// service with each of them.
    pub fn await_elb_health(
        &self,
        outcomes: &Arc<dyn TaskOutcomes>,
        deployment_id: &str,
        task: Task,
        check: ElbCheck,
        retries: u32,
    ) {
        let watcher = self.clone();
        let outcomes = Arc::clone(outcomes);
        let id = deployment_id.to_string();
        self.scheduler.schedule(self.interval, move || {
            watcher.poll_elb(&outcomes, &id, task, check, retries)
        });
    }

    fn poll_elb(
        &self,
        outcomes: &Arc<dyn TaskOutcomes>,
        deployment_id: &str,
        mut task: Task,
        check: ElbCheck,
        retries: u32,
    ) {
        match self.all_in_service(&check) {
            Ok(true) => {
                task.record("All instances in service");
                self.persist(deployment_id, &task);
                outcomes.task_finished(deployment_id, task);
            }
            Ok(false) => {
                if retries == 0 {
                    outcomes.task_timed_out(deployment_id, task);
                    return;
                }
                let watcher = self.clone();
                let outcomes = Arc::clone(outcomes);
                let id = deployment_id.to_string();
                self.scheduler.schedule(self.interval, move || {
                    watcher.poll_elb(&outcomes, &id, task, check, retries - 1)
                });
            }
            Err(ref e) if is_transient(e) => {
                warn!("recoverable ELB poll failure for {}: {}", deployment_id, e);
                if retries == 0 {
                    outcomes.task_timed_out(deployment_id, task);
                    return;
                }
                let watcher = self.clone();
                let outcomes = Arc::clone(outcomes);
                let id = deployment_id.to_string();
                self.scheduler.schedule(self.interval, move || {
                    watcher.poll_elb(&outcomes, &id, task, check, retries - 1)
                });
            }
            Err(e) => error!("abandoning ELB poll of {}: {}", deployment_id, e),
        }
    }

    fn all_in_service(&self, check: &ElbCheck) -> Result<bool> {
        let group = self
            .asgard
            .show_group(&check.environment, &check.region, &check.asg)?
            .ok_or_else(|| {
                Error::from(AErrKind::MissingAsg(check.asg.clone(), check.region.clone()))
            })?;
        if group.instances.is_empty() {
            return Ok(false);
        }
        for lb in &check.load_balancers {
            let state = self
                .asgard
                .show_load_balancer(&check.environment, &check.region, lb)?;
            for instance in &group.instances {
                let in_service = state.instanceStates.iter().any(|s| {
                    s.instanceId == instance.instanceId && s.state == "InService"
                });
                if !in_service {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    fn persist(&self, deployment_id: &str, task: &Task) {
        if let Err(e) = self.store.update_task(deployment_id, task) {
            warn!("could not persist progress of {}: {}", deployment_id, e);
        }
    }
}
