use std::sync::Arc;

use chrono::Utc;
use regex::Regex;

use armada_definitions::{Config, Deployment, Parameters, Task, TaskAction, TaskStatus};

use super::asgard::{AErrKind, Asgard, ClusterAction};
use super::health::{ElbCheck, HealthWatcher, InstanceCheck};
use super::kv::Kv;
use super::store::DeploymentStore;
use super::tracker::{TaskOutcomes, Tracker};
use super::transform;
use super::{Error, Result};

/// Why a task is not going to run, when it isn't.
pub fn skip_reason(action: TaskAction, params: &Parameters) -> Option<String> {
    match action {
        TaskAction::WaitForInstanceHealth => {
            if params.min().unwrap_or(0) == 0 {
                Some("Skipping instance healthcheck".into())
            } else {
                None
            }
        }
        TaskAction::WaitForElbHealth => {
            let elb = params.health_check_type().map(|t| t == "ELB").unwrap_or(false);
            if !elb || params.selected_load_balancers().is_empty() {
                Some("Skipping ELB healthcheck".into())
            } else {
                None
            }
        }
        TaskAction::DisableAsg => {
            if params.old_asg_name().is_none() {
                Some("Skipping disable; no previous auto scaling group".into())
            } else {
                None
            }
        }
        TaskAction::DeleteAsg => {
            if params.old_asg_name().is_none() {
                Some("Skipping delete; no previous auto scaling group".into())
            } else {
                None
            }
        }
        TaskAction::CreateAsg | TaskAction::EnableAsg => None,
    }
}

/// How a dispatched action left its task.
enum Dispatch {
    /// A poller owns the task now and will call back
    Waiting,
    /// The action finished inline
    Done,
}

/// The per-deployment state machine.
///
/// Tasks run strictly in list order; a task's terminal callback
/// happens-before its successor starts, and operator pause/cancel requests
/// land between tasks, never inside one.
#[derive(Clone)]
pub struct Engine {
    pub config: Arc<Config>,
    pub kv: Arc<Kv>,
    pub store: Arc<DeploymentStore>,
    pub asgard: Arc<Asgard>,
    pub tracker: Tracker,
    pub health: HealthWatcher,
}

impl Engine {
    pub fn new(
        config: Arc<Config>,
        kv: Arc<Kv>,
        store: Arc<DeploymentStore>,
        asgard: Arc<Asgard>,
        tracker: Tracker,
        health: HealthWatcher,
    ) -> Engine {
        Engine { config, kv, store, asgard, tracker, health }
    }

    fn outcomes(&self) -> Arc<dyn TaskOutcomes> {
        Arc::new(self.clone())
    }

    fn retries(&self) -> u32 {
        self.config.tracker.retries
    }

    fn fetch(&self, id: &str) -> Result<Deployment> {
        self.store
            .get(id)?
            .ok_or_else(|| format_err!("no deployment {}", id))
    }

    /// Begin a deployment: stamp `start` and run the first task.
    pub fn start_deployment(&self, deployment_id: &str) -> Result<()> {
        let mut dep = self.fetch(deployment_id)?;
        if dep.start.is_none() {
            dep.start = Some(Utc::now());
            self.store.upsert(&dep)?;
        }
        info!(
            "starting deployment {} of {} ({}) in {}/{}",
            deployment_id, dep.application, dep.ami, dep.environment, dep.region
        );
        match dep.next_pending().map(|t| t.task_id.clone()) {
            Some(task_id) => self.start_task(deployment_id, &task_id),
            None => {
                warn!("deployment {} has nothing to do", deployment_id);
                self.finalize(dep)
            }
        }
    }

    /// Start one task: stamp it running, apply skip rules, dispatch.
    ///
    /// A task whose dispatch fails takes the whole deployment down with it,
    /// which counts as handled here; only store trouble errors out.
    pub fn start_task(&self, deployment_id: &str, task_id: &str) -> Result<()> {
        let dep = self.fetch(deployment_id)?;
        let mut task = dep
            .task(task_id)
            .cloned()
            .ok_or_else(|| format_err!("deployment {} has no task {}", deployment_id, task_id))?;

        task.start = Some(Utc::now());
        if let Some(reason) = skip_reason(task.action, &dep.parameters) {
            info!("{}: {}", deployment_id, reason);
            task.record(reason);
            return self.conclude_task(deployment_id, task, TaskStatus::Skipped);
        }

        task.status = TaskStatus::Running;
        self.store.update_task(deployment_id, &task)?;
        info!("{}: task {} ({})", deployment_id, task.task_id, task.action);

        let dispatched = match task.action {
            TaskAction::CreateAsg => self.create_asg(&dep, &mut task),
            TaskAction::WaitForInstanceHealth => self.wait_for_instance_health(&dep, &task),
            TaskAction::EnableAsg => self.toggle_asg(&dep, &mut task, ClusterAction::Activate),
            TaskAction::WaitForElbHealth => self.wait_for_elb_health(&dep, &task),
            TaskAction::DisableAsg => self.toggle_asg(&dep, &mut task, ClusterAction::Deactivate),
            TaskAction::DeleteAsg => self.toggle_asg(&dep, &mut task, ClusterAction::Delete),
        };
        match dispatched {
            Ok(Dispatch::Waiting) => Ok(()),
            Ok(Dispatch::Done) => self.conclude_task(deployment_id, task, TaskStatus::Completed),
            Err(e) => {
                self.fail_deployment(deployment_id, task, &e);
                Ok(())
            }
        }
    }

    /// Task 1. New clusters go through the save endpoint and finish inline;
    /// existing clusters cut their next generation as a tracked remote task.
    fn create_asg(&self, dep: &Deployment, task: &mut Task) -> Result<Dispatch> {
        let cluster = dep.cluster();
        let groups = self
            .asgard
            .show_cluster(&dep.environment, &dep.region, &cluster)?
            .unwrap_or_default();

        if let Some(last) = groups.last() {
            let old = last.autoScalingGroupName.clone();
            let mut owned = Parameters::new();
            owned.set("old_asg_name", old.clone());
            self.store.merge_parameters(&dep.id, &owned)?;
            task.record(format!("Previous auto scaling group is '{}'", old));

            let fields = vec![
                ("name".to_string(), cluster.clone()),
                ("ticket".to_string(), dep.id.clone()),
            ];
            let url = self
                .asgard
                .create_next_group(&dep.environment, &dep.region, &fields)?;
            task.url = Some(url);
            self.store.update_task(&dep.id, task)?;
            self.tracker
                .track(&self.outcomes(), &dep.id, task.clone(), self.retries());
            Ok(Dispatch::Waiting)
        } else {
            let fields = transform::launch_fields(&self.config, &self.asgard, dep)?;
            let name = self
                .asgard
                .create_auto_scaling_group(&dep.environment, &dep.region, &fields)?;
            let mut owned = Parameters::new();
            owned.set("new_asg_name", name.clone());
            self.store.merge_parameters(&dep.id, &owned)?;
            task.record(format!("Created auto scaling group '{}'", name));
            Ok(Dispatch::Done)
        }
    }

    /// Tasks 3, 5 and 6: traffic and lifecycle changes on a named group.
    fn toggle_asg(
        &self,
        dep: &Deployment,
        task: &mut Task,
        action: ClusterAction,
    ) -> Result<Dispatch> {
        let name = match action {
            ClusterAction::Activate => dep.parameters.new_asg_name(),
            _ => dep.parameters.old_asg_name(),
        }
        .ok_or_else(|| format_err!("no target group recorded for {} on {}", task.action, dep.id))?;

        self.ensure_group_exists(&dep.environment, &dep.region, &name)?;
        let url = self
            .asgard
            .cluster_action(&dep.environment, &dep.region, action, &name, &dep.id)?;
        task.record(format!("{} '{}'", action.describe(), name));
        task.url = Some(url);
        self.store.update_task(&dep.id, task)?;
        self.tracker
            .track(&self.outcomes(), &dep.id, task.clone(), self.retries());
        Ok(Dispatch::Waiting)
    }

    /// Precondition for every remote-mutating action on an existing group.
    fn ensure_group_exists(&self, environment: &str, region: &str, asg: &str) -> Result<()> {
        if self.asgard.show_group(environment, region, asg)?.is_none() {
            return Err(AErrKind::MissingAsg(asg.to_string(), region.to_string()).into());
        }
        Ok(())
    }

    /// Task 2: instance healthchecks on the new group.
    fn wait_for_instance_health(&self, dep: &Deployment, task: &Task) -> Result<Dispatch> {
        let asg = dep
            .parameters
            .new_asg_name()
            .ok_or_else(|| format_err!("no new group recorded for {}", dep.id))?;
        let check = InstanceCheck {
            environment: dep.environment.clone(),
            region: dep.region.clone(),
            asg,
            min: dep.parameters.min().unwrap_or(0),
            port: dep
                .parameters
                .healthcheck_port()
                .unwrap_or(self.config.defaults.healthcheck_port),
            path: dep
                .parameters
                .healthcheck_path()
                .unwrap_or_else(|| self.config.defaults.healthcheck_path.clone()),
        };
        self.health
            .await_instance_health(&self.outcomes(), &dep.id, task.clone(), check, self.retries());
        Ok(Dispatch::Waiting)
    }

    /// Task 4: the load balancers must report every instance in service.
    fn wait_for_elb_health(&self, dep: &Deployment, task: &Task) -> Result<Dispatch> {
        let asg = dep
            .parameters
            .new_asg_name()
            .ok_or_else(|| format_err!("no new group recorded for {}", dep.id))?;
        let check = ElbCheck {
            environment: dep.environment.clone(),
            region: dep.region.clone(),
            asg,
            load_balancers: dep.parameters.selected_load_balancers(),
        };
        self.health
            .await_elb_health(&self.outcomes(), &dep.id, task.clone(), check, self.retries());
        Ok(Dispatch::Waiting)
    }

    /// Stamp a task terminal and take the deployment past it.
    fn conclude_task(&self, deployment_id: &str, mut task: Task, status: TaskStatus) -> Result<()> {
        task.end = Some(Utc::now());
        task.status = status;
        self.store.update_task(deployment_id, &task)?;
        self.advance(deployment_id)
    }

    /// Operator requests land here, between tasks.
    pub fn advance(&self, deployment_id: &str) -> Result<()> {
        let mut dep = self.fetch(deployment_id)?;
        let coordinate = dep.coordinate();

        if self.kv.cancel_registered(&coordinate)? {
            info!("cancelling {} at task boundary", deployment_id);
            dep.skip_remaining("Skipping: deployment cancelled");
            return self.finalize(dep);
        }
        if self.kv.pause_registered(&coordinate)? {
            info!("pausing {} at task boundary", deployment_id);
            self.kv.register_paused(&coordinate, deployment_id)?;
            self.kv.unregister_pause(&coordinate)?;
            return Ok(());
        }
        match dep.next_pending().map(|t| t.task_id.clone()) {
            Some(task_id) => self.start_task(deployment_id, &task_id),
            None => self.finalize(dep),
        }
    }

    /// Pick a tracked task back up after a restart, with a fresh budget.
    pub fn resume_tracking(&self, deployment_id: &str, task: Task) {
        self.tracker
            .track(&self.outcomes(), deployment_id, task, self.retries());
    }

    /// Set `end` and clear every coordination entry.
    fn finalize(&self, mut dep: Deployment) -> Result<()> {
        dep.end = Some(Utc::now());
        self.store.upsert(&dep)?;
        self.kv.end_deployment(&dep.coordinate())?;
        info!("deployment {} finished", dep.id);
        Ok(())
    }

    /// A task, and with it the deployment, is beyond saving.
    fn fail_deployment(&self, deployment_id: &str, mut task: Task, err: &Error) {
        error!("{}: task {} failed: {}", deployment_id, task.task_id, err);
        task.record(format!("Task failed: {}", err));
        task.end = Some(Utc::now());
        task.status = TaskStatus::Failed;
        if let Err(e) = self.store.update_task(deployment_id, &task) {
            error!("could not record failure of {}: {}", deployment_id, e);
        }
        match self.fetch(deployment_id) {
            Ok(dep) => {
                if let Err(e) = self.finalize(dep) {
                    error!("could not finalize {}: {}", deployment_id, e);
                }
            }
            Err(e) => error!("could not load {} to finalize it: {}", deployment_id, e),
        }
    }

    /// Post-terminal bookkeeping. `Ok(true)` means move to the next task.
    fn on_finished(&self, deployment_id: &str, task: &mut Task) -> Result<bool> {
        if task.end.is_none() {
            task.end = Some(Utc::now());
        }
        if task.status == TaskStatus::Failed || task.status == TaskStatus::Terminated {
            self.store.update_task(deployment_id, task)?;
            error!(
                "{}: remote task {} ended {:?}",
                deployment_id, task.task_id, task.status
            );
            let dep = self.fetch(deployment_id)?;
            self.finalize(dep)?;
            return Ok(false);
        }
        if !task.status.is_terminal() {
            task.status = TaskStatus::Completed;
        }
        self.store.update_task(deployment_id, task)?;
        if task.action == TaskAction::CreateAsg {
            self.record_created_group(deployment_id, task)?;
        }
        Ok(true)
    }

    /// The next-group task names the generation it cut only in its log.
    fn record_created_group(&self, deployment_id: &str, task: &Task) -> Result<()> {
        let dep = self.fetch(deployment_id)?;
        if dep.parameters.new_asg_name().is_some() {
            return Ok(());
        }
        let re = Regex::new(r"Creating auto scaling group '([^']+)'")?;
        for entry in &task.log {
            if let Some(caps) = re.captures(&entry.message) {
                let mut owned = Parameters::new();
                owned.set("new_asg_name", caps[1].to_string());
                self.store.merge_parameters(deployment_id, &owned)?;
                return Ok(());
            }
        }
        Err(AErrKind::TaskMissing(format!("create task for cluster {}", dep.cluster())).into())
    }
}

impl TaskOutcomes for Engine {
    fn task_finished(&self, deployment_id: &str, mut task: Task) {
        match self.on_finished(deployment_id, &mut task) {
            Ok(true) => {
                if let Err(e) = self.advance(deployment_id) {
                    error!("could not advance {}: {}", deployment_id, e);
                }
            }
            Ok(false) => {}
            Err(e) => self.fail_deployment(deployment_id, task, &e),
        }
    }

    fn task_timed_out(&self, deployment_id: &str, mut task: Task) {
        warn!("{}: task {} timed out", deployment_id, task.task_id);
        task.record("Timed out waiting for the remote task");
        task.end = Some(Utc::now());
        task.status = TaskStatus::Failed;
        if let Err(e) = self.store.update_task(deployment_id, &task) {
            error!("could not record timeout of {}: {}", deployment_id, e);
        }
        match self.fetch(deployment_id) {
            Ok(dep) => {
                if let Err(e) = self.finalize(dep) {
                    error!("could not finalize {}: {}", deployment_id, e);
                }
            }
            Err(e) => error!("could not load {} to finalize it: {}", deployment_id, e),
        }
    }
}
