use std::sync::Arc;

use chrono::Utc;

use armada_definitions::{coordinate, Deployment, TaskStatus};

use super::kv::Kv;
use super::pipeline::Engine;
use super::store::DeploymentStore;
use super::Result;

/// Coordination refusals surfaced to operators and callers.
#[derive(Clone, Eq, PartialEq, Debug, Fail)]
pub enum CoordinationError {
    #[fail(display = "deployment intake is locked")]
    Locked,

    #[fail(display = "a deployment of {} is already in progress", _0)]
    AlreadyInProgress(String),

    #[fail(display = "nothing is paused for {}", _0)]
    NothingPaused(String),
}

/// Admits queued deployments and owns the operator controls.
///
/// Mutual exclusion comes from the coordination store's atomic
/// set-if-absent; each admitted deployment id is owned by exactly one
/// worker from here on.
#[derive(Clone)]
pub struct Orchestrator {
    pub engine: Engine,
    kv: Arc<Kv>,
    store: Arc<DeploymentStore>,
}

impl Orchestrator {
    pub fn new(engine: Engine) -> Orchestrator {
        Orchestrator {
            kv: Arc::clone(&engine.kv),
            store: Arc::clone(&engine.store),
            engine,
        }
    }

    /// Queue handler: enforce the intake invariants, then run the pipeline.
    pub fn start(&self, deployment_id: &str) -> Result<()> {
        let dep = self
            .store
            .get(deployment_id)?
            .ok_or_else(|| format_err!("no deployment {}", deployment_id))?;
        let key = dep.coordinate();

        if self.kv.locked()? {
            self.refuse(dep, "Deployment intake is locked")?;
            return Err(CoordinationError::Locked.into());
        }
        if !self.kv.register_in_progress(&key, deployment_id)? {
            self.refuse(dep, "Another deployment holds this application, environment and region")?;
            return Err(CoordinationError::AlreadyInProgress(key).into());
        }
        self.engine.start_deployment(deployment_id)
    }

    /// Record why a deployment never ran, so the document tells the story.
    fn refuse(&self, mut dep: Deployment, reason: &str) -> Result<()> {
        warn!("refusing deployment {}: {}", dep.id, reason);
        for task in &mut dep.tasks {
            if task.status == TaskStatus::Pending {
                task.status = TaskStatus::Terminated;
                task.record(reason);
            }
        }
        dep.end = Some(Utc::now());
        self.store.upsert(&dep)
    }

    /// Ask the in-flight deployment to pause at its next task boundary.
    /// True iff this request was the first.
    pub fn pause(&self, application: &str, environment: &str, region: &str) -> Result<bool> {
        self.kv.register_pause(&coordinate(application, environment, region))
    }

    /// Ask for cancellation at the next task boundary. True iff new.
    pub fn cancel(&self, application: &str, environment: &str, region: &str) -> Result<bool> {
        self.kv.register_cancel(&coordinate(application, environment, region))
    }

    /// Wake a paused deployment and run its next task.
    pub fn resume(&self, application: &str, environment: &str, region: &str) -> Result<()> {
        let key = coordinate(application, environment, region);
        let id = self
            .kv
            .paused(&key)?
            .ok_or_else(|| CoordinationError::NothingPaused(key.clone()))?;
        self.kv.unregister_paused(&key)?;
        self.kv.unregister_cancel(&key)?;
        info!("resuming {} for {}", id, key);
        self.engine.advance(&id)
    }

    /// Revive deployments interrupted by a process restart.
    ///
    /// Only deployments that had started, have not ended and still hold
    /// their in-progress mapping are revived; anything whose mapping an
    /// operator cleared is left broken for human triage.
    pub fn restart_sweep(&self) -> Result<()> {
        for dep in self.store.find_incomplete()? {
            if dep.start.is_none() || dep.end.is_some() {
                // queue-owned or already finalized; not ours to touch
                continue;
            }
            let key = dep.coordinate();
            if self.kv.paused(&key)?.is_some() {
                debug!("{} is paused; waiting for an operator", dep.id);
                continue;
            }
            match self.kv.in_progress(&key)? {
                Some(ref owner) if owner == &dep.id => {
                    if let Err(e) = self.restart(&dep) {
                        error!("could not restart {}: {}", dep.id, e);
                    }
                }
                _ => {
                    error!(
                        "deployment {} of {} has no in-progress entry; leaving it broken",
                        dep.id, key
                    );
                }
            }
        }
        Ok(())
    }

    fn restart(&self, dep: &Deployment) -> Result<()> {
        let task = match dep.first_incomplete() {
            Some(t) => t.clone(),
            None => return self.engine.advance(&dep.id),
        };
        info!(
            "restarting {} from task {} ({})",
            dep.id, task.task_id, task.action
        );
        if task.status == TaskStatus::Running && task.url.is_some() {
            // the remote task may have finished while we were away
            self.engine.resume_tracking(&dep.id, task);
            Ok(())
        } else {
            self.engine.start_task(&dep.id, &task.task_id)
        }
    }
}
