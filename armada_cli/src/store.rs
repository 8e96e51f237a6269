use std::collections::BTreeMap;
use std::sync::Mutex;

use redis::Commands;

use armada_definitions::{Config, Deployment, Parameters, Task};

use super::kv::Mode;
use super::{Error, Result, Transient};

fn store_err(e: redis::RedisError) -> Error {
    Transient::Store(e.to_string()).into()
}

/// Document store for deployment records, indexed by deployment id.
///
/// The backing document database is an external collaborator; this client
/// keeps the records as JSON values in a hash of the coordination store.
/// Writes are last-writer-wins at the document level, which is safe because
/// each deployment id is owned by a single execution context at a time.
pub struct DeploymentStore {
    client: Option<redis::Client>,
    key: String,
    mode: Mode,
    mock: Mutex<BTreeMap<String, String>>,
}

impl DeploymentStore {
    pub fn standard(conf: &Config) -> Result<DeploymentStore> {
        let client = redis::Client::open(conf.redis_url().as_str()).map_err(store_err)?;
        Ok(DeploymentStore {
            client: Some(client),
            key: format!("{}:deployments:docs", conf.redis.prefix),
            mode: Mode::Standard,
            mock: Mutex::new(BTreeMap::new()),
        })
    }

    /// In-memory documents only; used by tests.
    pub fn mocked() -> DeploymentStore {
        DeploymentStore {
            client: None,
            key: "armada:deployments:docs".into(),
            mode: Mode::Mocked,
            mock: Mutex::new(BTreeMap::new()),
        }
    }

    fn conn(&self) -> Result<redis::Connection> {
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| Error::from(Transient::Store("no client handle".into())))?;
        client.get_connection().map_err(store_err)
    }

    fn raw_get(&self, id: &str) -> Result<Option<String>> {
        if self.mode == Mode::Mocked {
            return Ok(self.mock.lock().expect("document mock poisoned").get(id).cloned());
        }
        let mut con = self.conn()?;
        con.hget(&self.key, id).map_err(store_err)
    }

    fn raw_put(&self, id: &str, doc: String) -> Result<()> {
        if self.mode == Mode::Mocked {
            self.mock
                .lock()
                .expect("document mock poisoned")
                .insert(id.into(), doc);
            return Ok(());
        }
        let mut con = self.conn()?;
        con.hset(&self.key, id, doc).map_err(store_err)
    }

    fn raw_all(&self) -> Result<Vec<String>> {
        if self.mode == Mode::Mocked {
            return Ok(self
                .mock
                .lock()
                .expect("document mock poisoned")
                .values()
                .cloned()
                .collect());
        }
        let mut con = self.conn()?;
        con.hvals(&self.key).map_err(store_err)
    }

    pub fn healthy(&self) -> Result<()> {
        if self.mode == Mode::Mocked {
            return Ok(());
        }
        let mut con = self.conn()?;
        let pong: String = redis::cmd("PING").query(&mut con).map_err(store_err)?;
        ensure!(pong == "PONG", "unexpected ping reply '{}'", pong);
        Ok(())
    }

    pub fn upsert(&self, dep: &Deployment) -> Result<()> {
        self.raw_put(&dep.id, serde_json::to_string(dep)?)
    }

    pub fn get(&self, id: &str) -> Result<Option<Deployment>> {
        match self.raw_get(id)? {
            Some(doc) => Ok(Some(serde_json::from_str(&doc)?)),
            None => Ok(None),
        }
    }

    /// Merge keys into the stored parameters; incoming keys win.
    pub fn merge_parameters(&self, id: &str, params: &Parameters) -> Result<Deployment> {
        let mut dep = self
            .get(id)?
            .ok_or_else(|| format_err!("no deployment {}", id))?;
        dep.parameters.absorb(params);
        self.upsert(&dep)?;
        Ok(dep)
    }

    /// Overwrite the sub-task with `task.task_id` in place.
    pub fn update_task(&self, id: &str, task: &Task) -> Result<()> {
        let mut dep = self
            .get(id)?
            .ok_or_else(|| format_err!("no deployment {}", id))?;
        {
            let slot = dep
                .tasks
                .iter_mut()
                .find(|t| t.task_id == task.task_id)
                .ok_or_else(|| format_err!("deployment {} has no task {}", id, task.task_id))?;
            *slot = task.clone();
        }
        self.upsert(&dep)
    }

    /// Deployments with any task not yet in a terminal status.
    pub fn find_incomplete(&self) -> Result<Vec<Deployment>> {
        let mut incomplete = Vec::new();
        for doc in self.raw_all()? {
            let dep: Deployment = serde_json::from_str(&doc)?;
            if dep.tasks.iter().any(|t| !t.status.is_terminal()) {
                incomplete.push(dep);
            }
        }
        Ok(incomplete)
    }

    /// Deployments that never recorded an end timestamp.
    pub fn find_broken(&self) -> Result<Vec<Deployment>> {
        let mut broken = Vec::new();
        for doc in self.raw_all()? {
            let dep: Deployment = serde_json::from_str(&doc)?;
            if dep.end.is_none() {
                broken.push(dep);
            }
        }
        Ok(broken)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use armada_definitions::{TaskStatus};
    use chrono::Utc;

    fn deployment(id: &str) -> Deployment {
        Deployment::new(
            id, "foo", "prod", "eu-west-1", "ami-1", "jo", "", "abc",
            Parameters::default(),
        )
    }

    #[test]
    fn update_task_replaces_exactly_one_entry() {
        let store = DeploymentStore::mocked();
        let dep = deployment("d-1");
        store.upsert(&dep).unwrap();

        let mut task = dep.tasks[2].clone();
        task.status = TaskStatus::Completed;
        task.start = Some(Utc::now());
        task.end = Some(Utc::now());
        task.record("Enabled traffic");
        store.update_task("d-1", &task).unwrap();

        let after = store.get("d-1").unwrap().unwrap();
        assert_eq!(after.tasks.len(), dep.tasks.len());
        for (i, t) in after.tasks.iter().enumerate() {
            if t.task_id == task.task_id {
                assert_eq!(t.status, TaskStatus::Completed);
                assert_eq!(t.log.len(), 1);
            } else {
                assert_eq!(t.status, dep.tasks[i].status);
                assert!(t.log.is_empty());
            }
        }
    }

    #[test]
    fn update_task_demands_a_known_task() {
        let store = DeploymentStore::mocked();
        store.upsert(&deployment("d-1")).unwrap();
        let mut task = deployment("d-1").tasks[0].clone();
        task.task_id = "42".into();
        assert!(store.update_task("d-1", &task).is_err());
    }

    #[test]
    fn merge_parameters_is_last_writer_wins_per_key() {
        let store = DeploymentStore::mocked();
        let mut dep = deployment("d-1");
        dep.parameters.set("min", 1);
        dep.parameters.set("max", 2);
        store.upsert(&dep).unwrap();

        let mut incoming = Parameters::new();
        incoming.set("min", 3);
        incoming.set("new_asg_name", "foo-prod");
        let merged = store.merge_parameters("d-1", &incoming).unwrap();

        assert_eq!(merged.parameters.min(), Some(3));
        assert_eq!(merged.parameters.max(), Some(2));
        assert_eq!(merged.parameters.new_asg_name(), Some("foo-prod".to_string()));
    }

    #[test]
    fn finders_split_on_terminal_tasks_and_end() {
        let store = DeploymentStore::mocked();

        let fresh = deployment("d-1");
        store.upsert(&fresh).unwrap();

        let mut finished = deployment("d-2");
        for t in &mut finished.tasks {
            t.status = TaskStatus::Completed;
        }
        finished.end = Some(Utc::now());
        store.upsert(&finished).unwrap();

        let incomplete = store.find_incomplete().unwrap();
        assert_eq!(incomplete.len(), 1);
        assert_eq!(incomplete[0].id, "d-1");

        let broken = store.find_broken().unwrap();
        assert_eq!(broken.len(), 1);
        assert_eq!(broken[0].id, "d-1");
    }
}
