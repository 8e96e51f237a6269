use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use redis::Commands;

use armada_definitions::Config;

use super::{Error, Result, Transient};

/// Coordination store usage mode
#[derive(PartialEq, Debug, Clone)]
pub enum Mode {
    /// Normal commands against the remote key/value service
    Standard,
    /// In-memory state only, for tests
    Mocked,
}

/// In-memory stand-in with the same semantics as the remote commands.
#[derive(Default)]
struct MockState {
    strings: BTreeMap<String, String>,
    hashes: BTreeMap<String, BTreeMap<String, String>>,
    sets: BTreeMap<String, BTreeSet<String>>,
    queue: VecDeque<String>,
    processing: Vec<String>,
    leases: HashMap<String, Instant>,
}

fn store_err(e: redis::RedisError) -> Error {
    Transient::Store(e.to_string()).into()
}

/// Client for the coordination entries in the remote key/value service.
///
/// Holds the advisory intake lock, the in-progress and paused maps, the
/// awaiting-pause/awaiting-cancel sets and the persistent work queue. The
/// `in_progress` registration is the only cross-deployment synchronization
/// primitive in the system.
pub struct Kv {
    client: Option<redis::Client>,
    prefix: String,
    mode: Mode,
    mock: Mutex<MockState>,
}

impl Kv {
    /// Connect to the store named in the config.
    pub fn standard(conf: &Config) -> Result<Kv> {
        let client = redis::Client::open(conf.redis_url().as_str()).map_err(store_err)?;
        Ok(Kv {
            client: Some(client),
            prefix: conf.redis.prefix.clone(),
            mode: Mode::Standard,
            mock: Mutex::new(MockState::default()),
        })
    }

    /// In-memory state only; used by tests.
    pub fn mocked(prefix: &str) -> Kv {
        Kv {
            client: None,
            prefix: prefix.into(),
            mode: Mode::Mocked,
            mock: Mutex::new(MockState::default()),
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode.clone()
    }

    fn conn(&self) -> Result<redis::Connection> {
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| Error::from(Transient::Store("no client handle".into())))?;
        client.get_connection().map_err(store_err)
    }

    fn mock(&self) -> std::sync::MutexGuard<MockState> {
        self.mock.lock().expect("coordination mock state poisoned")
    }

    fn key(&self, suffix: &str) -> String {
        format!("{}:{}", self.prefix, suffix)
    }

    /// Trivial round trip; used by health checks.
    pub fn healthy(&self) -> Result<()> {
        if self.mode == Mode::Mocked {
            return Ok(());
        }
        let mut con = self.conn()?;
        let pong: String = redis::cmd("PING").query(&mut con).map_err(store_err)?;
        ensure!(pong == "PONG", "unexpected ping reply '{}'", pong);
        Ok(())
    }

    // --- the advisory intake lock ---

    pub fn lock(&self, reason: &str) -> Result<()> {
        let key = self.key("lock");
        if self.mode == Mode::Mocked {
            self.mock().strings.insert(key, reason.into());
            return Ok(());
        }
        let mut con = self.conn()?;
        con.set(key, reason).map_err(store_err)
    }

    pub fn unlock(&self) -> Result<()> {
        let key = self.key("lock");
        if self.mode == Mode::Mocked {
            self.mock().strings.remove(&key);
            return Ok(());
        }
        let mut con = self.conn()?;
        con.del(key).map_err(store_err)
    }

    /// Presence of the lock suspends deployment intake.
    pub fn locked(&self) -> Result<bool> {
        let key = self.key("lock");
        if self.mode == Mode::Mocked {
            return Ok(self.mock().strings.contains_key(&key));
        }
        let mut con = self.conn()?;
        con.exists(key).map_err(store_err)
    }

    // --- hash helpers (in-progress and paused maps) ---

    fn hash_set_if_absent(&self, key: &str, field: &str, value: &str) -> Result<bool> {
        if self.mode == Mode::Mocked {
            let mut state = self.mock();
            let hash = state.hashes.entry(key.into()).or_insert_with(BTreeMap::new);
            if hash.contains_key(field) {
                return Ok(false);
            }
            hash.insert(field.into(), value.into());
            return Ok(true);
        }
        let mut con = self.conn()?;
        con.hset_nx(key, field, value).map_err(store_err)
    }

    fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>> {
        if self.mode == Mode::Mocked {
            return Ok(self
                .mock()
                .hashes
                .get(key)
                .and_then(|h| h.get(field).cloned()));
        }
        let mut con = self.conn()?;
        con.hget(key, field).map_err(store_err)
    }

    fn hash_del(&self, key: &str, field: &str) -> Result<()> {
        if self.mode == Mode::Mocked {
            if let Some(h) = self.mock().hashes.get_mut(key) {
                h.remove(field);
            }
            return Ok(());
        }
        let mut con = self.conn()?;
        con.hdel(key, field).map_err(store_err)
    }

    fn hash_all(&self, key: &str) -> Result<BTreeMap<String, String>> {
        if self.mode == Mode::Mocked {
            return Ok(self.mock().hashes.get(key).cloned().unwrap_or_default());
        }
        let mut con = self.conn()?;
        con.hgetall(key).map_err(store_err)
    }

    // --- set helpers (awaiting-pause and awaiting-cancel) ---

    fn set_add(&self, key: &str, member: &str) -> Result<bool> {
        if self.mode == Mode::Mocked {
            let mut state = self.mock();
            let set = state.sets.entry(key.into()).or_insert_with(BTreeSet::new);
            return Ok(set.insert(member.into()));
        }
        let mut con = self.conn()?;
        let added: i64 = con.sadd(key, member).map_err(store_err)?;
        Ok(added > 0)
    }

    fn set_remove(&self, key: &str, member: &str) -> Result<bool> {
        if self.mode == Mode::Mocked {
            return Ok(self
                .mock()
                .sets
                .get_mut(key)
                .map(|s| s.remove(member))
                .unwrap_or(false));
        }
        let mut con = self.conn()?;
        let removed: i64 = con.srem(key, member).map_err(store_err)?;
        Ok(removed > 0)
    }

    fn set_member(&self, key: &str, member: &str) -> Result<bool> {
        if self.mode == Mode::Mocked {
            return Ok(self
                .mock()
                .sets
                .get(key)
                .map(|s| s.contains(member))
                .unwrap_or(false));
        }
        let mut con = self.conn()?;
        con.sismember(key, member).map_err(store_err)
    }

    // --- in-progress map ---

    /// Atomic set-if-absent; true iff this call installed the mapping.
    pub fn register_in_progress(&self, coordinate: &str, deployment_id: &str) -> Result<bool> {
        self.hash_set_if_absent(&self.key("deployments:in-progress"), coordinate, deployment_id)
    }

    pub fn in_progress(&self, coordinate: &str) -> Result<Option<String>> {
        self.hash_get(&self.key("deployments:in-progress"), coordinate)
    }

    pub fn in_progress_all(&self) -> Result<BTreeMap<String, String>> {
        self.hash_all(&self.key("deployments:in-progress"))
    }

    pub fn unregister_in_progress(&self, coordinate: &str) -> Result<()> {
        self.hash_del(&self.key("deployments:in-progress"), coordinate)
    }

    // --- paused map ---

    pub fn register_paused(&self, coordinate: &str, deployment_id: &str) -> Result<bool> {
        self.hash_set_if_absent(&self.key("deployments:paused"), coordinate, deployment_id)
    }

    pub fn paused(&self, coordinate: &str) -> Result<Option<String>> {
        self.hash_get(&self.key("deployments:paused"), coordinate)
    }

    pub fn paused_all(&self) -> Result<BTreeMap<String, String>> {
        self.hash_all(&self.key("deployments:paused"))
    }

    pub fn unregister_paused(&self, coordinate: &str) -> Result<()> {
        self.hash_del(&self.key("deployments:paused"), coordinate)
    }

    // --- operator requests, observed at task boundaries ---

    /// True iff the request was not already registered.
    pub fn register_pause(&self, coordinate: &str) -> Result<bool> {
        self.set_add(&self.key("deployments:awaiting-pause"), coordinate)
    }

    pub fn pause_registered(&self, coordinate: &str) -> Result<bool> {
        self.set_member(&self.key("deployments:awaiting-pause"), coordinate)
    }

    pub fn unregister_pause(&self, coordinate: &str) -> Result<bool> {
        self.set_remove(&self.key("deployments:awaiting-pause"), coordinate)
    }

    pub fn register_cancel(&self, coordinate: &str) -> Result<bool> {
        self.set_add(&self.key("deployments:awaiting-cancel"), coordinate)
    }

    pub fn cancel_registered(&self, coordinate: &str) -> Result<bool> {
        self.set_member(&self.key("deployments:awaiting-cancel"), coordinate)
    }

    pub fn unregister_cancel(&self, coordinate: &str) -> Result<bool> {
        self.set_remove(&self.key("deployments:awaiting-cancel"), coordinate)
    }

    /// Clear every coordination entry for a finished deployment.
    pub fn end_deployment(&self, coordinate: &str) -> Result<()> {
        self.unregister_pause(coordinate)?;
        self.unregister_cancel(coordinate)?;
        self.unregister_paused(coordinate)?;
        self.unregister_in_progress(coordinate)
    }

    // --- the persistent work queue ---

    pub fn enqueue(&self, payload: &str) -> Result<()> {
        let key = self.key("queue");
        debug!("enqueue {}", payload);
        if self.mode == Mode::Mocked {
            self.mock().queue.push_back(payload.into());
            return Ok(());
        }
        let mut con = self.conn()?;
        con.lpush(key, payload).map_err(store_err)
    }

    /// Move the oldest message onto the processing list and return it.
    pub fn queue_pop(&self) -> Result<Option<String>> {
        if self.mode == Mode::Mocked {
            let mut state = self.mock();
            let popped = state.queue.pop_front();
            if let Some(ref payload) = popped {
                state.processing.push(payload.clone());
            }
            return Ok(popped);
        }
        let mut con = self.conn()?;
        redis::cmd("RPOPLPUSH")
            .arg(self.key("queue"))
            .arg(self.key("queue:processing"))
            .query(&mut con)
            .map_err(store_err)
    }

    /// Drop one processed copy of the message.
    pub fn queue_ack(&self, payload: &str) -> Result<()> {
        if self.mode == Mode::Mocked {
            let mut state = self.mock();
            if let Some(pos) = state.processing.iter().position(|p| p == payload) {
                state.processing.remove(pos);
            }
            return Ok(());
        }
        let mut con = self.conn()?;
        let _: i64 = con
            .lrem(self.key("queue:processing"), 1, payload)
            .map_err(store_err)?;
        Ok(())
    }

    pub fn queue_depth(&self) -> Result<u64> {
        if self.mode == Mode::Mocked {
            return Ok(self.mock().queue.len() as u64);
        }
        let mut con = self.conn()?;
        let len: i64 = con.llen(self.key("queue")).map_err(store_err)?;
        Ok(len as u64)
    }

    /// Take the per-message visibility lease; true iff we now hold it.
    pub fn lease(&self, payload: &str, ms: u64) -> Result<bool> {
        let key = self.key(&format!("queue:lock:{}", payload));
        if self.mode == Mode::Mocked {
            let mut state = self.mock();
            let now = Instant::now();
            let live = state.leases.get(&key).map(|t| *t > now).unwrap_or(false);
            if live {
                return Ok(false);
            }
            state.leases.insert(key, now + Duration::from_millis(ms));
            return Ok(true);
        }
        let mut con = self.conn()?;
        let reply: Option<String> = redis::cmd("SET")
            .arg(&key)
            .arg("held")
            .arg("NX")
            .arg("PX")
            .arg(ms)
            .query(&mut con)
            .map_err(store_err)?;
        Ok(reply.is_some())
    }

    /// Extend a held lease; the heartbeat calls this while the handler runs.
    pub fn renew_lease(&self, payload: &str, ms: u64) -> Result<()> {
        let key = self.key(&format!("queue:lock:{}", payload));
        if self.mode == Mode::Mocked {
            self.mock()
                .leases
                .insert(key, Instant::now() + Duration::from_millis(ms));
            return Ok(());
        }
        let mut con = self.conn()?;
        let _: bool = con.pexpire(&key, ms as usize).map_err(store_err)?;
        Ok(())
    }

    pub fn release_lease(&self, payload: &str) -> Result<()> {
        let key = self.key(&format!("queue:lock:{}", payload));
        if self.mode == Mode::Mocked {
            self.mock().leases.remove(&key);
            return Ok(());
        }
        let mut con = self.conn()?;
        con.del(key).map_err(store_err)
    }

    fn leased(&self, payload: &str) -> Result<bool> {
        let key = self.key(&format!("queue:lock:{}", payload));
        if self.mode == Mode::Mocked {
            let now = Instant::now();
            return Ok(self.mock().leases.get(&key).map(|t| *t > now).unwrap_or(false));
        }
        let mut con = self.conn()?;
        con.exists(key).map_err(store_err)
    }

    /// Put messages whose lease expired back on the queue.
    ///
    /// A crashed worker leaves its message on the processing list; once the
    /// lease lapses anyone may reclaim it.
    pub fn requeue_expired(&self) -> Result<Vec<String>> {
        let stuck: Vec<String> = if self.mode == Mode::Mocked {
            self.mock().processing.clone()
        } else {
            let mut con = self.conn()?;
            con.lrange(self.key("queue:processing"), 0, -1)
                .map_err(store_err)?
        };

        let mut requeued = Vec::new();
        for payload in stuck {
            if self.leased(&payload)? {
                continue;
            }
            self.queue_ack(&payload)?;
            self.enqueue(&payload)?;
            warn!("requeued {} after its lease expired", payload);
            requeued.push(payload);
        }
        Ok(requeued)
    }
}
