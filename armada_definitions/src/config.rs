use std::collections::BTreeMap;
use std::env;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use super::Result;

fn default_redis_host() -> String {
    "127.0.0.1".into()
}
fn default_redis_port() -> u32 {
    6379
}
fn default_prefix() -> String {
    "armada".into()
}
fn default_threads() -> usize {
    1
}
fn default_lock_ms() -> u64 {
    60_000
}
fn default_backoff_ms() -> u64 {
    200
}
fn default_throttle_ms() -> u64 {
    200
}
fn default_retries() -> u32 {
    3600
}
fn default_interval_ms() -> u64 {
    1000
}
fn default_poll_threads() -> usize {
    4
}
fn default_healthcheck_port() -> u64 {
    8080
}
fn default_healthcheck_path() -> String {
    "/healthcheck".into()
}

/// One deployable environment and its remote service endpoint.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Environment {
    /// Base URL of the ASG management service for this environment
    pub asgard: String,

    /// VPC inside which load balancers are addressed by id rather than name
    #[serde(default)]
    pub vpc_id: Option<String>,
}

/// Connection details for the coordination key/value store.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct RedisConfig {
    #[serde(default = "default_redis_host")]
    pub host: String,
    #[serde(default = "default_redis_port")]
    pub port: u32,
    /// Key prefix; every coordination entry lives under it
    #[serde(default = "default_prefix")]
    pub prefix: String,
}

impl Default for RedisConfig {
    fn default() -> RedisConfig {
        RedisConfig {
            host: default_redis_host(),
            port: default_redis_port(),
            prefix: default_prefix(),
        }
    }
}

/// Worker pool behaviour for the persistent work queue.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct QueueConfig {
    #[serde(default = "default_threads")]
    pub threads: usize,
    /// Per-message invisibility lease
    #[serde(default = "default_lock_ms")]
    pub lock_ms: u64,
    /// Sleep when the queue is empty
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
    /// Sleep between consecutive messages
    #[serde(default = "default_throttle_ms")]
    pub throttle_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> QueueConfig {
        QueueConfig {
            threads: default_threads(),
            lock_ms: default_lock_ms(),
            backoff_ms: default_backoff_ms(),
            throttle_ms: default_throttle_ms(),
        }
    }
}

/// Remote task polling horizon.
///
/// The per-task wall clock bound is `retries * interval_ms`.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct TrackerConfig {
    #[serde(default = "default_retries")]
    pub retries: u32,
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    /// Size of the shared scheduled poll pool
    #[serde(default = "default_poll_threads")]
    pub threads: usize,
}

impl Default for TrackerConfig {
    fn default() -> TrackerConfig {
        TrackerConfig {
            retries: default_retries(),
            interval_ms: default_interval_ms(),
            threads: default_poll_threads(),
        }
    }
}

/// Site-wide deployment defaults applied when parameters do not say otherwise.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct DeployDefaults {
    /// SSH key baked into new launch configurations
    #[serde(default)]
    pub key_name: Option<String>,

    /// Security group granting the healthcheck pollers access
    #[serde(default)]
    pub healthcheck_security_group: Option<String>,

    /// Security group granting the monitoring hosts access
    #[serde(default)]
    pub monitoring_security_group: Option<String>,

    #[serde(default = "default_healthcheck_port")]
    pub healthcheck_port: u64,

    #[serde(default = "default_healthcheck_path")]
    pub healthcheck_path: String,
}

impl Default for DeployDefaults {
    fn default() -> DeployDefaults {
        DeployDefaults {
            key_name: None,
            healthcheck_security_group: None,
            monitoring_security_group: None,
            healthcheck_port: default_healthcheck_port(),
            healthcheck_path: default_healthcheck_path(),
        }
    }
}

/// Master service configuration, deserialized from the `ARMADA_CONF` file.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Config {
    /// Deployable environments by name
    pub environments: BTreeMap<String, Environment>,

    /// Base URL of the configuration-source service
    pub metadata: String,

    #[serde(default)]
    pub redis: RedisConfig,

    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub tracker: TrackerConfig,

    #[serde(default)]
    pub defaults: DeployDefaults,
}

impl Config {
    /// Read the config file pointed at by `ARMADA_CONF` (default `armada.yml`).
    pub fn read() -> Result<Config> {
        let path = env::var("ARMADA_CONF").unwrap_or_else(|_| "armada.yml".into());
        Config::read_from(&path)
    }

    pub fn read_from(path: &str) -> Result<Config> {
        ensure!(Path::new(path).exists(), "config file {} does not exist", path);
        let mut data = String::new();
        File::open(path)?.read_to_string(&mut data)?;
        let mut conf: Config = serde_yaml::from_str(&data)?;

        // connection details may be overridden per host
        if let Ok(host) = env::var("ARMADA_REDIS_HOST") {
            conf.redis.host = host;
        }
        if let Ok(port) = env::var("ARMADA_REDIS_PORT") {
            conf.redis.port = port.parse()?;
        }
        debug!("loaded config from {}", path);
        Ok(conf)
    }

    pub fn environment(&self, name: &str) -> Result<&Environment> {
        self.environments
            .get(name)
            .ok_or_else(|| format_err!("unknown environment {}", name))
    }

    pub fn redis_url(&self) -> String {
        format!("redis://{}:{}/", self.redis.host, self.redis.port)
    }
}
