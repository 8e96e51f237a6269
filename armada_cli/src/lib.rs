#![recursion_limit = "1024"]
#![allow(renamed_and_removed_lints)]
#![allow(non_snake_case)]

#[macro_use]
extern crate serde_derive;
extern crate serde;
extern crate serde_json;

// remote service + config-source clients
extern crate reqwest;

// coordination store
extern crate redis;

extern crate chrono;
extern crate regex;
extern crate uuid;

#[macro_use]
extern crate log;

// worker pools
extern crate threadpool;

#[macro_use] extern crate failure;

pub use failure::Error;
pub type Result<T> = std::result::Result<T, Error>;

extern crate armada_definitions;
pub use armada_definitions::{Config, Deployment, LogEntry, Parameters, Task, TaskAction, TaskStatus};

/// Failure classes the tracker recovers from in place.
///
/// Anything else that goes wrong during a poll propagates instead of
/// spending retries.
#[derive(Clone, Debug, Fail, PartialEq)]
pub enum Transient {
    #[fail(display = "http failure: {}", _0)]
    Http(String),

    #[fail(display = "store failure: {}", _0)]
    Store(String),
}

/// Whether an error is a classified transient (`http` or `store`) failure.
pub fn is_transient(e: &Error) -> bool {
    e.downcast_ref::<Transient>().is_some()
}

/// Coordination entries in the remote key/value service
pub mod kv;

/// The persistent work queue and its worker pool
pub mod queue;

/// Deployment document persistence
pub mod store;

/// An HTTP client for the ASG management service using `reqwest`
pub mod asgard;

/// Merged parameters to wire-level form fields
pub mod transform;

/// An HTTP client for the configuration-source service
pub mod metadata;

/// Delayed job execution on a shared pool
pub mod scheduler;

/// Polling of long-running remote tasks
pub mod tracker;

/// Instance and load balancer health polls
pub mod health;

/// The per-deployment task pipeline
pub mod pipeline;

/// Mutual exclusion, pause/cancel and restarts
pub mod orchestrator;

/// Deployment request validation and admission
pub mod intake;
