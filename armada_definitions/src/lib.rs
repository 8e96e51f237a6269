#![allow(renamed_and_removed_lints)]

#[macro_use]
extern crate serde_derive;
extern crate serde;
extern crate serde_json;
extern crate serde_yaml;

extern crate chrono;

#[macro_use]
extern crate log;

#[macro_use] extern crate failure;

pub use failure::Error;
pub type Result<T> = std::result::Result<T, Error>;

/// Service configuration (environments, coordination store, worker pools)
pub mod config;
pub use config::Config;

/// The deployment document and its ordered task list
pub mod deployment;
pub use deployment::{coordinate, Deployment, LogEntry, Task, TaskAction, TaskStatus};

/// The deployment parameter map and its merge precedence
pub mod params;
pub use params::Parameters;
