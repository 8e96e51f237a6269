#[macro_use]
extern crate clap;
extern crate env_logger;
#[macro_use]
extern crate log;

extern crate armada;

use std::process;
use std::sync::Arc;
use std::time::Duration;

use clap::{App, AppSettings, Arg, ArgMatches, SubCommand};

use armada::asgard::Asgard;
use armada::health::HealthWatcher;
use armada::intake::{DeploymentRequest, Intake};
use armada::kv::Kv;
use armada::metadata::MetadataService;
use armada::orchestrator::Orchestrator;
use armada::pipeline::Engine;
use armada::scheduler::Scheduler;
use armada::store::DeploymentStore;
use armada::tracker::Tracker;
use armada::{queue, Config, Parameters, Result};

/// The explicit service context; constructed once at startup and passed
/// through, never held in globals.
struct Services {
    config: Arc<Config>,
    kv: Arc<Kv>,
    store: Arc<DeploymentStore>,
    orchestrator: Orchestrator,
    intake: Intake,
}

fn services() -> Result<Services> {
    let config = Arc::new(Config::read()?);
    let kv = Arc::new(Kv::standard(&config)?);
    let store = Arc::new(DeploymentStore::standard(&config)?);
    let asgard = Arc::new(Asgard::new(&config)?);
    let scheduler = Arc::new(Scheduler::new(config.tracker.threads)?);
    let interval = Duration::from_millis(config.tracker.interval_ms);
    let tracker = Tracker::new(
        Arc::clone(&scheduler),
        Arc::clone(&asgard),
        Arc::clone(&store),
        interval,
    );
    let health = HealthWatcher::new(
        Arc::clone(&scheduler),
        Arc::clone(&asgard),
        Arc::clone(&store),
        interval,
    )?;
    let engine = Engine::new(
        Arc::clone(&config),
        Arc::clone(&kv),
        Arc::clone(&store),
        Arc::clone(&asgard),
        tracker,
        health,
    );
    let orchestrator = Orchestrator::new(engine);
    let intake = Intake::new(
        Arc::clone(&kv),
        Arc::clone(&store),
        asgard,
        MetadataService::new(&config)?,
    );
    Ok(Services { config, kv, store, orchestrator, intake })
}

fn coordinate_args<'a, 'b>(sub: App<'a, 'b>) -> App<'a, 'b> {
    sub.arg(Arg::with_name("application").required(true))
        .arg(Arg::with_name("environment").required(true))
        .arg(Arg::with_name("region").required(true))
}

fn main() {
    let app = App::new("armada")
        .version(crate_version!())
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .about("Drive auto scaling group deployments")
        .subcommand(SubCommand::with_name("run").about("Run the deployment workers"))
        .subcommand(
            coordinate_args(SubCommand::with_name("deploy"))
                .about("Request a deployment")
                .arg(Arg::with_name("ami").required(true))
                .arg(
                    Arg::with_name("user")
                        .long("user")
                        .takes_value(true)
                        .help("Who is deploying"),
                )
                .arg(
                    Arg::with_name("message")
                        .long("message")
                        .takes_value(true)
                        .help("Why this is being deployed"),
                ),
        )
        .subcommand(
            coordinate_args(SubCommand::with_name("pause"))
                .about("Pause a deployment at its next task boundary"),
        )
        .subcommand(
            coordinate_args(SubCommand::with_name("resume"))
                .about("Resume a paused deployment"),
        )
        .subcommand(
            coordinate_args(SubCommand::with_name("cancel"))
                .about("Cancel a deployment at its next task boundary"),
        )
        .subcommand(
            SubCommand::with_name("lock")
                .about("Suspend deployment intake")
                .arg(Arg::with_name("reason").takes_value(true)),
        )
        .subcommand(SubCommand::with_name("unlock").about("Resume deployment intake"))
        .subcommand(SubCommand::with_name("status").about("Show coordination state"));

    let matches = app.get_matches();
    env_logger::init();

    if let Err(e) = dispatch(&matches) {
        error!("{}", e);
        process::exit(1);
    }
}

fn dispatch(matches: &ArgMatches) -> Result<()> {
    let services = services()?;
    match matches.subcommand() {
        ("run", _) => run(services),
        ("deploy", Some(m)) => {
            let req = DeploymentRequest {
                application: m.value_of("application").unwrap().into(),
                environment: m.value_of("environment").unwrap().into(),
                region: m.value_of("region").unwrap().into(),
                ami: m.value_of("ami").unwrap().into(),
                user: m
                    .value_of("user")
                    .map(String::from)
                    .unwrap_or_else(whoami),
                message: m.value_of("message").unwrap_or("").into(),
                parameters: Parameters::default(),
            };
            let id = services.intake.accept(&req)?;
            println!("{}", id);
            Ok(())
        }
        ("pause", Some(m)) => {
            let first = services.orchestrator.pause(
                m.value_of("application").unwrap(),
                m.value_of("environment").unwrap(),
                m.value_of("region").unwrap(),
            )?;
            println!("{}", if first { "pause requested" } else { "pause already requested" });
            Ok(())
        }
        ("resume", Some(m)) => services.orchestrator.resume(
            m.value_of("application").unwrap(),
            m.value_of("environment").unwrap(),
            m.value_of("region").unwrap(),
        ),
        ("cancel", Some(m)) => {
            let first = services.orchestrator.cancel(
                m.value_of("application").unwrap(),
                m.value_of("environment").unwrap(),
                m.value_of("region").unwrap(),
            )?;
            println!("{}", if first { "cancel requested" } else { "cancel already requested" });
            Ok(())
        }
        ("lock", Some(m)) => services.kv.lock(m.value_of("reason").unwrap_or("operator lock")),
        ("unlock", _) => services.kv.unlock(),
        ("status", _) => status(&services),
        _ => unreachable!(),
    }
}

fn run(services: Services) -> Result<()> {
    info!("armada {} starting", crate_version!());
    services.kv.healthy()?;
    services.store.healthy()?;
    services.orchestrator.restart_sweep()?;

    let orchestrator = services.orchestrator.clone();
    let workers = queue::consume(
        Arc::clone(&services.kv),
        services.config.queue.clone(),
        move |deployment_id| orchestrator.start(deployment_id),
    );
    info!("consuming with {} worker(s)", services.config.queue.threads);
    workers.wait();
    Ok(())
}

fn status(services: &Services) -> Result<()> {
    services.kv.healthy()?;
    println!("queue depth: {}", services.kv.queue_depth()?);
    for (coordinate, id) in services.kv.in_progress_all()? {
        println!("in progress: {} -> {}", coordinate, id);
    }
    for (coordinate, id) in services.kv.paused_all()? {
        println!("paused:      {} -> {}", coordinate, id);
    }
    Ok(())
}

fn whoami() -> String {
    std::env::var("USER").unwrap_or_else(|_| "anonymous".into())
}
