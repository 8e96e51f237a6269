extern crate armada;
extern crate armada_definitions;
extern crate mockito;
extern crate serde_json;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use mockito::{mock, SERVER_URL};
use serde_json::json;

use armada::asgard::Asgard;
use armada::health::HealthWatcher;
use armada::kv::Kv;
use armada::orchestrator::Orchestrator;
use armada::pipeline::Engine;
use armada::scheduler::Scheduler;
use armada::store::DeploymentStore;
use armada::tracker::Tracker;
use armada_definitions::config::{Config, Environment, TrackerConfig};
use armada_definitions::{Deployment, Parameters, TaskStatus};

fn config() -> Config {
    let mut environments = BTreeMap::new();
    environments.insert(
        "prod".to_string(),
        Environment { asgard: SERVER_URL.to_string(), vpc_id: None },
    );
    Config {
        environments,
        metadata: SERVER_URL.to_string(),
        redis: Default::default(),
        queue: Default::default(),
        tracker: TrackerConfig {
            retries: 100,
            interval_ms: 25,
            threads: 2,
        },
        defaults: Default::default(),
    }
}

fn orchestrator() -> Orchestrator {
    let config = Arc::new(config());
    let kv = Arc::new(Kv::mocked("e2e"));
    let store = Arc::new(DeploymentStore::mocked());
    let asgard = Arc::new(Asgard::new(&config).unwrap());
    let scheduler = Arc::new(Scheduler::new(2).unwrap());
    let interval = Duration::from_millis(config.tracker.interval_ms);
    let tracker = Tracker::new(
        Arc::clone(&scheduler),
        Arc::clone(&asgard),
        Arc::clone(&store),
        interval,
    );
    let health = HealthWatcher::new(
        scheduler,
        Arc::clone(&asgard),
        Arc::clone(&store),
        interval,
    )
    .unwrap();
    Orchestrator::new(Engine::new(config, kv, store, asgard, tracker, health))
}

fn mockito_port() -> u64 {
    SERVER_URL.rsplit(':').next().unwrap().parse().unwrap()
}

fn deployment(id: &str, application: &str, region: &str, params: Parameters) -> Deployment {
    Deployment::new(
        id, application, "prod", region, "ami-1", "jo", "ship it", "cafebabe", params,
    )
}

fn wait_until_finished(orch: &Orchestrator, id: &str) -> Deployment {
    for _ in 0..400 {
        let dep = orch.engine.store.get(id).unwrap().unwrap();
        if dep.end.is_some() {
            return dep;
        }
        thread::sleep(Duration::from_millis(10));
    }
    panic!("deployment {} never finished", id);
}

fn statuses(dep: &Deployment) -> Vec<TaskStatus> {
    dep.tasks.iter().map(|t| t.status).collect()
}

#[test]
fn fresh_cluster_deploys_end_to_end() {
    let _cluster = mock("GET", "/eu-west-1/cluster/show/foo-prod.json")
        .with_status(404)
        .create();
    let _save = mock("POST", "/eu-west-1/autoScaling/save")
        .with_status(302)
        .with_header(
            "location",
            &format!("{}/eu-west-1/autoScaling/show/foo-prod", SERVER_URL),
        )
        .create();
    let _group = mock("GET", "/eu-west-1/autoScaling/show/foo-prod.json")
        .with_status(200)
        .with_body(
            r#"{"group":{"autoScalingGroupName":"foo-prod","instances":[{"instanceId":"i-1"}]}}"#,
        )
        .create();
    let _instance = mock("GET", "/eu-west-1/instance/show/i-1.json")
        .with_status(200)
        .with_body(r#"{"instance":{"privateIpAddress":"127.0.0.1"}}"#)
        .create();
    let _healthcheck = mock("GET", "/healthcheck-foo").with_status(200).with_body("ok").create();
    let _enable = mock("POST", "/eu-west-1/cluster/index")
        .with_status(302)
        .with_header("location", &format!("{}/eu-west-1/task/show/1", SERVER_URL))
        .create();
    let _task = mock("GET", "/eu-west-1/task/show/1.json")
        .with_status(200)
        .with_body(
            r#"{"status":"completed","log":["2015-01-01_10:00:00 Activated"],"updateTime":"2015-01-01 10:00:01 UTC"}"#,
        )
        .create();
    let _lb = mock("GET", "/eu-west-1/loadBalancer/show/lb-1.json")
        .with_status(200)
        .with_body(r#"{"instanceStates":[{"instanceId":"i-1","state":"InService"}]}"#)
        .create();

    let orch = orchestrator();
    let mut params = Parameters::new();
    params.set("min", 1);
    params.set("health_check_type", "ELB");
    params.set("selected_load_balancers", json!(["lb-1"]));
    params.set("healthcheck_port", mockito_port());
    params.set("healthcheck_path", "/healthcheck-foo");
    let dep = deployment("d-fresh", "foo", "eu-west-1", params);
    orch.engine.store.upsert(&dep).unwrap();

    orch.start("d-fresh").unwrap();
    let done = wait_until_finished(&orch, "d-fresh");

    assert!(done.start.is_some());
    assert_eq!(
        statuses(&done),
        vec![
            TaskStatus::Completed,
            TaskStatus::Completed,
            TaskStatus::Completed,
            TaskStatus::Completed,
            TaskStatus::Skipped,
            TaskStatus::Skipped,
        ]
    );
    assert_eq!(done.parameters.new_asg_name(), Some("foo-prod".to_string()));
    assert!(done.parameters.old_asg_name().is_none());
    assert!(orch
        .engine
        .kv
        .in_progress("foo-prod-eu-west-1")
        .unwrap()
        .is_none());
}

#[test]
fn an_existing_cluster_is_replaced_generation_by_generation() {
    let _cluster = mock("GET", "/us-east-1/cluster/show/bar-prod.json")
        .with_status(200)
        .with_body(r#"[{"autoScalingGroupName":"bar-prod-v001","instances":[{"instanceId":"i-0"}]}]"#)
        .create();
    let _next = mock("POST", "/us-east-1/cluster/createNextGroup")
        .with_status(302)
        .with_header("location", &format!("{}/us-east-1/task/show/5", SERVER_URL))
        .create();
    let _create_task = mock("GET", "/us-east-1/task/show/5.json")
        .with_status(200)
        .with_body(
            r#"{"status":"completed","log":["2015-01-01_10:00:00 Creating auto scaling group 'bar-prod-v002'"],"updateTime":"2015-01-01 10:00:02 UTC"}"#,
        )
        .create();
    let _new_group = mock("GET", "/us-east-1/autoScaling/show/bar-prod-v002.json")
        .with_status(200)
        .with_body(r#"{"group":{"autoScalingGroupName":"bar-prod-v002","instances":[{"instanceId":"i-2"}]}}"#)
        .create();
    let _old_group = mock("GET", "/us-east-1/autoScaling/show/bar-prod-v001.json")
        .with_status(200)
        .with_body(r#"{"group":{"autoScalingGroupName":"bar-prod-v001","instances":[{"instanceId":"i-0"}]}}"#)
        .create();
    let _actions = mock("POST", "/us-east-1/cluster/index")
        .with_status(302)
        .with_header("location", &format!("{}/us-east-1/task/show/6", SERVER_URL))
        .expect(3)
        .create();
    let _action_task = mock("GET", "/us-east-1/task/show/6.json")
        .with_status(200)
        .with_body(r#"{"status":"completed","log":["2015-01-01_10:01:00 Done"]}"#)
        .create();

    let orch = orchestrator();
    let mut params = Parameters::new();
    params.set("health_check_type", "EC2");
    params.set("selected_load_balancers", json!(["lb-9"]));
    let dep = deployment("d-roll", "bar", "us-east-1", params);
    orch.engine.store.upsert(&dep).unwrap();

    orch.start("d-roll").unwrap();
    let done = wait_until_finished(&orch, "d-roll");

    assert_eq!(
        statuses(&done),
        vec![
            TaskStatus::Completed,
            TaskStatus::Skipped,
            TaskStatus::Completed,
            TaskStatus::Skipped,
            TaskStatus::Completed,
            TaskStatus::Completed,
        ]
    );
    assert_eq!(
        done.parameters.old_asg_name(),
        Some("bar-prod-v001".to_string())
    );
    assert_eq!(
        done.parameters.new_asg_name(),
        Some("bar-prod-v002".to_string())
    );
    // EC2 healthchecks mean no ELB wait
    let elb_wait = &done.tasks[3];
    assert_eq!(
        elb_wait.log.last().unwrap().message,
        "Skipping ELB healthcheck"
    );
}

#[test]
fn cancellation_between_tasks_skips_the_remainder() {
    let _cluster = mock("GET", "/eu-west-2/cluster/show/baz-prod.json")
        .with_status(200)
        .with_body(r#"[{"autoScalingGroupName":"baz-prod-v001","instances":[]}]"#)
        .create();
    let _next = mock("POST", "/eu-west-2/cluster/createNextGroup")
        .with_status(302)
        .with_header("location", &format!("{}/eu-west-2/task/show/9", SERVER_URL))
        .create();
    let _create_task = mock("GET", "/eu-west-2/task/show/9.json")
        .with_status(200)
        .with_body(
            r#"{"status":"completed","log":["2015-01-01_10:00:00 Creating auto scaling group 'baz-prod-v002'"]}"#,
        )
        .create();

    let orch = orchestrator();
    let dep = deployment("d-cancel", "baz", "eu-west-2", Parameters::new());
    orch.engine.store.upsert(&dep).unwrap();

    orch.start("d-cancel").unwrap();
    // the operator asks for cancellation while create-asg is still tracked
    orch.cancel("baz", "prod", "eu-west-2").unwrap();

    let done = wait_until_finished(&orch, "d-cancel");
    assert_eq!(done.tasks[0].status, TaskStatus::Completed);
    for task in &done.tasks[1..] {
        assert_eq!(task.status, TaskStatus::Skipped);
        assert_eq!(task.log.last().unwrap().message, "Skipping: deployment cancelled");
    }
    assert!(!orch
        .engine
        .kv
        .cancel_registered("baz-prod-eu-west-2")
        .unwrap());
    assert!(orch
        .engine
        .kv
        .in_progress("baz-prod-eu-west-2")
        .unwrap()
        .is_none());
}

#[test]
fn a_malformed_redirect_fails_the_deployment() {
    let _cluster = mock("GET", "/ap-southeast-2/cluster/show/qux-prod.json")
        .with_status(404)
        .create();
    let _save = mock("POST", "/ap-southeast-2/autoScaling/save")
        .with_status(302)
        .with_header("location", "surprise")
        .create();

    let orch = orchestrator();
    let dep = deployment("d-bad", "qux", "ap-southeast-2", Parameters::new());
    orch.engine.store.upsert(&dep).unwrap();

    orch.start("d-bad").unwrap();
    let done = wait_until_finished(&orch, "d-bad");

    assert_eq!(done.tasks[0].status, TaskStatus::Failed);
    assert!(done.tasks[0]
        .log
        .last()
        .unwrap()
        .message
        .starts_with("Task failed:"));
    // nothing after the failed task ran
    for task in &done.tasks[1..] {
        assert_eq!(task.status, TaskStatus::Pending);
    }
    assert!(orch
        .engine
        .kv
        .in_progress("qux-prod-ap-southeast-2")
        .unwrap()
        .is_none());
}

#[test]
fn resuming_a_paused_deployment_runs_it_to_completion() {
    let orch = orchestrator();
    // paused after enable-asg; everything left will skip (EC2, no old group)
    let mut params = Parameters::new();
    params.set("health_check_type", "EC2");
    params.set("new_asg_name", "pau-prod");
    let mut dep = deployment("d-pause", "pau", "eu-north-1", params);
    dep.start = Some(dep.created);
    for task in &mut dep.tasks[..3] {
        task.status = TaskStatus::Completed;
    }
    orch.engine.store.upsert(&dep).unwrap();
    let kv = &orch.engine.kv;
    kv.register_in_progress("pau-prod-eu-north-1", "d-pause").unwrap();
    kv.register_paused("pau-prod-eu-north-1", "d-pause").unwrap();
    // a cancel requested while paused dies with the resume
    kv.register_cancel("pau-prod-eu-north-1").unwrap();

    orch.resume("pau", "prod", "eu-north-1").unwrap();

    let done = orch.engine.store.get("d-pause").unwrap().unwrap();
    assert!(done.end.is_some());
    for task in &done.tasks[3..] {
        assert_eq!(task.status, TaskStatus::Skipped);
    }
    assert!(kv.paused("pau-prod-eu-north-1").unwrap().is_none());
    assert!(!kv.cancel_registered("pau-prod-eu-north-1").unwrap());
    assert!(kv.in_progress("pau-prod-eu-north-1").unwrap().is_none());
}

#[test]
fn the_restart_sweep_revives_interrupted_deployments() {
    let _task = mock("GET", "/ca-central-1/task/show/3.json")
        .with_status(200)
        .with_body(r#"{"status":"completed","log":["2015-01-01_10:00:00 Done"]}"#)
        .create();

    let orch = orchestrator();
    // a deployment that died mid enable-asg with a task URL on record;
    // everything after it will skip
    let mut params = Parameters::new();
    params.set("health_check_type", "EC2");
    params.set("new_asg_name", "rev-prod");
    let mut dep = deployment("d-revive", "rev", "ca-central-1", params);
    dep.start = Some(dep.created);
    for task in &mut dep.tasks[..2] {
        task.status = TaskStatus::Completed;
    }
    dep.tasks[2].status = TaskStatus::Running;
    dep.tasks[2].url = Some(format!("{}/ca-central-1/task/show/3.json", SERVER_URL));
    orch.engine.store.upsert(&dep).unwrap();
    orch.engine
        .kv
        .register_in_progress("rev-prod-ca-central-1", "d-revive")
        .unwrap();

    orch.restart_sweep().unwrap();
    let done = wait_until_finished(&orch, "d-revive");

    assert_eq!(done.tasks[2].status, TaskStatus::Completed);
    for task in &done.tasks[3..] {
        assert_eq!(task.status, TaskStatus::Skipped);
    }
    assert!(orch
        .engine
        .kv
        .in_progress("rev-prod-ca-central-1")
        .unwrap()
        .is_none());
}
