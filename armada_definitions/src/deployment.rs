use chrono::{DateTime, Utc};

use crate::params::Parameters;

/// Status of a single pipeline task.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Terminated,
    Skipped,
}

impl TaskStatus {
    /// Whether a task in this status will never run again.
    pub fn is_terminal(self) -> bool {
        match self {
            TaskStatus::Completed
            | TaskStatus::Failed
            | TaskStatus::Terminated
            | TaskStatus::Skipped => true,
            TaskStatus::Pending | TaskStatus::Running => false,
        }
    }
}

/// The closed set of pipeline actions.
///
/// `ordered` returns them in deployment order; the engine dispatches on the
/// variant, so an unknown action cannot be represented at all.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskAction {
    #[serde(rename = "create-asg")]
    CreateAsg,
    #[serde(rename = "wait-for-instance-health")]
    WaitForInstanceHealth,
    #[serde(rename = "enable-asg")]
    EnableAsg,
    #[serde(rename = "wait-for-elb-health")]
    WaitForElbHealth,
    #[serde(rename = "disable-asg")]
    DisableAsg,
    #[serde(rename = "delete-asg")]
    DeleteAsg,
}

impl TaskAction {
    /// Every action of a standard deployment, in execution order.
    pub fn ordered() -> Vec<TaskAction> {
        vec![
            TaskAction::CreateAsg,
            TaskAction::WaitForInstanceHealth,
            TaskAction::EnableAsg,
            TaskAction::WaitForElbHealth,
            TaskAction::DisableAsg,
            TaskAction::DeleteAsg,
        ]
    }
}

impl std::fmt::Display for TaskAction {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let name = match self {
            TaskAction::CreateAsg => "create-asg",
            TaskAction::WaitForInstanceHealth => "wait-for-instance-health",
            TaskAction::EnableAsg => "enable-asg",
            TaskAction::WaitForElbHealth => "wait-for-elb-health",
            TaskAction::DisableAsg => "disable-asg",
            TaskAction::DeleteAsg => "delete-asg",
        };
        write!(f, "{}", name)
    }
}

/// A timestamped line in a task's log.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

impl LogEntry {
    pub fn new<S: Into<String>>(timestamp: DateTime<Utc>, message: S) -> LogEntry {
        LogEntry { timestamp, message: message.into() }
    }

    pub fn now<S: Into<String>>(message: S) -> LogEntry {
        LogEntry::new(Utc::now(), message)
    }
}

/// One element of a deployment's ordered task list.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Task {
    /// Unique within the owning deployment
    pub task_id: String,

    pub action: TaskAction,

    pub status: TaskStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<DateTime<Utc>>,

    /// Remote task resource being polled, when the action runs remotely
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// Last update time the remote service reported for this task
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub log: Vec<LogEntry>,
}

impl Task {
    pub fn new<S: Into<String>>(task_id: S, action: TaskAction) -> Task {
        Task {
            task_id: task_id.into(),
            action,
            status: TaskStatus::Pending,
            start: None,
            end: None,
            url: None,
            updated: None,
            log: Vec::new(),
        }
    }

    /// Append a timestamped line to the task log.
    pub fn record<S: Into<String>>(&mut self, message: S) {
        self.log.push(LogEntry::now(message));
    }
}

/// The coordination key for one deployable target.
pub fn coordinate(application: &str, environment: &str, region: &str) -> String {
    format!("{}-{}-{}", application, environment, region)
}

/// A deployment document; the authoritative history of one deployment.
///
/// The coordination store only carries advisory indexes into these.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Deployment {
    pub id: String,
    pub application: String,
    pub environment: String,
    pub region: String,
    /// Machine image being rolled out
    pub ami: String,
    pub user: String,
    #[serde(default)]
    pub message: String,
    /// Configuration revision the deployment was built against
    #[serde(default)]
    pub hash: String,
    #[serde(default)]
    pub parameters: Parameters,
    pub tasks: Vec<Task>,
    pub created: DateTime<Utc>,
    /// Set when the first task begins
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<DateTime<Utc>>,
    /// Set only on completion or abandonment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<DateTime<Utc>>,
}

impl Deployment {
    pub fn new(
        id: &str,
        application: &str,
        environment: &str,
        region: &str,
        ami: &str,
        user: &str,
        message: &str,
        hash: &str,
        parameters: Parameters,
    ) -> Deployment {
        Deployment {
            id: id.into(),
            application: application.into(),
            environment: environment.into(),
            region: region.into(),
            ami: ami.into(),
            user: user.into(),
            message: message.into(),
            hash: hash.into(),
            parameters,
            tasks: Deployment::standard_tasks(),
            created: Utc::now(),
            start: None,
            end: None,
        }
    }

    /// The fixed task list of a standard deployment, all pending.
    pub fn standard_tasks() -> Vec<Task> {
        TaskAction::ordered()
            .into_iter()
            .enumerate()
            .map(|(i, action)| Task::new(format!("{}", i + 1), action))
            .collect()
    }

    /// The mutual-exclusion key this deployment contends on.
    pub fn coordinate(&self) -> String {
        coordinate(&self.application, &self.environment, &self.region)
    }

    /// Logical grouping of successive ASG generations for this target.
    pub fn cluster(&self) -> String {
        format!("{}-{}", self.application, self.environment)
    }

    pub fn task(&self, task_id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.task_id == task_id)
    }

    /// The next task that has not started yet.
    pub fn next_pending(&self) -> Option<&Task> {
        self.tasks.iter().find(|t| t.status == TaskStatus::Pending)
    }

    /// The first task still in a non-terminal status, if any.
    pub fn first_incomplete(&self) -> Option<&Task> {
        self.tasks.iter().find(|t| !t.status.is_terminal())
    }

    /// Mark every task that has not run as skipped, with a log entry.
    pub fn skip_remaining(&mut self, reason: &str) {
        let now = Utc::now();
        for task in &mut self.tasks {
            if !task.status.is_terminal() {
                task.status = TaskStatus::Skipped;
                task.end = Some(now);
                task.log.push(LogEntry::new(now, reason));
            }
        }
    }
}
