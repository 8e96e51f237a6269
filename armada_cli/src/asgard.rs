use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use regex::Regex;
use reqwest::header::{HeaderMap, LOCATION};
use reqwest::StatusCode;

use armada_definitions::{Config, LogEntry};

use super::{Error, Transient};

// All main errors that can happen against the ASG management service

// New failure error type
#[derive(Debug)]
struct AsgardError {
    inner: Context<AErrKind>,
}
// its associated enum
#[derive(Clone, Eq, PartialEq, Debug, Fail)]
pub enum AErrKind {
    #[fail(display = "unexpected response ({}) from {}", _0, _1)]
    UnexpectedResponse(String, String),

    #[fail(display = "no usable task output for '{}'", _0)]
    TaskMissing(String),

    #[fail(display = "auto scaling group '{}' does not exist in {}", _0, _1)]
    MissingAsg(String, String),

    #[fail(display = "security group '{}' is not known to the remote service", _0)]
    UnknownSecurityGroup(String),

    #[fail(display = "environment '{}' has no remote service endpoint", _0)]
    UnknownEnvironment(String),
}
use failure::{Backtrace, Context, Fail};
use std::fmt::{self, Display};

// boilerplate error wrapping (might go away)
impl Fail for AsgardError {
    fn cause(&self) -> Option<&Fail> {
        self.inner.cause()
    }
    fn backtrace(&self) -> Option<&Backtrace> {
        self.inner.backtrace()
    }
}
impl Display for AsgardError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        Display::fmt(&self.inner, f)
    }
}
impl From<AErrKind> for AsgardError {
    fn from(kind: AErrKind) -> AsgardError {
        AsgardError { inner: Context::new(kind) }
    }
}
impl From<Context<AErrKind>> for AsgardError {
    fn from(inner: Context<AErrKind>) -> AsgardError {
        AsgardError { inner: inner }
    }
}
type Result<T> = std::result::Result<T, Error>;

fn http_err(e: reqwest::Error) -> Error {
    Transient::Http(e.to_string()).into()
}

/// Traffic and lifecycle actions on an existing ASG.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterAction {
    Activate,
    Deactivate,
    Delete,
    Resize,
}

impl ClusterAction {
    /// The submit-button field the cluster controller dispatches on.
    fn field(self) -> &'static str {
        match self {
            ClusterAction::Activate => "_action_activate",
            ClusterAction::Deactivate => "_action_deactivate",
            ClusterAction::Delete => "_action_delete",
            ClusterAction::Resize => "_action_resize",
        }
    }

    pub fn describe(self) -> &'static str {
        match self {
            ClusterAction::Activate => "Enabling traffic on",
            ClusterAction::Deactivate => "Disabling traffic on",
            ClusterAction::Delete => "Deleting",
            ClusterAction::Resize => "Resizing",
        }
    }
}

// Wire shapes, field names as the remote service spells them.

#[derive(Debug, Deserialize, Clone)]
pub struct GroupInstance {
    pub instanceId: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Group {
    pub autoScalingGroupName: String,
    #[serde(default)]
    pub instances: Vec<GroupInstance>,
}

#[derive(Debug, Deserialize)]
struct GroupShow {
    group: Group,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Image {
    pub name: String,
}

#[derive(Debug, Deserialize)]
struct ImageShow {
    image: Image,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Instance {
    #[serde(default)]
    pub privateIpAddress: Option<String>,
}

#[derive(Debug, Deserialize)]
struct InstanceShow {
    instance: Instance,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SecurityGroup {
    pub groupId: String,
    pub groupName: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct InstanceState {
    pub instanceId: String,
    pub state: String,
}

#[derive(Debug, Deserialize)]
pub struct LoadBalancerShow {
    #[serde(default)]
    pub instanceStates: Vec<InstanceState>,
}

/// A task document as the remote service reports it.
#[derive(Debug, Deserialize, Clone)]
pub struct RemoteTask {
    pub status: String,
    #[serde(default)]
    pub log: Vec<String>,
    #[serde(default)]
    pub updateTime: Option<String>,
}

impl RemoteTask {
    /// Remote statuses after which the task will not change again.
    pub fn is_terminal(&self) -> bool {
        match self.status.as_str() {
            "completed" | "failed" | "terminated" => true,
            _ => false,
        }
    }
}

/// HTTP client for the ASG management service.
///
/// The service speaks form posts answered with 302s whose `Location` points
/// at the resource or task created, so redirects stay off and callers
/// inspect statuses themselves.
pub struct Asgard {
    client: reqwest::Client,
    environments: BTreeMap<String, String>,
}

impl Asgard {
    pub fn new(conf: &Config) -> Result<Asgard> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::RedirectPolicy::none())
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(15))
            .build()
            .map_err(http_err)?;
        let environments = conf
            .environments
            .iter()
            .map(|(name, env)| (name.clone(), env.asgard.trim_end_matches('/').to_string()))
            .collect();
        Ok(Asgard { client, environments })
    }

    fn base(&self, environment: &str) -> Result<&str> {
        self.environments
            .get(environment)
            .map(|s| s.as_str())
            .ok_or_else(|| Error::from(AErrKind::UnknownEnvironment(environment.into())))
    }

    /// GET returning status and body; non-2xx does not error.
    pub fn get(&self, url: &str) -> Result<(StatusCode, String)> {
        debug!("GET {}", url);
        let mut res = self.client.get(url).send().map_err(http_err)?;
        let body = res.text().map_err(http_err)?;
        Ok((res.status(), body))
    }

    /// POST a form, returning status, headers and body; non-2xx does not error.
    ///
    /// Multi-valued keys appear as repeated pairs in `fields`.
    pub fn post_form(
        &self,
        url: &str,
        fields: &[(String, String)],
    ) -> Result<(StatusCode, HeaderMap, String)> {
        debug!("POST {} ({} fields)", url, fields.len());
        let mut res = self.client.post(url).form(&fields).send().map_err(http_err)?;
        let headers = res.headers().clone();
        let body = res.text().map_err(http_err)?;
        Ok((res.status(), headers, body))
    }

    /// The `Location` of a 302, turned into a pollable task URL.
    fn task_url(headers: &HeaderMap, posted: &str) -> Result<String> {
        let location = headers
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| {
                Error::from(AErrKind::UnexpectedResponse(
                    "302 without a Location".into(),
                    posted.into(),
                ))
            })?;
        if !location.starts_with("http") {
            return Err(AErrKind::UnexpectedResponse(
                format!("302 to unrecognisable location '{}'", location),
                posted.into(),
            ))?;
        }
        if location.ends_with(".json") {
            Ok(location.to_string())
        } else {
            Ok(format!("{}.json", location))
        }
    }

    fn expect_found(status: StatusCode, body: &str, url: &str) -> Result<()> {
        if status != StatusCode::FOUND {
            error!("{} answered {}: {}", url, status, body);
            return Err(AErrKind::UnexpectedResponse(status.to_string(), url.into()))?;
        }
        Ok(())
    }

    /// Create a brand new ASG. The service 302s to the new group's page, so
    /// there is no task to poll; the group name comes out of the `Location`.
    pub fn create_auto_scaling_group(
        &self,
        environment: &str,
        region: &str,
        fields: &[(String, String)],
    ) -> Result<String> {
        let url = format!("{}/{}/autoScaling/save", self.base(environment)?, region);
        let (status, headers, body) = self.post_form(&url, fields)?;
        Asgard::expect_found(status, &body, &url)?;
        let location = headers
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        let re = Regex::new(r"/autoScaling/show/([^/]+)$")?;
        match re.captures(location) {
            Some(caps) => Ok(caps[1].to_string()),
            None => Err(AErrKind::UnexpectedResponse(
                format!("302 to unrecognisable location '{}'", location),
                url,
            ))?,
        }
    }

    /// Cut the next generation of an existing cluster; returns the task URL.
    pub fn create_next_group(
        &self,
        environment: &str,
        region: &str,
        fields: &[(String, String)],
    ) -> Result<String> {
        let url = format!("{}/{}/cluster/createNextGroup", self.base(environment)?, region);
        let (status, headers, body) = self.post_form(&url, fields)?;
        Asgard::expect_found(status, &body, &url)?;
        Asgard::task_url(&headers, &url)
    }

    /// Drive a traffic or lifecycle action against a named ASG; returns the
    /// task URL.
    pub fn cluster_action(
        &self,
        environment: &str,
        region: &str,
        action: ClusterAction,
        asg: &str,
        ticket: &str,
    ) -> Result<String> {
        let url = format!("{}/{}/cluster/index", self.base(environment)?, region);
        let fields = vec![
            (action.field().to_string(), String::new()),
            ("name".to_string(), asg.to_string()),
            ("ticket".to_string(), ticket.to_string()),
        ];
        let (status, headers, body) = self.post_form(&url, &fields)?;
        Asgard::expect_found(status, &body, &url)?;
        Asgard::task_url(&headers, &url)
    }

    /// All ASG generations of a cluster, oldest first.
    /// `None` when the cluster does not exist yet.
    pub fn show_cluster(
        &self,
        environment: &str,
        region: &str,
        cluster: &str,
    ) -> Result<Option<Vec<Group>>> {
        let url = format!(
            "{}/{}/cluster/show/{}.json",
            self.base(environment)?,
            region,
            cluster
        );
        let (status, body) = self.get(&url)?;
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(AErrKind::UnexpectedResponse(status.to_string(), url))?;
        }
        Ok(Some(serde_json::from_str(&body)?))
    }

    /// A single ASG with its instances. `None` when it does not exist.
    pub fn show_group(
        &self,
        environment: &str,
        region: &str,
        asg: &str,
    ) -> Result<Option<Group>> {
        let url = format!(
            "{}/{}/autoScaling/show/{}.json",
            self.base(environment)?,
            region,
            asg
        );
        let (status, body) = self.get(&url)?;
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(AErrKind::UnexpectedResponse(status.to_string(), url))?;
        }
        let show: GroupShow = serde_json::from_str(&body)?;
        Ok(Some(show.group))
    }

    pub fn show_image(&self, environment: &str, region: &str, ami: &str) -> Result<Image> {
        let url = format!("{}/{}/image/show/{}.json", self.base(environment)?, region, ami);
        let (status, body) = self.get(&url)?;
        if !status.is_success() {
            return Err(AErrKind::UnexpectedResponse(status.to_string(), url))?;
        }
        let show: ImageShow = serde_json::from_str(&body)?;
        Ok(show.image)
    }

    pub fn show_instance(
        &self,
        environment: &str,
        region: &str,
        instance_id: &str,
    ) -> Result<Instance> {
        let url = format!(
            "{}/{}/instance/show/{}.json",
            self.base(environment)?,
            region,
            instance_id
        );
        let (status, body) = self.get(&url)?;
        if !status.is_success() {
            return Err(AErrKind::UnexpectedResponse(status.to_string(), url))?;
        }
        let show: InstanceShow = serde_json::from_str(&body)?;
        Ok(show.instance)
    }

    pub fn show_load_balancer(
        &self,
        environment: &str,
        region: &str,
        name: &str,
    ) -> Result<LoadBalancerShow> {
        let url = format!(
            "{}/{}/loadBalancer/show/{}.json",
            self.base(environment)?,
            region,
            name
        );
        let (status, body) = self.get(&url)?;
        if !status.is_success() {
            return Err(AErrKind::UnexpectedResponse(status.to_string(), url))?;
        }
        Ok(serde_json::from_str(&body)?)
    }

    pub fn security_groups(&self, environment: &str, region: &str) -> Result<Vec<SecurityGroup>> {
        let url = format!("{}/{}/security/list.json", self.base(environment)?, region);
        let (status, body) = self.get(&url)?;
        if !status.is_success() {
            return Err(AErrKind::UnexpectedResponse(status.to_string(), url))?;
        }
        Ok(serde_json::from_str(&body)?)
    }

    /// Fetch a task document from its task URL.
    ///
    /// Non-2xx answers are classified transient; the service hiccups
    /// routinely while its tasks run.
    pub fn get_task(&self, url: &str) -> Result<RemoteTask> {
        let (status, body) = self.get(url)?;
        if !status.is_success() {
            return Err(Transient::Http(format!("{} from {}", status, url)).into());
        }
        Ok(serde_json::from_str(&body)?)
    }
}

/// Normalize one remote log line (`YYYY-MM-DD_HH:MM:SS message`).
///
/// Lines that don't lead with the service's timestamp keep their full text.
pub fn normalize_log_line(line: &str) -> LogEntry {
    let mut split = line.splitn(2, ' ');
    let stamp = split.next().unwrap_or("");
    let rest = split.next();
    if let (Ok(ts), Some(message)) = (Utc.datetime_from_str(stamp, "%Y-%m-%d_%H:%M:%S"), rest) {
        LogEntry::new(ts, message)
    } else {
        LogEntry::now(line)
    }
}

/// Parse the remote `updateTime` (`YYYY-MM-DD HH:MM:SS UTC`).
///
/// The service reports a bare `UTC` zone token that no parser accepts, so it
/// is rewritten as a numeric offset first.
pub fn parse_update_time(raw: &str) -> Result<DateTime<Utc>> {
    let rewritten = raw.trim().replace(" UTC", " +0000").replace(" GMT", " +0000");
    let parsed = DateTime::parse_from_str(&rewritten, "%Y-%m-%d %H:%M:%S %z")?;
    Ok(parsed.with_timezone(&Utc))
}
