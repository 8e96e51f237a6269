use std::sync::Arc;

use regex::Regex;
use uuid::Uuid;

use armada_definitions::{Deployment, Parameters};

use super::asgard::Asgard;
use super::kv::Kv;
use super::metadata::MetadataService;
use super::store::DeploymentStore;
use super::Result;

/// Why a request never became a deployment.
#[derive(Clone, Eq, PartialEq, Debug, Fail)]
pub enum IntakeError {
    #[fail(display = "image {} belongs to '{}', not '{}'", _0, _1, _2)]
    ImageMismatch(String, String, String),

    #[fail(display = "invalid deployment request: {}", _0)]
    Validation(String),

    #[fail(display = "deployment intake is locked")]
    Locked,
}

/// A request to deploy an image of an application somewhere.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct DeploymentRequest {
    pub application: String,
    pub environment: String,
    pub region: String,
    pub ami: String,
    pub user: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub parameters: Parameters,
}

/// Validates requests and turns them into queued deployment documents.
pub struct Intake {
    kv: Arc<Kv>,
    store: Arc<DeploymentStore>,
    asgard: Arc<Asgard>,
    metadata: MetadataService,
}

impl Intake {
    pub fn new(
        kv: Arc<Kv>,
        store: Arc<DeploymentStore>,
        asgard: Arc<Asgard>,
        metadata: MetadataService,
    ) -> Intake {
        Intake { kv, store, asgard, metadata }
    }

    /// Admit a request: validate it, resolve its parameters, persist the
    /// document and enqueue the id. Nothing is written for rejected
    /// requests.
    pub fn accept(&self, req: &DeploymentRequest) -> Result<String> {
        self.validate(req)?;
        if self.kv.locked()? {
            return Err(IntakeError::Locked.into());
        }

        // the image must actually be of the application being deployed
        let image = self
            .asgard
            .show_image(&req.environment, &req.region, &req.ami)?;
        let embedded = application_of(&image.name);
        if embedded != req.application {
            return Err(IntakeError::ImageMismatch(
                req.ami.clone(),
                embedded,
                req.application.clone(),
            )
            .into());
        }

        let mut defaults = self
            .metadata
            .application_properties(&req.application, &req.environment)?;
        defaults.absorb(
            &self
                .metadata
                .deployment_parameters(&req.application, &req.environment)?,
        );
        let params = Parameters::merged(&defaults, &req.parameters, &Parameters::new());
        let hash = self.metadata.active_hash(&req.application, &req.environment)?;

        let id = Uuid::new_v4().to_string();
        let dep = Deployment::new(
            &id,
            &req.application,
            &req.environment,
            &req.region,
            &req.ami,
            &req.user,
            &req.message,
            &hash,
            params,
        );
        self.store.upsert(&dep)?;
        self.kv.enqueue(&id)?;
        info!(
            "accepted deployment {} of {} ({}) to {}/{}",
            id, req.application, req.ami, req.environment, req.region
        );
        Ok(id)
    }

    fn validate(&self, req: &DeploymentRequest) -> Result<()> {
        let name = Regex::new(r"^[0-9a-z][0-9a-z_-]*$")?;
        for (field, value) in &[
            ("application", &req.application),
            ("environment", &req.environment),
            ("region", &req.region),
        ] {
            if !name.is_match(value) {
                return Err(IntakeError::Validation(format!(
                    "{} '{}' is not a valid name",
                    field, value
                ))
                .into());
            }
        }
        let ami = Regex::new(r"^ami-[0-9a-f]+$")?;
        if !ami.is_match(&req.ami) {
            return Err(
                IntakeError::Validation(format!("'{}' is not an image id", req.ami)).into(),
            );
        }
        if req.user.trim().is_empty() {
            return Err(IntakeError::Validation("user must be given".into()).into());
        }
        Ok(())
    }
}

/// The application name embedded in an image name.
///
/// Image names lead with the application (`webapp-1.2.3-h42.abc`), so take
/// dash-separated segments until one starts a version number.
pub fn application_of(image_name: &str) -> String {
    image_name
        .split('-')
        .take_while(|segment| {
            !segment
                .chars()
                .next()
                .map(|c| c.is_ascii_digit())
                .unwrap_or(true)
        })
        .collect::<Vec<_>>()
        .join("-")
}
