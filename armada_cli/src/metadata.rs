use std::time::Duration;

use reqwest::StatusCode;

use armada_definitions::{Config, Parameters};

use super::Result;

#[derive(Debug, Deserialize)]
struct HashResponse {
    hash: String,
}

/// HTTP client for the configuration-source service.
///
/// Contract boundary only: the service owns per-application deployment
/// parameters, application properties and the active configuration revision.
pub struct MetadataService {
    client: reqwest::Client,
    base: String,
}

impl MetadataService {
    pub fn new(conf: &Config) -> Result<MetadataService> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(15))
            .build()?;
        Ok(MetadataService {
            client,
            base: conf.metadata.trim_end_matches('/').to_string(),
        })
    }

    fn get(&self, url: &str) -> Result<(StatusCode, String)> {
        debug!("GET {}", url);
        let mut res = self.client.get(url).send()?;
        let body = res.text()?;
        Ok((res.status(), body))
    }

    /// Per-(application, environment) deployment parameter defaults.
    ///
    /// An application with nothing configured simply gets no defaults.
    pub fn deployment_parameters(
        &self,
        application: &str,
        environment: &str,
    ) -> Result<Parameters> {
        let url = format!(
            "{}/applications/{}/{}/deployment-params",
            self.base, application, environment
        );
        let (status, body) = self.get(&url)?;
        if status == StatusCode::NOT_FOUND {
            return Ok(Parameters::default());
        }
        ensure!(status.is_success(), "unexpected response {} from {}", status, url);
        Ok(serde_json::from_str(&body)?)
    }

    /// Application properties; healthcheck port and path among them.
    pub fn application_properties(
        &self,
        application: &str,
        environment: &str,
    ) -> Result<Parameters> {
        let url = format!(
            "{}/applications/{}/{}/properties",
            self.base, application, environment
        );
        let (status, body) = self.get(&url)?;
        if status == StatusCode::NOT_FOUND {
            return Ok(Parameters::default());
        }
        ensure!(status.is_success(), "unexpected response {} from {}", status, url);
        Ok(serde_json::from_str(&body)?)
    }

    /// The configuration revision a deployment is built against.
    pub fn active_hash(&self, application: &str, environment: &str) -> Result<String> {
        let url = format!("{}/applications/{}/{}/hash", self.base, application, environment);
        let (status, body) = self.get(&url)?;
        ensure!(status.is_success(), "unexpected response {} from {}", status, url);
        let parsed: HashResponse = serde_json::from_str(&body)?;
        Ok(parsed.hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use armada_definitions::config::Environment;
    use mockito::{mock, SERVER_URL};
    use std::collections::BTreeMap;

    fn service() -> MetadataService {
        let mut environments = BTreeMap::new();
        environments.insert(
            "prod".to_string(),
            Environment { asgard: SERVER_URL.to_string(), vpc_id: None },
        );
        let conf = Config {
            environments,
            metadata: SERVER_URL.to_string(),
            redis: Default::default(),
            queue: Default::default(),
            tracker: Default::default(),
            defaults: Default::default(),
        };
        MetadataService::new(&conf).unwrap()
    }

    #[test]
    fn missing_parameter_sets_are_empty_not_fatal() {
        let _m = mock("GET", "/applications/newapp/prod/deployment-params")
            .with_status(404)
            .create();
        let params = service().deployment_parameters("newapp", "prod").unwrap();
        assert!(params.is_empty());
    }

    #[test]
    fn parameters_parse_as_a_map() {
        let _m = mock("GET", "/applications/webapp/prod/deployment-params")
            .with_status(200)
            .with_body(r#"{"min":2,"selected_load_balancers":"lb-1"}"#)
            .create();
        let params = service().deployment_parameters("webapp", "prod").unwrap();
        assert_eq!(params.min(), Some(2));
        assert_eq!(params.selected_load_balancers(), vec!["lb-1".to_string()]);
    }

    #[test]
    fn the_active_hash_is_required() {
        let _m = mock("GET", "/applications/webapp/prod/hash")
            .with_status(200)
            .with_body(r#"{"hash":"cafebabe"}"#)
            .create();
        assert_eq!(service().active_hash("webapp", "prod").unwrap(), "cafebabe");

        let _m2 = mock("GET", "/applications/ghost/prod/hash").with_status(404).create();
        assert!(service().active_hash("ghost", "prod").is_err());
    }
}
