use serde_json::Value;

use armada_definitions::{Config, Deployment};

use super::asgard::{AErrKind, Asgard, SecurityGroup};
use super::Result;

/// Keys consumed by the explicit builders below; anything else in the
/// parameter map is passed through verbatim (exploded when multi-valued).
const HANDLED: &[&str] = &[
    "min",
    "max",
    "desired_capacity",
    "health_check_type",
    "selected_load_balancers",
    "selected_security_groups",
    "selected_zones",
    "subnet_purpose",
    "key_name",
    "new_asg_name",
    "old_asg_name",
    "healthcheck_port",
    "healthcheck_path",
];

/// Build the exploded form fields for a create-ASG submission.
///
/// Multi-valued keys are repeated, never joined.
pub fn launch_fields(
    conf: &Config,
    asgard: &Asgard,
    dep: &Deployment,
) -> Result<Vec<(String, String)>> {
    let params = &dep.parameters;
    let mut fields: Vec<(String, String)> = vec![
        ("appName".into(), dep.application.clone()),
        ("stack".into(), dep.environment.clone()),
        ("imageId".into(), dep.ami.clone()),
        ("ticket".into(), dep.id.clone()),
    ];

    if let Some(min) = params.min() {
        fields.push(("min".into(), min.to_string()));
    }
    if let Some(max) = params.max() {
        fields.push(("max".into(), max.to_string()));
    }
    if let Some(desired) = params.desired_capacity() {
        fields.push(("desiredCapacity".into(), desired.to_string()));
    }
    if let Some(hc) = params.health_check_type() {
        fields.push(("healthCheckType".into(), hc));
    }
    if let Some(key) = params.key_name().or_else(|| conf.defaults.key_name.clone()) {
        fields.push(("keyName".into(), key));
    }
    if let Some(purpose) = params.subnet_purpose() {
        fields.push(("subnetPurpose".into(), purpose));
    }

    // zones are submitted fully qualified
    for zone in params.selected_zones() {
        fields.push(("selectedZones".into(), qualify_zone(&dep.region, &zone)));
    }

    // security groups go over as ids, with the standard healthcheck and
    // monitoring groups attached
    let mut groups = params.selected_security_groups();
    if let Some(ref g) = conf.defaults.healthcheck_security_group {
        groups.push(g.clone());
    }
    if let Some(ref g) = conf.defaults.monitoring_security_group {
        groups.push(g.clone());
    }
    if !groups.is_empty() {
        let listing = asgard.security_groups(&dep.environment, &dep.region)?;
        for group in groups {
            fields.push((
                "selectedSecurityGroups".into(),
                resolve_security_group(&listing, &group)?,
            ));
        }
    }

    // load balancers move under the VPC key on internal subnets
    let lbs = params.selected_load_balancers();
    if !lbs.is_empty() {
        let key = load_balancer_key(conf, dep)?;
        for lb in lbs {
            fields.push((key.clone(), lb));
        }
    }

    // service-specific keys ride along untouched
    for (key, value) in params.iter() {
        if HANDLED.contains(&key.as_str()) {
            continue;
        }
        match value {
            Value::Array(items) => {
                for item in items {
                    fields.push((camel(key), scalar(item)));
                }
            }
            other => fields.push((camel(key), scalar(other))),
        }
    }

    Ok(fields)
}

/// `"a"` becomes `"eu-west-1a"`; already-qualified zones pass through.
fn qualify_zone(region: &str, zone: &str) -> String {
    if zone.starts_with(region) {
        zone.to_string()
    } else {
        format!("{}{}", region, zone)
    }
}

/// Names that are not already ids are translated via the service listing.
fn resolve_security_group(listing: &[SecurityGroup], name_or_id: &str) -> Result<String> {
    if name_or_id.starts_with("sg-") {
        return Ok(name_or_id.to_string());
    }
    listing
        .iter()
        .find(|g| g.groupName == name_or_id)
        .map(|g| g.groupId.clone())
        .ok_or_else(|| AErrKind::UnknownSecurityGroup(name_or_id.to_string()).into())
}

/// Internal subnets address load balancers by VPC id rather than name.
fn load_balancer_key(conf: &Config, dep: &Deployment) -> Result<String> {
    let internal = dep
        .parameters
        .subnet_purpose()
        .map(|p| p == "internal")
        .unwrap_or(false);
    if !internal {
        return Ok("selectedLoadBalancers".to_string());
    }
    let vpc = conf
        .environment(&dep.environment)?
        .vpc_id
        .clone()
        .ok_or_else(|| {
            format_err!(
                "environment {} has no vpc id for internal load balancers",
                dep.environment
            )
        })?;
    Ok(format!("selectedLoadBalancersForVpcId{}", vpc))
}

fn camel(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    let mut upper_next = false;
    for c in key.chars() {
        if c == '_' {
            upper_next = true;
        } else if upper_next {
            out.extend(c.to_uppercase());
            upper_next = false;
        } else {
            out.push(c);
        }
    }
    out
}

fn scalar(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use armada_definitions::config::{DeployDefaults, Environment};
    use armada_definitions::Parameters;
    use mockito::{mock, SERVER_URL};
    use serde_json::json;
    use std::collections::BTreeMap;

    fn config(vpc: Option<&str>) -> Config {
        let mut environments = BTreeMap::new();
        environments.insert(
            "prod".to_string(),
            Environment {
                asgard: SERVER_URL.to_string(),
                vpc_id: vpc.map(String::from),
            },
        );
        Config {
            environments,
            metadata: SERVER_URL.to_string(),
            redis: Default::default(),
            queue: Default::default(),
            tracker: Default::default(),
            defaults: DeployDefaults {
                key_name: Some("deploy-key".into()),
                ..Default::default()
            },
        }
    }

    fn deployment(params: Parameters) -> Deployment {
        Deployment::new(
            "d-1", "foo", "prod", "eu-west-1", "ami-1", "jo", "", "abc", params,
        )
    }

    fn values_of<'a>(fields: &'a [(String, String)], key: &str) -> Vec<&'a str> {
        fields
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
            .collect()
    }

    #[test]
    fn zones_are_prefixed_with_the_region() {
        let conf = config(None);
        let asgard = Asgard::new(&conf).unwrap();
        let mut params = Parameters::new();
        params.set("selected_zones", json!(["a", "eu-west-1b"]));
        let fields = launch_fields(&conf, &asgard, &deployment(params)).unwrap();
        assert_eq!(
            values_of(&fields, "selectedZones"),
            vec!["eu-west-1a", "eu-west-1b"]
        );
    }

    #[test]
    fn load_balancers_are_repeated_not_joined() {
        let conf = config(None);
        let asgard = Asgard::new(&conf).unwrap();
        let mut params = Parameters::new();
        params.set("selected_load_balancers", json!(["lb-1", "lb-2"]));
        let fields = launch_fields(&conf, &asgard, &deployment(params)).unwrap();
        assert_eq!(values_of(&fields, "selectedLoadBalancers"), vec!["lb-1", "lb-2"]);
    }

    #[test]
    fn internal_subnets_address_load_balancers_by_vpc() {
        let conf = config(Some("vpc-f00f"));
        let asgard = Asgard::new(&conf).unwrap();
        let mut params = Parameters::new();
        params.set("subnet_purpose", "internal");
        params.set("selected_load_balancers", "lb-1");
        let fields = launch_fields(&conf, &asgard, &deployment(params)).unwrap();
        assert_eq!(values_of(&fields, "selectedLoadBalancers"), Vec::<&str>::new());
        assert_eq!(
            values_of(&fields, "selectedLoadBalancersForVpcIdvpc-f00f"),
            vec!["lb-1"]
        );
    }

    #[test]
    fn security_group_names_become_ids() {
        let _m = mock("GET", "/eu-west-1/security/list.json")
            .with_status(200)
            .with_body(r#"[{"groupId":"sg-1111","groupName":"web"},{"groupId":"sg-2222","groupName":"db"}]"#)
            .create();

        let conf = config(None);
        let asgard = Asgard::new(&conf).unwrap();
        let mut params = Parameters::new();
        params.set("selected_security_groups", json!(["web", "sg-9999"]));
        let fields = launch_fields(&conf, &asgard, &deployment(params)).unwrap();
        assert_eq!(
            values_of(&fields, "selectedSecurityGroups"),
            vec!["sg-1111", "sg-9999"]
        );
    }

    #[test]
    fn unknown_security_groups_are_refused() {
        let _m = mock("GET", "/eu-west-1/security/list.json")
            .with_status(200)
            .with_body("[]")
            .create();

        let conf = config(None);
        let asgard = Asgard::new(&conf).unwrap();
        let mut params = Parameters::new();
        params.set("selected_security_groups", "mystery");
        let err = launch_fields(&conf, &asgard, &deployment(params)).unwrap_err();
        match err.downcast_ref::<AErrKind>() {
            Some(AErrKind::UnknownSecurityGroup(name)) => assert_eq!(name, "mystery"),
            other => panic!("wrong error: {:?}", other),
        }
    }

    #[test]
    fn extra_keys_pass_through_in_camel_case() {
        let conf = config(None);
        let asgard = Asgard::new(&conf).unwrap();
        let mut params = Parameters::new();
        params.set("termination_policy", "OldestInstance");
        params.set("min", 2);
        let fields = launch_fields(&conf, &asgard, &deployment(params)).unwrap();
        assert_eq!(values_of(&fields, "terminationPolicy"), vec!["OldestInstance"]);
        assert_eq!(values_of(&fields, "min"), vec!["2"]);
        assert_eq!(values_of(&fields, "keyName"), vec!["deploy-key"]);
        assert_eq!(values_of(&fields, "ticket"), vec!["d-1"]);
    }
}
