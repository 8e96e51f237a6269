use std::collections::BTreeMap;

use serde_json::Value;

/// The nested parameter map carried by a deployment.
///
/// Documents keep snake_case keys; the wire-level camelCase spellings are
/// produced by the transform layer at submission time. Values stay as loose
/// JSON because the remote service grows keys faster than we do, so the
/// typed accessors below coerce rather than reject.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct Parameters(BTreeMap<String, Value>);

impl Parameters {
    pub fn new() -> Parameters {
        Parameters(BTreeMap::new())
    }

    /// Strict merge precedence: defaults, then user-supplied, then protected.
    ///
    /// Protected keys are operation-owned and cannot be overridden.
    pub fn merged(defaults: &Parameters, user: &Parameters, protected: &Parameters) -> Parameters {
        let mut out = defaults.clone();
        out.absorb(user);
        out.absorb(protected);
        out
    }

    /// Fold `other` over `self`; `other` wins on conflicting keys.
    pub fn absorb(&mut self, other: &Parameters) {
        for (k, v) in &other.0 {
            self.0.insert(k.clone(), v.clone());
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn set<K, V>(&mut self, key: K, value: V)
    where
        K: Into<String>,
        V: Into<Value>,
    {
        self.0.insert(key.into(), value.into());
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// A scalar as a string; numbers are coerced.
    fn string(&self, key: &str) -> Option<String> {
        match self.0.get(key) {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        }
    }

    /// A scalar as a number; numeric strings are coerced.
    fn number(&self, key: &str) -> Option<u64> {
        match self.0.get(key) {
            Some(Value::Number(n)) => n.as_u64(),
            Some(Value::String(s)) => s.parse().ok(),
            _ => None,
        }
    }

    /// A scalar-or-list value, normalized to a list of strings.
    fn list(&self, key: &str) -> Vec<String> {
        match self.0.get(key) {
            Some(Value::String(s)) => vec![s.clone()],
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|v| match v {
                    Value::String(s) => Some(s.clone()),
                    Value::Number(n) => Some(n.to_string()),
                    _ => None,
                })
                .collect(),
            _ => Vec::new(),
        }
    }

    pub fn min(&self) -> Option<u64> {
        self.number("min")
    }

    pub fn max(&self) -> Option<u64> {
        self.number("max")
    }

    pub fn desired_capacity(&self) -> Option<u64> {
        self.number("desired_capacity")
    }

    pub fn health_check_type(&self) -> Option<String> {
        self.string("health_check_type")
    }

    /// Accepts both a single name and a list of names.
    pub fn selected_load_balancers(&self) -> Vec<String> {
        self.list("selected_load_balancers")
    }

    pub fn new_asg_name(&self) -> Option<String> {
        self.string("new_asg_name")
    }

    pub fn old_asg_name(&self) -> Option<String> {
        self.string("old_asg_name")
    }

    pub fn subnet_purpose(&self) -> Option<String> {
        self.string("subnet_purpose")
    }

    pub fn selected_security_groups(&self) -> Vec<String> {
        self.list("selected_security_groups")
    }

    pub fn selected_zones(&self) -> Vec<String> {
        self.list("selected_zones")
    }

    pub fn key_name(&self) -> Option<String> {
        self.string("key_name")
    }

    pub fn healthcheck_port(&self) -> Option<u64> {
        self.number("healthcheck_port")
    }

    pub fn healthcheck_path(&self) -> Option<String> {
        self.string("healthcheck_path")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(pairs: &[(&str, Value)]) -> Parameters {
        let mut p = Parameters::new();
        for (k, v) in pairs {
            p.set(*k, v.clone());
        }
        p
    }

    #[test]
    fn merge_precedence_is_defaults_user_protected() {
        let defaults = params(&[
            ("min", json!(1)),
            ("max", json!(2)),
            ("subnet_purpose", json!("internal")),
        ]);
        let user = params(&[("min", json!(3)), ("key_name", json!("deploy"))]);
        let protected = params(&[("min", json!(9)), ("new_asg_name", json!("foo-prod"))]);

        let merged = Parameters::merged(&defaults, &user, &protected);
        // protected if present, else user, else default
        assert_eq!(merged.min(), Some(9));
        assert_eq!(merged.key_name(), Some("deploy".to_string()));
        assert_eq!(merged.max(), Some(2));
        assert_eq!(merged.subnet_purpose(), Some("internal".to_string()));
        assert_eq!(merged.new_asg_name(), Some("foo-prod".to_string()));
    }

    #[test]
    fn load_balancers_scalar_or_list() {
        let scalar = params(&[("selected_load_balancers", json!("lb-1"))]);
        assert_eq!(scalar.selected_load_balancers(), vec!["lb-1".to_string()]);

        let list = params(&[("selected_load_balancers", json!(["lb-1", "lb-2"]))]);
        assert_eq!(
            list.selected_load_balancers(),
            vec!["lb-1".to_string(), "lb-2".to_string()]
        );

        assert!(Parameters::new().selected_load_balancers().is_empty());
    }

    #[test]
    fn numbers_coerce_from_strings() {
        let p = params(&[("min", json!("4")), ("max", json!(6))]);
        assert_eq!(p.min(), Some(4));
        assert_eq!(p.max(), Some(6));
        assert_eq!(p.desired_capacity(), None);
    }

    #[test]
    fn serializes_as_a_plain_map() {
        let p = params(&[("min", json!(1))]);
        let json = serde_json::to_string(&p).unwrap();
        assert_eq!(json, r#"{"min":1}"#);
        let back: Parameters = serde_json::from_str(&json).unwrap();
        assert_eq!(back, p);
    }
}
