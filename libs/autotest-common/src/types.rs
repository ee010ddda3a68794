use crate::error::ConfigError;
use crate::images::ImageTable;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::io::Read;

pub const DIST_KEY: &str = "DIST";
pub const PYTHON_KEY: &str = "PYTHON";
pub const SUITE_KEY: &str = "SUITE";
pub const RDBMS_KEY: &str = "RDBMS";
pub const RUN_HTTPD_KEY: &str = "RUN_HTTPD";
pub const SERVICES_KEY: &str = "SERVICES";

/// Separator used to build case identities and label selectors
pub const ID_SEPARATOR: char = '-';

/// One parameterized test case.
///
/// `env` holds every attribute of the case, stringified, and is handed to the
/// primary container as its environment. The derived fields are parsed once
/// at construction and never change afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaseDescriptor {
    env: BTreeMap<String, String>,
    distribution: String,
    runtime_version: String,
    suite: String,
    rdbms: Option<String>,
    use_http_service: bool,
    service_group: Option<String>,
}

impl CaseDescriptor {
    /// Build a descriptor from the raw JSON attributes of a matrix entry
    pub fn from_attributes(attributes: &Map<String, Value>) -> Result<Self, ConfigError> {
        let env: BTreeMap<String, String> = attributes
            .iter()
            .map(|(k, v)| (k.clone(), stringify(v)))
            .collect();

        let required = |key: &'static str| {
            env.get(key)
                .cloned()
                .ok_or(ConfigError::MissingAttribute { attribute: key })
        };

        let distribution = required(DIST_KEY)?;
        let runtime_version = required(PYTHON_KEY)?;
        let suite = required(SUITE_KEY)?;
        let rdbms = env.get(RDBMS_KEY).filter(|v| !v.is_empty()).cloned();
        let service_group = env.get(SERVICES_KEY).filter(|v| !v.is_empty()).cloned();
        let use_http_service = attributes.get(RUN_HTTPD_KEY).map_or(true, truthy);

        Ok(Self {
            env,
            distribution,
            runtime_version,
            suite,
            rdbms,
            use_http_service,
            service_group,
        })
    }

    /// Deterministic identity used for logging and log file naming.
    ///
    /// Joins distribution, `py` + runtime version, suite and rdbms with `-`,
    /// skipping empty parts.
    pub fn case_id(&self) -> String {
        self.id_parts().join(&ID_SEPARATOR.to_string())
    }

    /// Non-empty identity tokens, in identity order
    pub fn id_parts(&self) -> Vec<String> {
        let runtime = format!("py{}", self.runtime_version);
        [
            self.distribution.as_str(),
            runtime.as_str(),
            self.suite.as_str(),
            self.rdbms.as_deref().unwrap_or(""),
        ]
        .into_iter()
        .filter(|part| !part.is_empty())
        .map(str::to_string)
        .collect()
    }

    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    pub fn distribution(&self) -> &str {
        &self.distribution
    }

    pub fn runtime_version(&self) -> &str {
        &self.runtime_version
    }

    pub fn suite(&self) -> &str {
        &self.suite
    }

    pub fn rdbms(&self) -> Option<&str> {
        self.rdbms.as_deref()
    }

    pub fn use_http_service(&self) -> bool {
        self.use_http_service
    }

    /// Auxiliary service group requested by the case, if any
    pub fn service_group(&self) -> Option<&str> {
        self.service_group.as_deref()
    }
}

/// Render a JSON attribute the way it is exported into a container environment
pub fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => {
            let s = s.trim();
            !(s.is_empty() || s == "0" || s.eq_ignore_ascii_case("false"))
        }
        Value::Array(items) => !items.is_empty(),
        Value::Object(fields) => !fields.is_empty(),
    }
}

/// `matrix` may hold a single case object or a list of them
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum MatrixField {
    Many(Vec<Map<String, Value>>),
    One(Map<String, Value>),
}

/// The input document read once at startup
#[derive(Debug, Clone, Deserialize)]
pub struct TestMatrix {
    matrix: MatrixField,
    pub images: ImageTable,
}

impl TestMatrix {
    pub fn from_reader<R: Read>(reader: R) -> Result<Self, ConfigError> {
        serde_json::from_reader(reader).map_err(|e| ConfigError::Matrix(e.to_string()))
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(text).map_err(|e| ConfigError::Matrix(e.to_string()))
    }

    /// Cases in submission order; a single case object becomes a one-element list
    pub fn cases(&self) -> Result<Vec<CaseDescriptor>, ConfigError> {
        match &self.matrix {
            MatrixField::One(attributes) => Ok(vec![CaseDescriptor::from_attributes(attributes)?]),
            MatrixField::Many(entries) => entries.iter().map(CaseDescriptor::from_attributes).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn case(value: Value) -> CaseDescriptor {
        let Value::Object(map) = value else {
            panic!("test case must be an object");
        };
        CaseDescriptor::from_attributes(&map).unwrap()
    }

    #[test]
    fn test_case_id_joins_parts() {
        let c = case(json!({"DIST": "alma9", "PYTHON": "3.9", "SUITE": "client", "RDBMS": "postgres14"}));
        assert_eq!(c.case_id(), "alma9-py3.9-client-postgres14");
    }

    #[test]
    fn test_case_id_ignores_unrelated_fields() {
        let a = case(json!({"DIST": "d1", "PYTHON": "3.9", "SUITE": "core", "FOO": "1"}));
        let b = case(json!({"DIST": "d1", "PYTHON": "3.9", "SUITE": "core", "BAR": "x", "RUN_HTTPD": false}));
        assert_eq!(a.case_id(), b.case_id());
    }

    #[test]
    fn test_empty_rdbms_collapses_separator() {
        let with = case(json!({"DIST": "d1", "PYTHON": "3.9", "SUITE": "core", "RDBMS": "mysql8"}));
        let without = case(json!({"DIST": "d1", "PYTHON": "3.9", "SUITE": "core", "RDBMS": ""}));
        assert_eq!(without.case_id(), "d1-py3.9-core");
        assert!(without.case_id().len() < with.case_id().len());
        assert_eq!(without.rdbms(), None);
    }

    #[test]
    fn test_run_httpd_defaults_to_true() {
        let c = case(json!({"DIST": "d1", "PYTHON": "3.9", "SUITE": "core"}));
        assert!(c.use_http_service());

        for off in [json!(false), json!("false"), json!("0"), json!(0), json!("")] {
            let c = case(json!({"DIST": "d1", "PYTHON": "3.9", "SUITE": "core", "RUN_HTTPD": off}));
            assert!(!c.use_http_service());
        }
    }

    #[test]
    fn test_values_are_stringified() {
        let c = case(json!({"DIST": "d1", "PYTHON": 3.9, "SUITE": "core", "RUN_HTTPD": true}));
        assert_eq!(c.env().get("PYTHON").map(String::as_str), Some("3.9"));
        assert_eq!(c.env().get("RUN_HTTPD").map(String::as_str), Some("true"));
        assert_eq!(c.runtime_version(), "3.9");
        assert_eq!(c.distribution(), "d1");
        assert_eq!(c.suite(), "core");
    }

    #[test]
    fn test_missing_attribute_is_config_error() {
        let Value::Object(map) = json!({"DIST": "d1", "SUITE": "core"}) else {
            unreachable!()
        };
        let err = CaseDescriptor::from_attributes(&map).unwrap_err();
        assert!(matches!(err, ConfigError::MissingAttribute { attribute: "PYTHON" }));
    }

    #[test]
    fn test_single_case_matrix_is_normalized() {
        let m = TestMatrix::from_json(
            r#"{"matrix": {"DIST": "d1", "PYTHON": "3.9", "SUITE": "core"}, "images": {"d1-py3.9": "img:tag"}}"#,
        )
        .unwrap();
        let cases = m.cases().unwrap();
        assert_eq!(cases.len(), 1);
        assert_eq!(cases[0].case_id(), "d1-py3.9-core");
    }

    #[test]
    fn test_case_list_keeps_order() {
        let m = TestMatrix::from_json(
            r#"{"matrix": [
                {"DIST": "a", "PYTHON": "3.9", "SUITE": "s1"},
                {"DIST": "b", "PYTHON": "3.10", "SUITE": "s2"}
            ], "images": {}}"#,
        )
        .unwrap();
        let ids: Vec<_> = m.cases().unwrap().iter().map(CaseDescriptor::case_id).collect();
        assert_eq!(ids, vec!["a-py3.9-s1", "b-py3.10-s2"]);
    }

    #[test]
    fn test_malformed_document() {
        assert!(matches!(TestMatrix::from_json(r#"{"images": {}}"#), Err(ConfigError::Matrix(_))));
    }
}
