// Service catalog for auxiliary containers and staged scripts
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;

pub const DEFAULT_SERVICE_GROUP: &str = "default";

/// One auxiliary container a case may depend on
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceSpec {
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Extra arguments placed after the image (the container command)
    #[serde(default)]
    pub command: Vec<String>,
}

/// Paths of the staged collaborator scripts, relative to the working directory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptPaths {
    pub before: String,
    pub install: String,
    pub test: String,
}

impl Default for ScriptPaths {
    fn default() -> Self {
        Self {
            before: "./tools/test/before_script.sh".to_string(),
            install: "./tools/test/install_script.sh".to_string(),
            test: "./tools/test/test.sh".to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ServicesJson {
    #[serde(default)]
    rdbms: Vec<ServiceSpec>,
    #[serde(default)]
    groups: BTreeMap<String, Vec<ServiceSpec>>,
    #[serde(default)]
    hostnames: Vec<String>,
    #[serde(default)]
    scripts: ScriptPaths,
}

/// Service catalog
#[derive(Debug, Clone)]
pub struct ServiceCatalog {
    rdbms: HashMap<String, ServiceSpec>,
    groups: HashMap<String, Vec<ServiceSpec>>,
    hostnames: Vec<String>,
    scripts: ScriptPaths,
}

impl Default for ServiceCatalog {
    fn default() -> Self {
        let service = |name: &str, image: &str, env: &[(&str, &str)]| ServiceSpec {
            name: name.to_string(),
            image: image.to_string(),
            env: env
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            command: Vec::new(),
        };

        let rdbms = [
            service("oracle", "docker.io/gvenzl/oracle-xe:21-slim", &[("ORACLE_PASSWORD", "oracle")]),
            service("mysql8", "docker.io/mysql:8", &[("MYSQL_ROOT_PASSWORD", "secret"), ("MYSQL_DATABASE", "autotest")]),
            service("postgres14", "docker.io/postgres:14", &[("POSTGRES_USER", "autotest"), ("POSTGRES_PASSWORD", "secret")]),
        ]
        .into_iter()
        .map(|s| (s.name.clone(), s))
        .collect();

        let groups = HashMap::from([(
            DEFAULT_SERVICE_GROUP.to_string(),
            vec![
                service("activemq", "docker.io/webcenter/activemq:latest", &[]),
                service("influxdb", "docker.io/influxdb:latest", &[]),
                service("elasticsearch", "docker.elastic.co/elasticsearch/elasticsearch:7.4.0", &[("discovery.type", "single-node")]),
            ],
        )]);

        Self {
            rdbms,
            groups,
            hostnames: ["db", "activemq", "influxdb", "elasticsearch"]
                .into_iter()
                .map(str::to_string)
                .collect(),
            scripts: ScriptPaths::default(),
        }
    }
}

impl ServiceCatalog {
    /// Load the catalog from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            bail!("Service catalog not found: {}", path.display());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::from_json(&content).with_context(|| format!("Failed to parse {}", path.display()))
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let json: ServicesJson = serde_json::from_str(content)?;

        Ok(Self {
            rdbms: json
                .rdbms
                .into_iter()
                .map(|s| (s.name.clone(), s))
                .collect(),
            groups: json.groups.into_iter().collect(),
            hostnames: json.hostnames,
            scripts: json.scripts,
        })
    }

    /// Load from `path` when given, the built-in catalog otherwise
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    /// Database container for an RDBMS name; unknown names have none
    pub fn rdbms(&self, name: &str) -> Option<&ServiceSpec> {
        self.rdbms.get(name)
    }

    pub fn service_group(&self, name: &str) -> Option<&[ServiceSpec]> {
        self.groups.get(name).map(Vec::as_slice)
    }

    /// Hostnames resolved to loopback inside the primary container
    pub fn hostnames(&self) -> &[String] {
        &self.hostnames
    }

    pub fn scripts(&self) -> &ScriptPaths {
        &self.scripts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_catalog() {
        let catalog = ServiceCatalog::default();
        assert!(catalog.rdbms("postgres14").is_some());
        assert!(catalog.rdbms("sqlite").is_none());
        assert_eq!(catalog.service_group(DEFAULT_SERVICE_GROUP).map(<[_]>::len), Some(3));
        assert_eq!(catalog.scripts().install, "./tools/test/install_script.sh");
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "rdbms": [{{"name": "postgres14", "image": "postgres:14"}}],
                "groups": {{"default": [], "ssh": [{{"name": "ssh", "image": "ssh:1", "command": ["-D"]}}]}},
                "hostnames": ["db"]
            }}"#
        )
        .unwrap();

        let catalog = ServiceCatalog::load(file.path()).unwrap();
        assert_eq!(catalog.rdbms("postgres14").map(|s| s.image.as_str()), Some("postgres:14"));
        assert_eq!(catalog.service_group("ssh").unwrap()[0].command, vec!["-D"]);
        assert_eq!(catalog.service_group("default").map(<[_]>::len), Some(0));
        assert_eq!(catalog.hostnames(), ["db".to_string()]);
        assert_eq!(catalog.scripts(), &ScriptPaths::default());
    }

    #[test]
    fn test_missing_file() {
        let err = ServiceCatalog::load(Path::new("/nonexistent/services.json")).unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn test_bundled_catalog_matches_default() {
        let bundled = ServiceCatalog::from_json(include_str!("../../../config/services.json")).unwrap();
        let builtin = ServiceCatalog::default();

        for name in ["oracle", "mysql8", "postgres14"] {
            assert_eq!(bundled.rdbms(name), builtin.rdbms(name), "{}", name);
        }
        assert_eq!(
            bundled.service_group(DEFAULT_SERVICE_GROUP),
            builtin.service_group(DEFAULT_SERVICE_GROUP)
        );
        assert_eq!(bundled.hostnames(), builtin.hostnames());
        assert_eq!(bundled.scripts(), builtin.scripts());
    }

    #[test]
    fn test_load_or_default_without_path() {
        let catalog = ServiceCatalog::load_or_default(None).unwrap();
        assert!(!catalog.hostnames().is_empty());
    }
}
