// Auxiliary service composition
//
// Every auxiliary container of a case is built from the same `Placement`, so
// they all share the primary container's pod or network namespace. The group
// is started together and released together.

use crate::config::{ServiceCatalog, ServiceSpec, DEFAULT_SERVICE_GROUP};
use crate::engine::{CleanupDiagnostic, ContainerHandle, ContainerSpec, RuntimeArgs};
use crate::process::{CommandRunner, PhaseError};
use crate::sink::CaseLog;
use autotest_common::CaseDescriptor;
use futures_util::future::join_all;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

/// Isolation parameters shared by every container of one case
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    pub runtime: RuntimeArgs,
    pub run_args: Vec<String>,
}

impl Placement {
    /// Join the pod when there is one, the primary container's network otherwise
    pub fn for_case(runtime: &RuntimeArgs, pod_args: &[String], primary: &ContainerHandle) -> Self {
        let run_args = if runtime.engine.supports_pods() && !pod_args.is_empty() {
            pod_args.to_vec()
        } else {
            vec!["--network".to_string(), format!("container:{}", primary.id())]
        };

        Self {
            runtime: runtime.clone(),
            run_args,
        }
    }

    pub fn container_spec(&self, service: &ServiceSpec) -> ContainerSpec {
        ContainerSpec {
            image: service.image.clone(),
            run_args: self.run_args.clone(),
            env: service.env.clone(),
            command: service.command.clone(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ComposeError {
    #[error("unknown service group '{0}'")]
    UnknownGroup(String),

    #[error("failed to start service {service}: {source}")]
    Start {
        service: String,
        #[source]
        source: PhaseError,
        /// Problems releasing the services that did start
        cleanup: Vec<CleanupDiagnostic>,
    },
}

/// The auxiliary containers of one case
pub struct ServiceGroup {
    members: Vec<(String, ContainerHandle)>,
    database: Option<String>,
}

impl ServiceGroup {
    /// Services a case needs: its database (if the catalog knows the RDBMS)
    /// followed by its service group. Cases without an RDBMS need none.
    pub fn requirements<'a>(
        case: &CaseDescriptor,
        catalog: &'a ServiceCatalog,
    ) -> Result<(Option<&'a ServiceSpec>, Vec<&'a ServiceSpec>), ComposeError> {
        let Some(rdbms) = case.rdbms() else {
            return Ok((None, Vec::new()));
        };

        let group_name = case.service_group().unwrap_or(DEFAULT_SERVICE_GROUP);
        let group = catalog
            .service_group(group_name)
            .ok_or_else(|| ComposeError::UnknownGroup(group_name.to_string()))?;

        Ok((catalog.rdbms(rdbms), group.iter().collect()))
    }

    /// Start every required service concurrently.
    ///
    /// If any of them fails to start, the ones that did start are released
    /// before the error is returned.
    pub async fn compose(
        runner: Arc<dyn CommandRunner>,
        placement: &Placement,
        case: &CaseDescriptor,
        catalog: &ServiceCatalog,
        log: Arc<CaseLog>,
    ) -> Result<Self, ComposeError> {
        let (database, services) = Self::requirements(case, catalog)?;
        let wanted: Vec<&ServiceSpec> = database.into_iter().chain(services).collect();

        let started = join_all(wanted.iter().map(|service| {
            let spec = placement.container_spec(service);
            let runner = runner.clone();
            let log = log.clone();
            async move {
                ContainerHandle::start(runner, &placement.runtime, &spec, log)
                    .await
                    .map(|handle| (service.name.clone(), handle))
                    .map_err(|source| ComposeError::Start {
                        service: service.name.clone(),
                        source,
                        cleanup: Vec::new(),
                    })
            }
        }))
        .await;

        let mut members = Vec::new();
        let mut first_error = None;
        for result in started {
            match result {
                Ok(member) => members.push(member),
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }

        let database_id = database.and_then(|db| {
            members
                .iter()
                .find(|(name, _)| name == &db.name)
                .map(|(_, handle)| handle.id().to_string())
        });

        let group = Self {
            members,
            database: database_id,
        };

        if let Some(mut e) = first_error {
            let released = group.release().await;
            if let ComposeError::Start { cleanup, .. } = &mut e {
                cleanup.extend(released);
            }
            return Err(e);
        }

        info!(
            case_id = %case.case_id(),
            services = group.members.len(),
            "Auxiliary services started"
        );
        Ok(group)
    }

    /// Container id of the database service, if one was started
    pub fn database_id(&self) -> Option<&str> {
        self.database.as_deref()
    }

    /// Remove every member; individual failures do not stop the others
    pub async fn release(self) -> Vec<CleanupDiagnostic> {
        let results = join_all(self.members.into_iter().map(|(_, handle)| handle.release())).await;
        results.into_iter().flatten().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Engine;
    use crate::testing::case;
    use serde_json::json;

    #[test]
    fn test_requirements_without_rdbms() {
        let catalog = ServiceCatalog::default();
        let c = case(json!({"DIST": "d1", "PYTHON": "3.9", "SUITE": "core"}));
        let (db, services) = ServiceGroup::requirements(&c, &catalog).unwrap();
        assert!(db.is_none());
        assert!(services.is_empty());
    }

    #[test]
    fn test_requirements_default_group() {
        let catalog = ServiceCatalog::default();
        let c = case(json!({"DIST": "d1", "PYTHON": "3.9", "SUITE": "core", "RDBMS": "mysql8"}));
        let (db, services) = ServiceGroup::requirements(&c, &catalog).unwrap();
        assert_eq!(db.map(|s| s.name.as_str()), Some("mysql8"));
        let names: Vec<&str> = services.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, ["activemq", "influxdb", "elasticsearch"]);
    }

    #[test]
    fn test_requirements_unknown_rdbms_keeps_group() {
        let catalog = ServiceCatalog::default();
        let c = case(json!({"DIST": "d1", "PYTHON": "3.9", "SUITE": "core", "RDBMS": "sqlite"}));
        let (db, services) = ServiceGroup::requirements(&c, &catalog).unwrap();
        assert!(db.is_none());
        assert_eq!(services.len(), 3);
    }

    #[test]
    fn test_requirements_unknown_group() {
        let catalog = ServiceCatalog::default();
        let c = case(json!({"DIST": "d1", "PYTHON": "3.9", "SUITE": "core", "RDBMS": "mysql8", "SERVICES": "extra"}));
        assert!(matches!(
            ServiceGroup::requirements(&c, &catalog),
            Err(ComposeError::UnknownGroup(name)) if name == "extra"
        ));
    }

    #[test]
    fn test_container_spec_shares_placement() {
        let placement = Placement {
            runtime: RuntimeArgs::new(Engine::Podman),
            run_args: vec!["--pod".to_string(), "pod-1".to_string()],
        };
        let service = ServiceSpec {
            name: "ssh".to_string(),
            image: "ssh:1".to_string(),
            env: [("A".to_string(), "1".to_string())].into(),
            command: vec!["-D".to_string()],
        };

        let spec = placement.container_spec(&service);
        assert_eq!(spec.image, "ssh:1");
        assert_eq!(spec.run_args, placement.run_args);
        assert_eq!(spec.command, ["-D"]);
        assert_eq!(spec.env.get("A").map(String::as_str), Some("1"));
    }
}
