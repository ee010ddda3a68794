/// Case Runner - Drives One Case Through Its Lifecycle
///
/// **Lifecycle:**
/// 1. Pick the engine and, in parallel rootless mode, a fresh namespace
/// 2. Create an empty pod (rootless mode only)
/// 3. Run either the service-backed path or the direct path
/// 4. Tear the pod down, whatever happened in 3
///
/// **Outcome channel:**
/// Staged-phase failures never escape as errors; they become
/// `CaseOutcome { success: false, .. }`. Only configuration problems are
/// returned as [`RunError`] and abort the whole run.

use crate::compose::{ComposeError, Placement, ServiceGroup};
use crate::config::ServiceCatalog;
use crate::engine::{
    env_args, probe_image, CleanupDiagnostic, CleanupStage, ContainerHandle, ContainerSpec,
    Engine, PodHandle, RuntimeArgs,
};
use crate::process::{run_checked, CommandRunner, Invocation, PhaseError};
use crate::sink::CaseLog;
use autotest_common::{CaseDescriptor, ConfigError, RunSettings};
use bollard::Docker;
use futures_util::future::BoxFuture;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Primary container id handed to the pre-setup script
pub const PRIMARY_CONTAINER_ENV: &str = "CON_RUCIO";
/// Database container id handed to the pre-setup script
pub const DATABASE_CONTAINER_ENV: &str = "CON_DB";
pub const RUNTIME_ARGS_ENV: &str = "CONTAINER_RUNTIME_ARGS";
/// Space separated sub-test names for the test phase
pub const TESTS_ENV: &str = "TESTS";
/// Tells the test phase to run only `TESTS`
pub const PARTIAL_FLAG: &str = "-p";
const CONTAINER_LOG_DIR: &str = "/var/log";

#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("could not determine pod id")]
    PodIdentity,

    #[error("unknown service group '{0}'")]
    UnknownServiceGroup(String),
}

/// Everything one case run needs. Never shared between cases.
#[derive(Debug, Clone)]
pub struct CaseRun {
    pub case: CaseDescriptor,
    pub image: String,
    pub use_podman: bool,
    pub use_namespace: bool,
    pub copy_logs: bool,
    /// Destination for logs copied out of the primary container
    pub logs_dir: PathBuf,
    pub tests: Vec<String>,
}

impl CaseRun {
    pub fn new(case: CaseDescriptor, image: impl Into<String>, settings: &RunSettings, tests: &[String]) -> Self {
        let logs_dir = settings.logs_dir.join(format!("log-{}", case.case_id()));
        Self {
            use_podman: settings.use_podman,
            use_namespace: settings.use_namespace(),
            copy_logs: settings.copy_logs && case.use_http_service(),
            logs_dir,
            tests: tests.to_vec(),
            image: image.into(),
            case,
        }
    }

    pub fn case_id(&self) -> String {
        self.case.case_id()
    }

    /// Case environment plus the image, for banners
    fn describe(&self) -> String {
        let fields: Vec<String> = self
            .case
            .env()
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .chain(std::iter::once(format!("IMAGE={}", self.image)))
            .collect();
        format!("{{{}}}", fields.join(", "))
    }

    /// Extra environment and arguments for the test phase when a subset was requested
    fn subset(&self) -> (BTreeMap<String, String>, Vec<String>) {
        if self.tests.is_empty() {
            return (BTreeMap::new(), Vec::new());
        }
        (
            BTreeMap::from([(TESTS_ENV.to_string(), self.tests.join(" "))]),
            vec![PARTIAL_FLAG.to_string()],
        )
    }
}

#[derive(Debug, Clone)]
pub struct CaseOutcome {
    pub case_id: String,
    pub success: bool,
    /// Per-case log file, when the case had one
    pub log_path: Option<PathBuf>,
    /// Directory the container logs were copied to
    pub copied_logs: Option<PathBuf>,
    /// Non-fatal teardown problems
    pub cleanup: Vec<CleanupDiagnostic>,
}

/// Result of one execution path, before pod teardown
struct PathResult {
    success: Result<bool, RunError>,
    copied_logs: Option<PathBuf>,
    cleanup: Vec<CleanupDiagnostic>,
}

impl PathResult {
    fn new(success: Result<bool, RunError>, cleanup: Vec<CleanupDiagnostic>) -> Self {
        Self {
            success,
            copied_logs: None,
            cleanup,
        }
    }
}

/// Runs a single case. The scheduler only sees this trait.
pub trait CaseExecutor: Send + Sync {
    fn execute<'a>(
        &'a self,
        run: &'a CaseRun,
        log: Arc<CaseLog>,
    ) -> BoxFuture<'a, Result<CaseOutcome, RunError>>;
}

pub struct CaseRunner {
    runner: Arc<dyn CommandRunner>,
    catalog: Arc<ServiceCatalog>,
    docker: Option<Docker>,
}

impl CaseRunner {
    pub fn new(runner: Arc<dyn CommandRunner>, catalog: Arc<ServiceCatalog>) -> Self {
        Self {
            runner,
            catalog,
            docker: None,
        }
    }

    /// Probe images through the engine API before each case
    pub fn with_image_probe(mut self, docker: Docker) -> Self {
        self.docker = Some(docker);
        self
    }

    pub async fn run(&self, run: &CaseRun, log: Arc<CaseLog>) -> Result<CaseOutcome, RunError> {
        let case_id = run.case_id();
        let engine = if run.use_podman { Engine::Podman } else { Engine::Docker };
        let runtime = if run.use_namespace {
            RuntimeArgs::with_fresh_namespace(engine)
        } else {
            RuntimeArgs::new(engine)
        };

        info!(
            case_id = %case_id,
            distribution = run.case.distribution(),
            suite = run.case.suite(),
            rdbms = run.case.rdbms().unwrap_or("none"),
            image = %run.image,
            "Case starting"
        );

        if let Some(docker) = &self.docker {
            probe_image(docker, &run.image).await;
        }

        let described = run.describe();
        let pod = if engine.supports_pods() {
            log.line(format_args!("*** Starting with pod for {}", described));
            match PodHandle::create(self.runner.as_ref(), &runtime, &log).await {
                Ok(Some(pod)) => {
                    debug!(case_id = %case_id, pod_id = %pod.id(), "Pod created");
                    Some(pod)
                }
                Ok(None) => return Err(RunError::PodIdentity),
                Err(e) => {
                    self.report_failure(run, &log, &e);
                    return Ok(CaseOutcome {
                        case_id,
                        success: false,
                        log_path: log.path().map(Path::to_path_buf),
                        copied_logs: None,
                        cleanup: Vec::new(),
                    });
                }
            }
        } else {
            log.line(format_args!("*** Starting {}", described));
            None
        };

        let pod_args = pod.as_ref().map(PodHandle::run_args).unwrap_or_default();

        let path = if run.case.use_http_service() {
            log.line("* Using auxiliary services for test");
            self.service_backed(run, &runtime, &pod_args, log.clone()).await
        } else {
            log.line("* Running test directly without auxiliary services");
            self.direct(run, &runtime, &pod_args, &log).await
        };

        log.line(format_args!("*** Finalizing {}", described));
        let mut cleanup = path.cleanup;
        if let Some(pod) = pod {
            cleanup.extend(pod.release(self.runner.as_ref(), &log).await);
        }

        for diagnostic in &cleanup {
            log.line(format_args!("** Cleanup problem for {}: {}", described, diagnostic));
            warn!(case_id = %case_id, stage = ?diagnostic.stage, detail = %diagnostic.detail, "Cleanup failed");
        }

        let success = path.success?;
        info!(case_id = %case_id, success, "Case finished");

        Ok(CaseOutcome {
            case_id,
            success,
            log_path: log.path().map(Path::to_path_buf),
            copied_logs: path.copied_logs,
            cleanup,
        })
    }

    /// Long-lived primary container plus auxiliary services, staged phases, log capture
    async fn service_backed(
        &self,
        run: &CaseRun,
        runtime: &RuntimeArgs,
        pod_args: &[String],
        log: Arc<CaseLog>,
    ) -> PathResult {
        let spec = ContainerSpec {
            image: run.image.clone(),
            run_args: pod_args.to_vec(),
            env: run.case.env().clone(),
            command: Vec::new(),
        };

        let primary = match ContainerHandle::start(self.runner.clone(), runtime, &spec, log.clone()).await {
            Ok(primary) => primary,
            Err(e) => {
                self.report_failure(run, &log, &e);
                return PathResult::new(Ok(false), Vec::new());
            }
        };

        let placement = Placement::for_case(runtime, pod_args, &primary);
        let mut result = self.with_services(run, runtime, &primary, &placement, log.clone()).await;

        // Logs are always captured, whatever the phases did
        result.cleanup.extend(primary.logs().await);
        if run.copy_logs {
            match self.copy_logs(run, &primary).await {
                Ok(()) => result.copied_logs = Some(run.logs_dir.clone()),
                Err(diagnostic) => result.cleanup.push(diagnostic),
            }
        }
        result.cleanup.extend(primary.release().await);
        result
    }

    async fn with_services(
        &self,
        run: &CaseRun,
        runtime: &RuntimeArgs,
        primary: &ContainerHandle,
        placement: &Placement,
        log: Arc<CaseLog>,
    ) -> PathResult {
        let group = match ServiceGroup::compose(
            self.runner.clone(),
            placement,
            &run.case,
            &self.catalog,
            log.clone(),
        )
        .await
        {
            Ok(group) => group,
            Err(ComposeError::UnknownGroup(name)) => {
                return PathResult::new(Err(RunError::UnknownServiceGroup(name)), Vec::new())
            }
            Err(ComposeError::Start { service, source, cleanup }) => {
                log.line(format_args!("** Service {} did not start", service));
                self.report_failure(run, &log, &source);
                return PathResult::new(Ok(false), cleanup);
            }
        };

        let phases = self.staged_phases(run, runtime, primary, &group, &log).await;
        let cleanup = group.release().await;

        match phases {
            Ok(()) => PathResult::new(Ok(true), cleanup),
            Err(e) => {
                self.report_failure(run, &log, &e);
                PathResult::new(Ok(false), cleanup)
            }
        }
    }

    /// Pre-setup, hostname registration, install, test; stops at the first failure
    async fn staged_phases(
        &self,
        run: &CaseRun,
        runtime: &RuntimeArgs,
        primary: &ContainerHandle,
        group: &ServiceGroup,
        log: &CaseLog,
    ) -> Result<(), PhaseError> {
        let scripts = self.catalog.scripts();

        let mut before = Invocation::new(scripts.before.clone())
            .envs(run.case.env())
            .envs(&runtime.namespace_env())
            .env(RUNTIME_ARGS_ENV, runtime.global_args().join(" "))
            .env(PRIMARY_CONTAINER_ENV, primary.id());
        if let Some(db) = group.database_id() {
            before = before.env(DATABASE_CONTAINER_ENV, db);
        }
        run_checked(self.runner.as_ref(), &before, log).await?;

        let hostnames = self.catalog.hostnames();
        if !hostnames.is_empty() {
            let register = format!(
                "echo \"127.0.0.1 {}\" | tee -a /etc/hosts",
                hostnames.join(" ")
            );
            primary
                .exec(&BTreeMap::new(), ["/bin/sh", "-c", register.as_str()])
                .await?;
        }

        primary
            .exec(&BTreeMap::new(), [scripts.install.as_str()])
            .await?;

        let (tests_env, tests_args) = run.subset();
        primary
            .exec(&tests_env, std::iter::once(scripts.test.clone()).chain(tests_args))
            .await?;

        Ok(())
    }

    /// One-shot container running install then test
    async fn direct(
        &self,
        run: &CaseRun,
        runtime: &RuntimeArgs,
        pod_args: &[String],
        log: &CaseLog,
    ) -> PathResult {
        let scripts = self.catalog.scripts();
        let (tests_env, tests_args) = run.subset();

        let test_command = std::iter::once(scripts.test.clone())
            .chain(tests_args)
            .collect::<Vec<_>>()
            .join(" ");
        let combined = format!("{} && {}", scripts.install, test_command);

        let mut env = run.case.env().clone();
        env.extend(tests_env);

        let invocation = runtime
            .command()
            .args(["run", "--rm"])
            .args(pod_args.iter().cloned())
            .args(env_args(&env))
            .arg(run.image.clone())
            .args(["sh", "-c", combined.as_str()]);

        match run_checked(self.runner.as_ref(), &invocation, log).await {
            Ok(_) => PathResult::new(Ok(true), Vec::new()),
            Err(e) => {
                self.report_failure(run, log, &e);
                PathResult::new(Ok(false), Vec::new())
            }
        }
    }

    /// Replace the case's log directory with `/var/log` from the primary container
    async fn copy_logs(&self, run: &CaseRun, primary: &ContainerHandle) -> Result<(), CleanupDiagnostic> {
        let diagnostic = |detail: String| CleanupDiagnostic::new(CleanupStage::LogCopy, detail);

        if tokio::fs::try_exists(&run.logs_dir).await.unwrap_or(false) {
            tokio::fs::remove_dir_all(&run.logs_dir).await.map_err(|e| {
                diagnostic(format!("Failed to remove {}: {}", run.logs_dir.display(), e))
            })?;
        }

        primary
            .copy_out(CONTAINER_LOG_DIR, &run.logs_dir)
            .await
            .map_err(|e| diagnostic(format!("Error on retrieving logs: {}", e)))
    }

    fn report_failure(&self, run: &CaseRun, log: &CaseLog, error: &PhaseError) {
        log.line(format_args!("** {} {}", error, run.describe()));
        warn!(case_id = %run.case_id(), error = %error, "Case phase failed");
    }
}

impl CaseExecutor for CaseRunner {
    fn execute<'a>(
        &'a self,
        run: &'a CaseRun,
        log: Arc<CaseLog>,
    ) -> BoxFuture<'a, Result<CaseOutcome, RunError>> {
        Box::pin(self.run(run, log))
    }
}
