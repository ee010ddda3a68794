/// Container Engine - Handles for Containers and Pods
///
/// **Core Responsibility:**
/// Create, inspect and tear down the containers and pods a case runs in.
///
/// **Engines:**
/// - `docker`: containers only; auxiliary containers join the primary
///   container's network namespace directly
/// - `podman`: rootless, supports pods and isolation namespaces
///
/// **Teardown contract:**
/// `release()` never fails. Anything that goes wrong while stopping or
/// removing is returned as [`CleanupDiagnostic`] values for the caller to log.

use crate::process::{run_checked, CommandRunner, Invocation, PhaseError};
use crate::sink::CaseLog;
use bollard::Docker;
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

/// Seconds a pod gets to stop before it is killed
const POD_STOP_TIMEOUT_SECS: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Engine {
    Docker,
    Podman,
}

impl Engine {
    pub fn binary(&self) -> &'static str {
        match self {
            Engine::Docker => "docker",
            Engine::Podman => "podman",
        }
    }

    pub fn supports_pods(&self) -> bool {
        matches!(self, Engine::Podman)
    }
}

impl fmt::Display for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.binary())
    }
}

/// Engine selection plus the isolation namespace every command of a case uses
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeArgs {
    pub engine: Engine,
    pub namespace: Option<String>,
}

impl RuntimeArgs {
    pub fn new(engine: Engine) -> Self {
        Self {
            engine,
            namespace: None,
        }
    }

    /// Fresh isolation namespace for one case
    pub fn with_fresh_namespace(engine: Engine) -> Self {
        Self {
            engine,
            namespace: Some(uuid::Uuid::new_v4().to_string()),
        }
    }

    /// Arguments placed before the engine subcommand
    pub fn global_args(&self) -> Vec<String> {
        match &self.namespace {
            Some(ns) => vec!["--namespace".to_string(), ns.clone()],
            None => Vec::new(),
        }
    }

    /// Environment handed to host-side scripts
    pub fn namespace_env(&self) -> BTreeMap<String, String> {
        self.namespace
            .iter()
            .map(|ns| ("NAMESPACE".to_string(), ns.clone()))
            .collect()
    }

    /// Engine command with namespace arguments already applied
    pub fn command(&self) -> Invocation {
        Invocation::new(self.engine.binary()).args(self.global_args())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupStage {
    PodStop,
    PodRemove,
    ContainerRemove,
    ContainerLogs,
    LogCopy,
}

/// A non-fatal problem hit while tearing something down
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupDiagnostic {
    pub stage: CleanupStage,
    pub detail: String,
}

impl CleanupDiagnostic {
    pub fn new(stage: CleanupStage, detail: impl Into<String>) -> Self {
        Self {
            stage,
            detail: detail.into(),
        }
    }
}

impl fmt::Display for CleanupDiagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.stage, self.detail)
    }
}

/// How to start one container. All containers of a case share `run_args`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerSpec {
    pub image: String,
    /// Placement arguments such as `--pod <id>` or `--network container:<id>`
    pub run_args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub command: Vec<String>,
}

/// Flatten an environment into repeated `--env K=V` arguments
pub fn env_args(env: &BTreeMap<String, String>) -> Vec<String> {
    env.iter()
        .flat_map(|(k, v)| ["--env".to_string(), format!("{}={}", k, v)])
        .collect()
}

/// A running container. Must be released with [`ContainerHandle::release`].
pub struct ContainerHandle {
    id: String,
    image: String,
    runtime: RuntimeArgs,
    runner: Arc<dyn CommandRunner>,
    log: Arc<CaseLog>,
    released: bool,
}

impl ContainerHandle {
    /// Start a detached container
    pub async fn start(
        runner: Arc<dyn CommandRunner>,
        runtime: &RuntimeArgs,
        spec: &ContainerSpec,
        log: Arc<CaseLog>,
    ) -> Result<Self, PhaseError> {
        let invocation = runtime
            .command()
            .args(["run", "--detach"])
            .args(spec.run_args.iter().cloned())
            .args(env_args(&spec.env))
            .arg(spec.image.clone())
            .args(spec.command.iter().cloned())
            .capture_stdout();

        let completed = run_checked(runner.as_ref(), &invocation, &log).await?;
        let id = completed.stdout.trim().to_string();
        if id.is_empty() {
            return Err(PhaseError::NoIdentity {
                command: invocation.command_line(),
                what: "container",
            });
        }

        debug!(container_id = %id, image = %spec.image, "Container started");

        Ok(Self {
            id,
            image: spec.image.clone(),
            runtime: runtime.clone(),
            runner,
            log,
            released: false,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Run a command inside the container
    pub async fn exec<I, S>(
        &self,
        env: &BTreeMap<String, String>,
        command: I,
    ) -> Result<(), PhaseError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let invocation = self
            .runtime
            .command()
            .arg("exec")
            .args(env_args(env))
            .arg(self.id.clone())
            .args(command);
        run_checked(self.runner.as_ref(), &invocation, &self.log).await?;
        Ok(())
    }

    /// Dump the container's logs into the case log
    pub async fn logs(&self) -> Option<CleanupDiagnostic> {
        let invocation = self.runtime.command().args(["logs", self.id.as_str()]);
        run_checked(self.runner.as_ref(), &invocation, &self.log)
            .await
            .err()
            .map(|e| CleanupDiagnostic::new(CleanupStage::ContainerLogs, e.to_string()))
    }

    /// Copy `source` out of the container to `dest` on the host
    pub async fn copy_out(&self, source: &str, dest: &Path) -> Result<(), PhaseError> {
        let invocation = self.runtime.command().args([
            "cp".to_string(),
            format!("{}:{}", self.id, source),
            dest.display().to_string(),
        ]);
        run_checked(self.runner.as_ref(), &invocation, &self.log).await?;
        Ok(())
    }

    /// Force-remove the container
    pub async fn release(mut self) -> Vec<CleanupDiagnostic> {
        self.released = true;
        let invocation = removal(&self.runtime, &self.id);
        match run_checked(self.runner.as_ref(), &invocation, &self.log).await {
            Ok(_) => Vec::new(),
            Err(e) => vec![CleanupDiagnostic::new(
                CleanupStage::ContainerRemove,
                e.to_string(),
            )],
        }
    }
}

fn removal(runtime: &RuntimeArgs, id: &str) -> Invocation {
    runtime.command().args(["rm", "--force", id])
}

impl Drop for ContainerHandle {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        // Only reached when the owning scope panicked or was cancelled
        warn!(container_id = %self.id, image = %self.image, "Container dropped without release, removing in background");
        let invocation = removal(&self.runtime, &self.id);
        let runner = self.runner.clone();
        let log = self.log.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = runner.run(&invocation, &log).await {
                    warn!(error = %e, "Background container removal failed");
                }
            });
        }
    }
}

/// An empty pod that containers of one case join
pub struct PodHandle {
    id: String,
    runtime: RuntimeArgs,
}

impl PodHandle {
    /// Create the pod. Returns `Ok(None)` when the engine printed no pod id.
    pub async fn create(
        runner: &dyn CommandRunner,
        runtime: &RuntimeArgs,
        log: &CaseLog,
    ) -> Result<Option<Self>, PhaseError> {
        let invocation = runtime.command().args(["pod", "create"]).capture_stdout();
        let completed = run_checked(runner, &invocation, log).await?;
        let id = completed.stdout.trim();
        if id.is_empty() {
            return Ok(None);
        }

        Ok(Some(Self {
            id: id.to_string(),
            runtime: runtime.clone(),
        }))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Placement arguments for containers joining this pod
    pub fn run_args(&self) -> Vec<String> {
        vec!["--pod".to_string(), self.id.clone()]
    }

    /// Stop then force-remove the pod; both steps always run
    pub async fn release(self, runner: &dyn CommandRunner, log: &CaseLog) -> Vec<CleanupDiagnostic> {
        let mut diagnostics = Vec::new();
        let timeout = POD_STOP_TIMEOUT_SECS.to_string();

        let stop = self
            .runtime
            .command()
            .args(["pod", "stop", "-t", timeout.as_str(), self.id.as_str()]);
        if let Err(e) = run_checked(runner, &stop, log).await {
            diagnostics.push(CleanupDiagnostic::new(CleanupStage::PodStop, e.to_string()));
        }

        let remove = self
            .runtime
            .command()
            .args(["pod", "rm", "--force", self.id.as_str()]);
        if let Err(e) = run_checked(runner, &remove, log).await {
            diagnostics.push(CleanupDiagnostic::new(CleanupStage::PodRemove, e.to_string()));
        }

        diagnostics
    }
}

/// Check whether an image is present locally. Diagnostic only.
pub async fn probe_image(docker: &Docker, image: &str) -> bool {
    match docker.inspect_image(image).await {
        Ok(_) => {
            debug!("✓ Image cache hit: {}", image);
            true
        }
        Err(e) => {
            warn!(image = %image, error = %e, "⚠ Image not available locally, the engine will pull it");
            false
        }
    }
}
