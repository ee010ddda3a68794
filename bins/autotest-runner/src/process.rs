/// Subprocess seam
///
/// Everything a case does to the outside world (engine commands, staged
/// scripts) goes through [`CommandRunner`]. Production uses [`SystemRunner`];
/// tests substitute a recording fake to inject failures.

use crate::sink::CaseLog;
use futures_util::future::BoxFuture;
use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::process::Stdio;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

/// A single command to run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    /// Added on top of the inherited process environment
    pub env: BTreeMap<String, String>,
    /// Capture stdout instead of sending it to the case log
    pub capture: bool,
}

impl Invocation {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            capture: false,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn envs<'a, I>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (&'a String, &'a String)>,
    {
        self.env
            .extend(vars.into_iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn capture_stdout(mut self) -> Self {
        self.capture = true;
        self
    }

    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.command_line())
    }
}

/// Result of a finished subprocess
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Completed {
    /// `None` when the process was killed by a signal
    pub code: Option<i32>,
    /// Captured stdout, empty unless the invocation asked for it
    pub stdout: String,
}

/// A staged subprocess that did not succeed
#[derive(Debug, Error)]
pub enum PhaseError {
    #[error("Process '{command}' exited with code {code}")]
    Exited { command: String, code: i32 },

    #[error("Process '{command}' was terminated by a signal")]
    Signalled { command: String },

    #[error("Process '{command}' printed no {what} id")]
    NoIdentity { command: String, what: &'static str },

    #[error("Process '{command}' could not be started: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },
}

pub trait CommandRunner: Send + Sync {
    /// Run `invocation` to completion; stdout/stderr go to `log` unless captured
    fn run<'a>(
        &'a self,
        invocation: &'a Invocation,
        log: &'a CaseLog,
    ) -> BoxFuture<'a, io::Result<Completed>>;
}

/// Run and require a zero exit status
pub async fn run_checked(
    runner: &dyn CommandRunner,
    invocation: &Invocation,
    log: &CaseLog,
) -> Result<Completed, PhaseError> {
    let command = invocation.command_line();
    let completed = runner
        .run(invocation, log)
        .await
        .map_err(|source| PhaseError::Spawn {
            command: command.clone(),
            source,
        })?;

    match completed.code {
        Some(0) => Ok(completed),
        Some(code) => Err(PhaseError::Exited { command, code }),
        None => Err(PhaseError::Signalled { command }),
    }
}

/// Runs commands on the host with tokio
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run<'a>(
        &'a self,
        invocation: &'a Invocation,
        log: &'a CaseLog,
    ) -> BoxFuture<'a, io::Result<Completed>> {
        Box::pin(async move {
            log.line(format_args!("+ {}", invocation));
            debug!(case_id = %log.case_id(), command = %invocation, "Running");

            let mut cmd = Command::new(&invocation.program);
            cmd.args(&invocation.args)
                .envs(&invocation.env)
                .stdin(Stdio::null())
                .stderr(log.stdio()?);

            // `output()` would re-pipe stderr, so wait on the child directly
            if invocation.capture {
                let output = cmd.stdout(Stdio::piped()).spawn()?.wait_with_output().await?;
                return Ok(Completed {
                    code: output.status.code(),
                    stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                });
            }

            let status = cmd.stdout(log.stdio()?).spawn()?.wait().await?;
            Ok(Completed {
                code: status.code(),
                stdout: String::new(),
            })
        })
    }
}
