// Test doubles for the process seam and the scheduler seam

use crate::process::{CommandRunner, Completed, Invocation};
use crate::runner::{CaseExecutor, CaseOutcome, CaseRun, RunError};
use crate::sink::CaseLog;
use autotest_common::CaseDescriptor;
use futures_util::future::BoxFuture;
use serde_json::Value;
use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub fn case(value: Value) -> CaseDescriptor {
    let Value::Object(map) = value else {
        panic!("test case must be an object");
    };
    CaseDescriptor::from_attributes(&map).unwrap()
}

/// Records every invocation. Commands containing a registered needle exit
/// with the registered code; capturing commands get fake pod/container ids.
#[derive(Default)]
pub struct FakeRunner {
    calls: Mutex<Vec<Invocation>>,
    failures: Vec<(String, i32)>,
    empty_pod_id: bool,
    next_id: AtomicUsize,
}

impl FakeRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_on(mut self, needle: &str, code: i32) -> Self {
        self.failures.push((needle.to_string(), code));
        self
    }

    pub fn without_pod_id(mut self) -> Self {
        self.empty_pod_id = true;
        self
    }

    pub fn calls(&self) -> Vec<Invocation> {
        self.calls.lock().unwrap().clone()
    }

    pub fn command_lines(&self) -> Vec<String> {
        self.calls().iter().map(Invocation::command_line).collect()
    }

    /// Index of the first command line containing `needle`
    pub fn position(&self, needle: &str) -> Option<usize> {
        self.command_lines().iter().position(|line| line.contains(needle))
    }

    pub fn count(&self, needle: &str) -> usize {
        self.command_lines()
            .iter()
            .filter(|line| line.contains(needle))
            .count()
    }
}

impl CommandRunner for FakeRunner {
    fn run<'a>(
        &'a self,
        invocation: &'a Invocation,
        _log: &'a CaseLog,
    ) -> BoxFuture<'a, io::Result<Completed>> {
        Box::pin(async move {
            self.calls.lock().unwrap().push(invocation.clone());
            let line = invocation.command_line();

            if let Some((_, code)) = self.failures.iter().find(|(needle, _)| line.contains(needle.as_str())) {
                return Ok(Completed {
                    code: Some(*code),
                    stdout: String::new(),
                });
            }

            let stdout = if !invocation.capture {
                String::new()
            } else if line.contains("pod create") {
                if self.empty_pod_id {
                    "\n".to_string()
                } else {
                    "pod-1\n".to_string()
                }
            } else {
                format!("cid-{}\n", self.next_id.fetch_add(1, Ordering::SeqCst))
            };

            Ok(Completed {
                code: Some(0),
                stdout,
            })
        })
    }
}

/// Scripted case results for scheduler tests
#[derive(Default)]
pub struct FakeExecutor {
    /// case id -> (success, duration)
    script: HashMap<String, (bool, Duration)>,
    fatal: Option<String>,
    executed: Mutex<Vec<String>>,
}

impl FakeExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, case_id: &str, success: bool, duration: Duration) -> Self {
        self.script.insert(case_id.to_string(), (success, duration));
        self
    }

    pub fn fatal_for(mut self, case_id: &str) -> Self {
        self.fatal = Some(case_id.to_string());
        self
    }

    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().unwrap().clone()
    }
}

impl CaseExecutor for FakeExecutor {
    fn execute<'a>(
        &'a self,
        run: &'a CaseRun,
        log: Arc<CaseLog>,
    ) -> BoxFuture<'a, Result<CaseOutcome, RunError>> {
        Box::pin(async move {
            let case_id = run.case_id();
            self.executed.lock().unwrap().push(case_id.clone());
            log.line(format_args!("running {}", case_id));

            let (success, duration) = self
                .script
                .get(&case_id)
                .copied()
                .unwrap_or((true, Duration::ZERO));
            tokio::time::sleep(duration).await;

            if self.fatal.as_deref() == Some(case_id.as_str()) {
                return Err(RunError::PodIdentity);
            }

            Ok(CaseOutcome {
                case_id,
                success,
                log_path: log.path().map(Path::to_path_buf),
                copied_logs: None,
                cleanup: Vec::new(),
            })
        })
    }
}

/// Shared handle so tests can inspect a runner after handing it out
pub fn shared(runner: FakeRunner) -> (Arc<FakeRunner>, Arc<dyn CommandRunner>) {
    let runner = Arc::new(runner);
    let dynamic: Arc<dyn CommandRunner> = runner.clone();
    (runner, dynamic)
}
