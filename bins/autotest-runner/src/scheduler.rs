/// Case Scheduler - Serial or Bounded-Parallel Fan-Out
///
/// **Serial mode:**
/// Cases run strictly in order on the calling task with output on stderr.
/// The first failing case stops the run.
///
/// **Parallel mode:**
/// Up to `procnum` cases run at once. Each gets its own log file and span.
/// Results are collected in submission order, each wait bounded by what is
/// left of the global deadline. Fail-fast stops dispatching new cases; cases
/// already running are left alone.

use crate::runner::{CaseExecutor, CaseOutcome, CaseRun};
use crate::sink::CaseLog;
use anyhow::{Context, Result};
use autotest_common::{CaseDescriptor, ImageTable, RunSettings};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{error, info, info_span, warn, Instrument};

/// Stand-in for deadlines too far out to represent as an `Instant`
const UNBOUNDED_DEADLINE: Duration = Duration::from_secs(86400 * 365 * 30);

/// Overall result of a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Passed,
    /// Every case ran; these failed
    Failed { failed: Vec<String> },
    /// Dispatch stopped after this case failed
    FailFast { case_id: String },
    /// The global deadline passed while these cases were still running
    DeadlineExceeded { outstanding: Vec<String> },
}

impl Verdict {
    pub fn exit_code(&self) -> i32 {
        match self {
            Verdict::Passed => 0,
            _ => 1,
        }
    }

    /// Whether the process must exit without waiting for running cases
    pub fn abandons_running_cases(&self) -> bool {
        matches!(self, Verdict::FailFast { .. } | Verdict::DeadlineExceeded { .. })
    }
}

/// What a parallel task reports back
#[derive(Debug, Clone, PartialEq, Eq)]
enum TaskResult {
    Finished(bool),
    /// Never started because dispatch was halted
    Skipped,
}

pub struct Scheduler<E: CaseExecutor + 'static> {
    executor: Arc<E>,
    settings: RunSettings,
    tests: Vec<String>,
}

impl<E: CaseExecutor + 'static> Scheduler<E> {
    pub fn new(executor: Arc<E>, settings: RunSettings, tests: Vec<String>) -> Self {
        Self {
            executor,
            settings,
            tests,
        }
    }

    /// Per-case output file used in parallel mode
    pub fn case_log_path(&self, case_id: &str) -> PathBuf {
        self.settings.logs_dir.join(format!("log-{}.txt", case_id))
    }

    /// Run every case once and aggregate a verdict.
    ///
    /// Configuration errors (unresolvable images, pods without ids, unknown
    /// service groups in serial mode) are returned as `Err`.
    pub async fn run(&self, cases: Vec<CaseDescriptor>, images: &ImageTable) -> Result<Verdict> {
        if self.settings.needs_logs_dir() {
            std::fs::create_dir_all(&self.settings.logs_dir).with_context(|| {
                format!("Failed to create {}", self.settings.logs_dir.display())
            })?;
        }

        info!(
            cases = cases.len(),
            parallel = self.settings.parallel,
            podman = self.settings.use_podman,
            failfast = self.settings.failfast,
            "Starting test matrix"
        );

        if self.settings.parallel {
            self.run_parallel(cases, images).await
        } else {
            self.run_serial(cases, images).await
        }
    }

    async fn run_serial(&self, cases: Vec<CaseDescriptor>, images: &ImageTable) -> Result<Verdict> {
        for case in cases {
            let image = images.find_image(&case)?.to_string();
            let run = CaseRun::new(case, image, &self.settings, &self.tests);
            let case_id = run.case_id();
            let log = Arc::new(CaseLog::stderr(case_id.clone()));

            let outcome = self
                .executor
                .execute(&run, log)
                .instrument(info_span!("case", case_id = %case_id))
                .await
                .with_context(|| format!("Case {} could not run", case_id))?;

            if !outcome.success {
                error!(case_id = %case_id, "Case failed, stopping serial run");
                return Ok(Verdict::Failed {
                    failed: vec![case_id],
                });
            }
        }

        Ok(Verdict::Passed)
    }

    async fn run_parallel(&self, cases: Vec<CaseDescriptor>, images: &ImageTable) -> Result<Verdict> {
        // Resolve every image before anything starts
        let runs = cases
            .into_iter()
            .map(|case| -> Result<CaseRun> {
                let image = images.find_image(&case)?.to_string();
                Ok(CaseRun::new(case, image, &self.settings, &self.tests))
            })
            .collect::<Result<Vec<_>>>()?;

        let workers = self.settings.parallelism(runs.len());
        let permits = Arc::new(Semaphore::new(workers));
        let halted = Arc::new(AtomicBool::new(false));
        let started = Instant::now();
        let deadline = started
            .checked_add(self.settings.deadline)
            .unwrap_or_else(|| started + UNBOUNDED_DEADLINE);

        info!(workers, deadline_secs = self.settings.deadline.as_secs(), "Dispatching cases");

        let mut tasks: Vec<(String, JoinHandle<TaskResult>)> = runs
            .into_iter()
            .map(|run| {
                let case_id = run.case_id();
                let path = self.case_log_path(&case_id);
                let handle = tokio::spawn(
                    run_task(self.executor.clone(), run, path, permits.clone(), halted.clone())
                        .instrument(info_span!("case", case_id = %case_id)),
                );
                (case_id, handle)
            })
            .collect();

        let mut failed = Vec::new();
        for index in 0..tasks.len() {
            let now = Instant::now();
            if now >= deadline {
                return Ok(self.deadline_exceeded(&tasks, &halted));
            }

            let case_id = tasks[index].0.clone();
            let waited = tokio::time::timeout(deadline - now, &mut tasks[index].1).await;
            let result = match waited {
                Ok(Ok(result)) => result,
                Ok(Err(join_error)) => {
                    error!(case_id = %case_id, error = %join_error, "Case task crashed");
                    TaskResult::Finished(false)
                }
                Err(_) => return Ok(self.deadline_exceeded(&tasks, &halted)),
            };

            if result == TaskResult::Finished(false) {
                if self.settings.failfast {
                    halted.store(true, Ordering::SeqCst);
                    error!(case_id = %case_id, "Case failed, halting dispatch");
                    return Ok(Verdict::FailFast { case_id });
                }
                failed.push(case_id);
            }
        }

        info!(
            elapsed_secs = started.elapsed().as_secs(),
            failed = failed.len(),
            "All cases collected"
        );

        if failed.is_empty() {
            Ok(Verdict::Passed)
        } else {
            Ok(Verdict::Failed { failed })
        }
    }

    fn deadline_exceeded(&self, tasks: &[(String, JoinHandle<TaskResult>)], halted: &AtomicBool) -> Verdict {
        halted.store(true, Ordering::SeqCst);
        let outstanding: Vec<String> = tasks
            .iter()
            .filter(|(_, handle)| !handle.is_finished())
            .map(|(case_id, _)| case_id.clone())
            .collect();
        error!(?outstanding, "Timeout exceeded, still running");
        Verdict::DeadlineExceeded { outstanding }
    }
}

/// One parallel case: wait for a worker slot, then run with its own log file
async fn run_task<E: CaseExecutor>(
    executor: Arc<E>,
    run: CaseRun,
    log_path: PathBuf,
    permits: Arc<Semaphore>,
    halted: Arc<AtomicBool>,
) -> TaskResult {
    let Ok(_permit) = permits.acquire_owned().await else {
        return TaskResult::Skipped;
    };
    if halted.load(Ordering::SeqCst) {
        return TaskResult::Skipped;
    }

    let case_id = run.case_id();
    info!(log = %log_path.display(), "Started task");

    let log = match CaseLog::open(case_id.clone(), &log_path) {
        Ok(log) => Arc::new(log),
        Err(e) => {
            error!(error = %e, "Failed to open case log");
            return TaskResult::Finished(false);
        }
    };
    log.banner();

    let started = Instant::now();
    let success = match executor.execute(&run, log.clone()).await {
        Ok(outcome) => report(&outcome),
        Err(e) => {
            log.line(format_args!("** Case {} errored: {}", case_id, e));
            error!(error = %e, "Case errored");
            false
        }
    };

    log.line(format_args!(
        "Finished test case {} ({}) after {}s",
        case_id,
        if success { "success" } else { "failure" },
        started.elapsed().as_secs()
    ));
    TaskResult::Finished(success)
}

fn report(outcome: &CaseOutcome) -> bool {
    if outcome.success {
        info!(log = ?outcome.log_path, "Completed successfully");
    } else {
        warn!(cleanup_problems = outcome.cleanup.len(), "Case failed");
    }
    outcome.success
}
