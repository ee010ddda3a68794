// Run settings read from the environment
use crate::error::ConfigError;
use std::path::PathBuf;
use std::time::Duration;

pub const USE_PODMAN: &str = "USE_PODMAN";
pub const PARALLEL: &str = "PARALLEL_AUTOTESTS";
pub const FAILFAST: &str = "PARALLEL_AUTOTESTS_FAILFAST";
pub const PROCNUM: &str = "PARALLEL_AUTOTESTS_PROCNUM";
pub const TIMEOUT: &str = "PARALLEL_AUTOTESTS_TIMEOUT";
pub const COPY_LOGS: &str = "COPY_AUTOTEST_LOGS";

pub const DEFAULT_PROCNUM: usize = 3;
/// Overall deadline for a parallel run: 6 hours
pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(6 * 60 * 60);
pub const DEFAULT_LOGS_DIR: &str = ".autotest";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSettings {
    /// Rootless engine with pods
    pub use_podman: bool,
    pub parallel: bool,
    pub failfast: bool,
    pub procnum: usize,
    pub deadline: Duration,
    pub copy_logs: bool,
    pub logs_dir: PathBuf,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            use_podman: false,
            parallel: false,
            failfast: false,
            procnum: DEFAULT_PROCNUM,
            deadline: DEFAULT_DEADLINE,
            copy_logs: false,
            logs_dir: PathBuf::from(DEFAULT_LOGS_DIR),
        }
    }
}

impl RunSettings {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from an arbitrary variable source.
    ///
    /// Switches are on only when the variable is exactly `"1"`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let enabled = |key: &str| lookup(key).as_deref() == Some("1");

        let procnum = match lookup(PROCNUM) {
            Some(raw) => match raw.trim().parse::<usize>() {
                Ok(n) if n > 0 => n,
                _ => {
                    return Err(ConfigError::InvalidSetting {
                        variable: PROCNUM,
                        value: raw,
                    })
                }
            },
            None => DEFAULT_PROCNUM,
        };

        let deadline = match lookup(TIMEOUT) {
            Some(raw) => raw
                .trim()
                .parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|_| ConfigError::InvalidSetting {
                    variable: TIMEOUT,
                    value: raw,
                })?,
            None => DEFAULT_DEADLINE,
        };

        Ok(Self {
            use_podman: enabled(USE_PODMAN),
            parallel: enabled(PARALLEL),
            failfast: enabled(FAILFAST),
            procnum,
            deadline,
            copy_logs: enabled(COPY_LOGS),
            logs_dir: PathBuf::from(DEFAULT_LOGS_DIR),
        })
    }

    /// Namespaces are only needed when pods of several cases share one host
    pub fn use_namespace(&self) -> bool {
        self.use_podman && self.parallel
    }

    /// Worker count for `cases` cases, never more than there are cases
    pub fn parallelism(&self, cases: usize) -> usize {
        self.procnum.min(cases).max(1)
    }

    /// Whether the log directory must exist before cases start
    pub fn needs_logs_dir(&self) -> bool {
        self.parallel || self.copy_logs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn settings(vars: &[(&str, &str)]) -> Result<RunSettings, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        RunSettings::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let s = settings(&[]).unwrap();
        assert_eq!(s, RunSettings::default());
        assert!(!s.use_namespace());
        assert!(!s.needs_logs_dir());
    }

    #[test]
    fn test_switches_require_exact_one() {
        let s = settings(&[(USE_PODMAN, "1"), (PARALLEL, "true"), (COPY_LOGS, "yes")]).unwrap();
        assert!(s.use_podman);
        assert!(!s.parallel);
        assert!(!s.copy_logs);
    }

    #[test]
    fn test_namespace_needs_podman_and_parallel() {
        let s = settings(&[(USE_PODMAN, "1"), (PARALLEL, "1"), (FAILFAST, "1")]).unwrap();
        assert!(s.use_namespace());
        assert!(s.failfast);
        assert!(s.needs_logs_dir());
    }

    #[test]
    fn test_parallelism_capped_by_cases() {
        let s = settings(&[(PROCNUM, "8")]).unwrap();
        assert_eq!(s.parallelism(2), 2);
        assert_eq!(s.parallelism(20), 8);
        assert_eq!(s.parallelism(0), 1);
    }

    #[test]
    fn test_invalid_procnum() {
        assert!(matches!(
            settings(&[(PROCNUM, "many")]),
            Err(ConfigError::InvalidSetting { variable: PROCNUM, .. })
        ));
        assert!(settings(&[(PROCNUM, "0")]).is_err());
    }

    #[test]
    fn test_timeout_override() {
        let s = settings(&[(TIMEOUT, "90")]).unwrap();
        assert_eq!(s.deadline, Duration::from_secs(90));
    }
}
