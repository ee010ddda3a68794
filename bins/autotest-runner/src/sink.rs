// Per-case output sink
//
// Each case owns one sink for its whole lifetime. Parallel cases get their own
// file, so concurrent output never interleaves; child processes write straight
// into the same descriptor.

use chrono::Local;
use std::fmt::Display;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Mutex;

const BANNER_RULE: &str = "================================================================================";

enum Target {
    Stderr,
    File { path: PathBuf, file: Mutex<File> },
}

pub struct CaseLog {
    case_id: String,
    target: Target,
}

impl CaseLog {
    /// Sink writing to the process's stderr (serial mode)
    pub fn stderr(case_id: impl Into<String>) -> Self {
        Self {
            case_id: case_id.into(),
            target: Target::Stderr,
        }
    }

    /// Sink appending to `path` (parallel mode)
    pub fn open(case_id: impl Into<String>, path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            case_id: case_id.into(),
            target: Target::File {
                path: path.to_path_buf(),
                file: Mutex::new(file),
            },
        })
    }

    pub fn case_id(&self) -> &str {
        &self.case_id
    }

    /// File backing this sink, if any
    pub fn path(&self) -> Option<&Path> {
        match &self.target {
            Target::Stderr => None,
            Target::File { path, .. } => Some(path),
        }
    }

    /// Write one line. Write errors are reported through tracing only.
    pub fn line(&self, message: impl Display) {
        let result = match &self.target {
            Target::Stderr => writeln!(io::stderr().lock(), "{}", message),
            Target::File { file, .. } => match file.lock() {
                Ok(mut file) => writeln!(file, "{}", message).and_then(|_| file.flush()),
                Err(_) => Err(io::Error::other("case log lock poisoned")),
            },
        };

        if let Err(e) = result {
            tracing::warn!(case_id = %self.case_id, error = %e, "Failed to write case log");
        }
    }

    /// Start-of-case banner with the case identity and a timestamp
    pub fn banner(&self) {
        self.line(format_args!(
            "{rule}\nStarting test case {id}\n  at {at}\n{rule}",
            rule = BANNER_RULE,
            id = self.case_id,
            at = Local::now().to_rfc3339(),
        ));
    }

    /// Stdio handle for a child process so its output lands in this sink
    pub fn stdio(&self) -> io::Result<Stdio> {
        match &self.target {
            Target::Stderr => Ok(Stdio::from(io::stderr())),
            Target::File { file, .. } => {
                let file = file
                    .lock()
                    .map_err(|_| io::Error::other("case log lock poisoned"))?;
                Ok(Stdio::from(file.try_clone()?))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_sink_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log-a.txt");

        let log = CaseLog::open("a", &path).unwrap();
        log.banner();
        log.line("first");
        drop(log);

        let log = CaseLog::open("a", &path).unwrap();
        log.line("second");

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("Starting test case a"));
        assert!(content.find("first").unwrap() < content.find("second").unwrap());
        assert_eq!(log.path(), Some(path.as_path()));
    }

    #[test]
    fn test_stderr_sink_has_no_path() {
        let log = CaseLog::stderr("b");
        assert_eq!(log.case_id(), "b");
        assert!(log.path().is_none());
        assert!(log.stdio().is_ok());
    }
}
