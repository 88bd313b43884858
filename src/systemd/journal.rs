use std::ffi::OsString;
use std::path::PathBuf;
use std::process::{Command, Stdio};

use tracing::debug;

use crate::core::traits::sandbox::{LogQuery, SandboxError};

/// Microseconds keep runs started within the same second apart.
const SINCE_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

/// Reader for the user's system log, backed by `journalctl`.
#[derive(Clone, Debug)]
pub struct Journal {
    program: PathBuf,
}

impl Default for Journal {
    fn default() -> Self {
        Self::new("journalctl")
    }
}

impl Journal {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn args(unit: Option<&str>, query: &LogQuery) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec!["--user".into(), "-o".into(), "cat".into()];

        if let Some(unit) = unit {
            args.extend(["-u".into(), unit.into()]);
        }
        if let Some(since) = &query.since {
            args.extend(["-S".into(), since.format(SINCE_FORMAT).to_string().into()]);
        }
        if let Some(identifier) = &query.identifier {
            args.extend(["-t".into(), identifier.into()]);
        }

        args
    }

    /// Message lines of the matching entries, oldest first.
    pub fn read(&self, unit: Option<&str>, query: &LogQuery) -> Result<Vec<String>, SandboxError> {
        let out = Command::new(&self.program)
            .args(Self::args(unit, query))
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .output()?;

        let lines: Vec<String> = String::from_utf8_lossy(&out.stdout)
            .lines()
            .map(str::to_string)
            .collect();

        debug!("Read {} journal lines for {unit:?}", lines.len());
        Ok(lines)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Local, TimeDelta, TimeZone};

    use super::*;

    fn strings(args: Vec<OsString>) -> Vec<String> {
        args.into_iter()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn test_args_without_filters() {
        let args = Journal::args(None, &LogQuery::default());
        assert_eq!(strings(args), ["--user", "-o", "cat"]);
    }

    #[test]
    fn test_args_with_all_filters() {
        let since = Local.with_ymd_and_hms(2024, 3, 9, 7, 5, 1).unwrap()
            + TimeDelta::microseconds(250_042);
        let query = LogQuery {
            run_id: Some("worker-1".to_string()),
            since: Some(since),
            identifier: Some("program.instr".to_string()),
        };

        let args = Journal::args(Some("codegavel-worker-1.service"), &query);
        assert_eq!(
            strings(args),
            [
                "--user",
                "-o",
                "cat",
                "-u",
                "codegavel-worker-1.service",
                "-S",
                "2024-03-09 07:05:01.250042",
                "-t",
                "program.instr",
            ]
        );
    }

    #[test]
    fn test_runs_within_one_second_get_distinct_windows() {
        let first = Local.with_ymd_and_hms(2024, 3, 9, 7, 5, 1).unwrap();
        let second = first + TimeDelta::milliseconds(300);
        let query = |since| LogQuery {
            since: Some(since),
            ..Default::default()
        };

        let first = strings(Journal::args(None, &query(first)));
        let second = strings(Journal::args(None, &query(second)));

        assert_eq!(first[4], "2024-03-09 07:05:01.000000");
        assert_eq!(second[4], "2024-03-09 07:05:01.300000");
    }

    #[test]
    fn test_missing_journalctl_is_an_io_error() {
        let journal = Journal::new("/nonexistent/journalctl");
        let result = journal.read(None, &LogQuery::default());
        assert!(matches!(result, Err(SandboxError::Io(_))));
    }
}
