use std::fs::File;
use std::path::PathBuf;

use chrono::{DateTime, Local};
use thiserror::Error;

use crate::core::domain::{Cancellation, RunLimits, RunOutcome};

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("cannot reach the service manager: {0}")]
    Bus(#[from] zbus::Error),
    #[error("unit {unit} could not be started: {msg}")]
    Start { unit: String, msg: String },
    #[error("cannot read property {property} of {unit}: {msg}")]
    Property {
        unit: String,
        property: &'static str,
        msg: String,
    },
    #[error("run cancelled")]
    Cancelled,
    #[error("invalid run request: {0}")]
    InvalidRequest(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// One confined execution. `command[0]` is the program.
///
/// When `stderr` is `None` the sandbox captures it and returns it in the outcome.
#[derive(Debug, Default)]
pub struct RunRequest {
    pub command: Vec<String>,
    pub stdin: Option<File>,
    pub stdout: Option<File>,
    pub stderr: Option<File>,
    pub limits: RunLimits,
    pub writable_dirs: Vec<PathBuf>,
    pub env: Vec<(String, String)>,
    pub working_dir: Option<PathBuf>,
    pub run_id: Option<String>,
}

/// Filter over the system log entries produced by confined runs.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LogQuery {
    pub run_id: Option<String>,
    pub since: Option<DateTime<Local>>,
    pub identifier: Option<String>,
}

/// Blocking confinement facility. Implementations must support concurrent
/// runs as long as they use distinct run ids.
#[cfg_attr(test, mockall::automock)]
pub trait Sandbox: std::fmt::Debug + Send + Sync {
    fn run(
        &self,
        request: RunRequest,
        cancellation: &Cancellation,
    ) -> Result<RunOutcome, SandboxError>;

    fn read_log(&self, query: &LogQuery) -> Result<Vec<String>, SandboxError>;

    fn version(&self) -> Result<String, SandboxError>;
}
