use std::io::Write;
use std::thread;
use std::time::{Duration, Instant};

use crate::{
    constants::UNIT_POLL_INTERVAL,
    core::domain::{Cancellation, RunOutcome, RunStatus},
    core::traits::sandbox::{LogQuery, RunRequest, Sandbox, SandboxError},
};

/// Sandbox that never executes anything. Test runs finish with a canned
/// status and stdout, builds always succeed.
#[derive(Debug, Clone)]
pub struct SandboxStub {
    status: RunStatus,
    stdout: Vec<u8>,
    log: Vec<String>,
    delay: Duration,
}

impl SandboxStub {
    pub fn new(status: RunStatus, stdout: impl Into<Vec<u8>>, delay: Duration) -> Self {
        Self {
            status,
            stdout: stdout.into(),
            log: Vec::new(),
            delay,
        }
    }

    /// Lines returned by `read_log` for every query.
    pub fn with_log<I, S>(mut self, log: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.log = log.into_iter().map(Into::into).collect();
        self
    }
}

impl Sandbox for SandboxStub {
    #[tracing::instrument(skip(self, request, cancellation), fields(run_id = ?request.run_id))]
    fn run(
        &self,
        mut request: RunRequest,
        cancellation: &Cancellation,
    ) -> Result<RunOutcome, SandboxError> {
        tracing::debug!("Start stub run: command={:?}", request.command);

        let deadline = Instant::now() + self.delay;
        while Instant::now() < deadline {
            if cancellation.is_cancelled() {
                return Err(SandboxError::Cancelled);
            }
            thread::sleep(UNIT_POLL_INTERVAL.min(self.delay));
        }

        let status = if request.writable_dirs.is_empty() {
            if let Some(stdout) = request.stdout.as_mut() {
                stdout.write_all(&self.stdout)?;
            }
            self.status
        } else {
            RunStatus::Ok
        };
        tracing::debug!("Stub run result: {status:?}");

        Ok(RunOutcome {
            status,
            cpu_time: self.delay,
            peak_memory_bytes: 0,
            stderr: request.stderr.is_none().then(Vec::new),
        })
    }

    fn read_log(&self, query: &LogQuery) -> Result<Vec<String>, SandboxError> {
        tracing::debug!("Stub log query: {query:?}");
        Ok(self.log.clone())
    }

    fn version(&self) -> Result<String, SandboxError> {
        Ok("stub".to_string())
    }
}
