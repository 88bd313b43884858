use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{
    constants::DEFAULT_FILE_SIZE_LIMIT,
    core::diagnostic::Diagnostic,
};

/// Final classification of one test case run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Verdict {
    /// Accepted
    AC,
    /// Wrong answer
    WA,
    /// Runtime error
    RTE,
    /// Time limit exceeded
    TLE,
    /// Memory limit exceeded
    MLE,
    /// Output limit exceeded
    OLE,
}

impl Verdict {
    pub fn name(&self) -> &'static str {
        match self {
            Verdict::AC => "AC",
            Verdict::WA => "WA",
            Verdict::RTE => "RTE",
            Verdict::TLE => "TLE",
            Verdict::MLE => "MLE",
            Verdict::OLE => "OLE",
        }
    }

    /// Maps a sandbox outcome to a verdict. The output comparison only runs
    /// when the program finished normally.
    pub fn from_run<F>(status: RunStatus, output_matches: F) -> io::Result<Self>
    where
        F: FnOnce() -> io::Result<bool>,
    {
        Ok(match status {
            RunStatus::Ok => {
                if output_matches()? {
                    Verdict::AC
                } else {
                    Verdict::WA
                }
            }
            RunStatus::Timeout => Verdict::TLE,
            RunStatus::Oom => Verdict::MLE,
            RunStatus::Error => Verdict::RTE,
        })
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunStatus {
    Ok,
    Timeout,
    /// Killed for exceeding the memory ceiling
    Oom,
    /// Non-zero exit or any other confinement violation
    Error,
}

#[derive(Clone, Debug, PartialEq)]
pub struct RunOutcome {
    pub status: RunStatus,
    pub cpu_time: Duration,
    pub peak_memory_bytes: u64,
    /// Only filled when the caller did not redirect stderr itself.
    pub stderr: Option<Vec<u8>>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct RunLimits {
    pub timeout: Option<Duration>,
    pub memory_bytes: Option<u64>,
    pub tasks: Option<u64>,
    pub file_size_bytes: Option<u64>,
}

impl Default for RunLimits {
    fn default() -> Self {
        Self {
            timeout: None,
            memory_bytes: None,
            tasks: None,
            file_size_bytes: Some(DEFAULT_FILE_SIZE_LIMIT),
        }
    }
}

/// Shared flag that asks in-flight sandboxed runs to stop and release their unit.
#[derive(Clone, Debug, Default)]
pub struct Cancellation(Arc<AtomicBool>);

impl Cancellation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Identity of the worker performing a blocking operation.
///
/// Concurrent runs must use distinct `run_id`s so that their confinement
/// units do not collide.
#[derive(Clone, Debug, Default)]
pub struct RunContext {
    pub run_id: Option<String>,
    pub cancellation: Cancellation,
}

impl RunContext {
    pub fn new(run_id: impl Into<String>, cancellation: Cancellation) -> Self {
        Self {
            run_id: Some(run_id.into()),
            cancellation,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TestCase {
    pub id: String,
    pub input: PathBuf,
    pub expected: PathBuf,
}

impl TestCase {
    /// The identifier is the input file stem (`3.in` is test case `3`).
    pub fn from_paths(input: impl AsRef<Path>, expected: impl AsRef<Path>) -> Self {
        let input = input.as_ref().to_path_buf();
        let id = input
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_default();

        Self {
            id,
            input,
            expected: expected.as_ref().to_path_buf(),
        }
    }

    /// Pairs every `<name>.in` in `dir` with `<name>.ans`, or `<name>.out`
    /// when there is no `.ans`. Inputs without an answer are skipped.
    pub fn discover(dir: &Path) -> io::Result<Vec<Self>> {
        let mut inputs = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "in") {
                inputs.push(path);
            }
        }
        inputs.sort();

        let cases = inputs
            .into_iter()
            .filter_map(|input| {
                let expected = ["ans", "out"]
                    .iter()
                    .map(|ext| input.with_extension(ext))
                    .find(|path| path.is_file());
                if expected.is_none() {
                    tracing::warn!("No answer for {}", input.display());
                }
                expected.map(|expected| Self::from_paths(&input, expected))
            })
            .collect();
        Ok(cases)
    }
}

#[derive(Clone, Debug, Default)]
pub struct CheckOptions {
    pub instrumented: bool,
    pub time_limit: Option<Duration>,
    pub memory_limit_bytes: Option<u64>,
}

#[derive(Clone, Debug)]
pub struct CheckReport {
    pub verdict: Verdict,
    pub cpu_time: Duration,
    pub peak_memory_bytes: u64,
    /// Present for instrumented runs only.
    pub diagnostics: Option<Vec<Diagnostic>>,
}

/// Decides whether a program output is acceptable when byte equality is too strict.
pub trait Comparator {
    fn matches(&self, input: &Path, output: &Path, expected: &Path) -> io::Result<bool>;
}

impl<F> Comparator for F
where
    F: Fn(&Path, &Path, &Path) -> io::Result<bool>,
{
    fn matches(&self, input: &Path, output: &Path, expected: &Path) -> io::Result<bool> {
        self(input, output, expected)
    }
}

/// Optional capabilities discovered at startup.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Capability {
    Compiler,
    Sandbox,
    StaticAnalyzer,
    AstAnalyzer,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Capability::Compiler => "compiler",
            Capability::Sandbox => "sandbox",
            Capability::StaticAnalyzer => "static analyzer",
            Capability::AstAnalyzer => "AST analyzer",
        })
    }
}
