use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};
use std::{env, io, iter, thread};

use tracing::{debug, info, warn};

use crate::{
    analysis::AnalysisError,
    analysis::ast::AstAnalyzer,
    analysis::clang_tidy::ClangTidy,
    analysis::sanitizers::SanitizerParser,
    constants::{COMPILER_CANDIDATES, UNIT_POLL_INTERVAL},
    core::domain::{Cancellation, Capability, RunContext, RunLimits, RunStatus},
    core::errors::SubmissionError,
    core::knowledge::{KnowledgeBase, KnowledgeError},
    core::probe,
    core::submission::{Submission, SubmissionOptions},
    core::traits::sandbox::{RunRequest, Sandbox, SandboxError},
    systemd::SystemdSandbox,
};

const COMPILER_ENV: &str = "CXX";
const COMPILER_ARGS_ENV: &str = "CODEGAVEL_COMPILER_ARGS";
const DATA_DIR_ENV: &str = "CODEGAVEL_DATA_DIR";

#[derive(Clone, Debug, Default)]
pub struct ToolchainConfig {
    /// Compiler name or path. When unset, common compiler names are probed.
    pub compiler: Option<String>,
    pub compiler_args: Vec<String>,
    pub knowledge: KnowledgeBase,
}

impl ToolchainConfig {
    pub fn from_env() -> Result<Self, KnowledgeError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, KnowledgeError> {
        let knowledge = match lookup(DATA_DIR_ENV) {
            Some(dir) => KnowledgeBase::from_dir(Path::new(&dir))?,
            None => KnowledgeBase::builtin()?,
        };

        Ok(Self {
            compiler: lookup(COMPILER_ENV).filter(|cxx| !cxx.is_empty()),
            compiler_args: lookup(COMPILER_ARGS_ENV)
                .map(|args| args.split_whitespace().map(str::to_string).collect())
                .unwrap_or_default(),
            knowledge,
        })
    }
}

/// An explicitly requested compiler that cannot be found is not replaced.
fn find_compiler(requested: Option<&str>) -> Option<PathBuf> {
    match requested {
        Some(name) => {
            let found = probe::resolve_program(name);
            if found.is_none() {
                warn!("Compiler {name} given in {COMPILER_ENV} was not found");
            }
            found
        }
        None => COMPILER_CANDIDATES
            .iter()
            .find_map(|name| probe::find_in_path(name)),
    }
}

/// Inputs of one compiler invocation.
#[derive(Debug)]
pub struct BuildJob<'a> {
    pub sources: &'a [PathBuf],
    pub extra_args: &'a [String],
    pub output: &'a Path,
    pub limits: RunLimits,
    /// Receives the compiler's stdout and stderr.
    pub log: File,
}

/// Discovered compiler, analyzers and sandbox. Built once per process.
#[derive(Debug)]
pub struct Toolchain {
    compiler: Option<PathBuf>,
    compiler_args: Vec<String>,
    kb: Arc<KnowledgeBase>,
    sandbox: Option<Arc<dyn Sandbox>>,
    sanitizers: SanitizerParser,
    clang_tidy: Option<ClangTidy>,
    ast: Option<AstAnalyzer>,
}

impl Toolchain {
    /// Probes the compiler only. Analyzers start out unavailable.
    pub fn new(
        config: ToolchainConfig,
        sandbox: Option<Arc<dyn Sandbox>>,
    ) -> Result<Self, AnalysisError> {
        let compiler = find_compiler(config.compiler.as_deref());
        match &compiler {
            Some(path) => info!("Using compiler {}", path.display()),
            None => warn!("No compiler found, builds are unavailable"),
        }

        let kb = Arc::new(config.knowledge);

        Ok(Self {
            compiler,
            compiler_args: config.compiler_args,
            sanitizers: SanitizerParser::new(kb.clone())?,
            kb,
            sandbox,
            clang_tidy: None,
            ast: None,
        })
    }

    /// Probes every capability. Missing ones are logged and left unavailable.
    pub fn discover(config: ToolchainConfig) -> Result<Self, AnalysisError> {
        let sandbox = match SystemdSandbox::connect().and_then(|sandbox| {
            let version = sandbox.version()?;
            Ok((sandbox, version))
        }) {
            Ok((sandbox, version)) => {
                info!("Using systemd {version}");
                Some(Arc::new(sandbox) as Arc<dyn Sandbox>)
            }
            Err(e) => {
                warn!("systemd is not available, tests cannot run: {e}");
                None
            }
        };

        let toolchain = Self::new(config, sandbox)?;

        let clang_tidy = ClangTidy::discover(toolchain.kb.clone());
        if clang_tidy.is_none() {
            warn!("clang-tidy not found, static analysis is unavailable");
        }

        let ast = AstAnalyzer::discover(toolchain.kb.clone(), toolchain.compiler_args.clone())?;
        if ast.is_none() {
            warn!("clang not found, custom analysis is unavailable");
        }

        Ok(toolchain.with_clang_tidy(clang_tidy).with_ast_analyzer(ast))
    }

    pub fn with_clang_tidy(mut self, clang_tidy: Option<ClangTidy>) -> Self {
        self.clang_tidy = clang_tidy;
        self
    }

    pub fn with_ast_analyzer(mut self, ast: Option<AstAnalyzer>) -> Self {
        self.ast = ast;
        self
    }

    pub fn compiler(&self) -> Option<&Path> {
        self.compiler.as_deref()
    }

    pub fn compiler_args(&self) -> &[String] {
        &self.compiler_args
    }

    pub fn knowledge(&self) -> &Arc<KnowledgeBase> {
        &self.kb
    }

    pub fn sandbox(&self) -> Option<&Arc<dyn Sandbox>> {
        self.sandbox.as_ref()
    }

    pub fn sanitizers(&self) -> &SanitizerParser {
        &self.sanitizers
    }

    pub fn clang_tidy(&self) -> Option<&ClangTidy> {
        self.clang_tidy.as_ref()
    }

    pub fn ast_analyzer(&self) -> Option<&AstAnalyzer> {
        self.ast.as_ref()
    }

    /// Availability of each tool, with its version when known.
    pub fn info(&self) -> Vec<(&'static str, Option<String>)> {
        let version = |program: &Path| {
            probe::tool_version(program).unwrap_or_else(|| program.display().to_string())
        };

        vec![
            ("Compiler", self.compiler.as_deref().map(version)),
            ("clang-tidy", self.clang_tidy.as_ref().map(|t| version(t.program()))),
            ("AST analyzer", self.ast.as_ref().map(|a| version(a.program()))),
            (
                "systemd",
                self.sandbox
                    .as_ref()
                    .map(|s| s.version().unwrap_or_else(|e| e.to_string())),
            ),
        ]
    }

    pub fn new_submission(
        self: &Arc<Self>,
        source_dir: impl AsRef<Path>,
        options: SubmissionOptions,
    ) -> Result<Submission, SubmissionError> {
        Submission::new(Arc::clone(self), source_dir.as_ref(), options)
    }

    /// Compiles `sources` into `output`. Runs confined when a sandbox is
    /// available and directly with a deadline otherwise.
    #[tracing::instrument(skip(self, job, ctx), fields(output = %job.output.display()))]
    pub fn build(&self, job: BuildJob<'_>, ctx: &RunContext) -> Result<bool, SubmissionError> {
        let compiler = self
            .compiler
            .as_ref()
            .ok_or(SubmissionError::Unavailable(Capability::Compiler))?;

        let output = std::path::absolute(job.output)?;
        let sources = job
            .sources
            .iter()
            .map(std::path::absolute)
            .collect::<io::Result<Vec<_>>>()?;

        let command: Vec<String> = iter::once(compiler.to_string_lossy().into_owned())
            .chain(self.compiler_args.iter().cloned())
            .chain(job.extra_args.iter().cloned())
            .chain(sources.iter().map(|s| s.to_string_lossy().into_owned()))
            .chain(["-o".to_string(), output.to_string_lossy().into_owned()])
            .collect();
        debug!("Compiler command: {command:?}");

        let built = match &self.sandbox {
            Some(sandbox) => {
                let request = RunRequest {
                    command,
                    stdout: Some(job.log.try_clone()?),
                    stderr: Some(job.log),
                    limits: job.limits,
                    writable_dirs: output.parent().map(Path::to_path_buf).into_iter().collect(),
                    run_id: ctx.run_id.clone(),
                    ..Default::default()
                };
                sandbox.run(request, &ctx.cancellation)?.status == RunStatus::Ok
            }
            None => build_unconfined(&command, job.log, job.limits.timeout, &ctx.cancellation)?,
        };

        if built {
            info!("Built {}", output.display());
        } else {
            warn!("Build of {} failed", output.display());
        }
        Ok(built)
    }
}

fn build_unconfined(
    command: &[String],
    log: File,
    timeout: Option<Duration>,
    cancellation: &Cancellation,
) -> Result<bool, SubmissionError> {
    let Some((program, args)) = command.split_first() else {
        return Ok(false);
    };

    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(log.try_clone()?)
        .stderr(log)
        .spawn()?;
    let deadline = timeout.map(|timeout| Instant::now() + timeout);

    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(status.success());
        }

        let cancelled = cancellation.is_cancelled();
        if cancelled || deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            let _ = child.kill();
            child.wait()?;

            if cancelled {
                return Err(SandboxError::Cancelled.into());
            }
            warn!("Compiler exceeded {timeout:?}");
            return Ok(false);
        }

        thread::sleep(UNIT_POLL_INTERVAL);
    }
}
