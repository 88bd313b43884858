use std::collections::{BTreeSet, HashMap};
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Local;
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use crate::{
    analysis::ast::walk::Visitor,
    constants::{
        BUILD_MEMORY_LIMIT, BUILD_TIMEOUT, CLANG_TIDY_EXPORT_FILE, COMPILER_OUTPUT_FILE,
        CUSTOM_DIAGS_FILE, INSTRUMENTATION_ARGS, INSTRUMENTED_EXTENSION, PROGRAM_NAME,
        SANITIZER_DIAGS_SUFFIX, SANITIZER_ENV, STATIC_DIAGS_FILE, SUMMARY_FILE, TEST_TASK_LIMIT,
    },
    core::diagnostic::{Diagnostic, Summary},
    core::domain::{
        Capability, CheckOptions, CheckReport, Comparator, RunContext, RunLimits, TestCase, Verdict,
    },
    core::errors::SubmissionError,
    core::toolchain::{BuildJob, Toolchain},
    core::traits::sandbox::{LogQuery, RunRequest},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SourceKind {
    Source,
    Header,
    Unknown,
}

impl SourceKind {
    pub fn of(path: &Path) -> Self {
        let extension = path
            .extension()
            .map(|ext| ext.to_string_lossy().to_lowercase())
            .unwrap_or_default();

        match extension.as_str() {
            "cpp" | "cc" | "cxx" | "c++" | "c" => SourceKind::Source,
            "h" | "hpp" | "hh" | "hxx" => SourceKind::Header,
            _ => SourceKind::Unknown,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct SubmissionOptions {
    pub include_dirs: Vec<PathBuf>,
    pub compiler_args: Vec<String>,
    /// Build artifacts. A timestamped directory is created when unset.
    pub work_dir: Option<PathBuf>,
    /// Diagnostic files. A timestamped directory is created when unset.
    pub output_dir: Option<PathBuf>,
}

/// Contents of a `<test case>-sanitizers.json` file.
#[derive(Debug, Serialize, Deserialize)]
struct SanitizerRecord {
    verdict: Verdict,
    diagnostics: Vec<Diagnostic>,
}

/// One code drop being judged.
///
/// Operations on the same submission must not overlap. Distinct submissions
/// are independent.
#[derive(Debug)]
pub struct Submission {
    toolchain: Arc<Toolchain>,
    source_dir: PathBuf,
    work_dir: PathBuf,
    output_dir: PathBuf,
    include_dirs: Vec<PathBuf>,
    compiler_args: Vec<String>,
    sources: Vec<PathBuf>,
    headers: Vec<PathBuf>,
    unknown: Vec<PathBuf>,
    /// Built binaries keyed by the instrumentation flag.
    binaries: HashMap<bool, PathBuf>,
}

impl Submission {
    pub fn new(
        toolchain: Arc<Toolchain>,
        source_dir: &Path,
        options: SubmissionOptions,
    ) -> Result<Self, SubmissionError> {
        let base = PathBuf::from(Local::now().format("%Y-%m-%dT%H%M%S%.6f").to_string());
        let work_dir = options.work_dir.unwrap_or_else(|| base.join("work"));
        let output_dir = options.output_dir.unwrap_or_else(|| base.join("output"));
        fs::create_dir_all(&work_dir)?;
        fs::create_dir_all(&output_dir)?;

        let mut submission = Self {
            toolchain,
            source_dir: source_dir.to_path_buf(),
            work_dir,
            output_dir,
            include_dirs: options.include_dirs,
            compiler_args: options.compiler_args,
            sources: Vec::new(),
            headers: Vec::new(),
            unknown: Vec::new(),
            binaries: HashMap::new(),
        };
        submission.collect_files()?;

        debug!(
            "Submission in {} has {} sources, {} headers, {} other files",
            submission.source_dir.display(),
            submission.sources.len(),
            submission.headers.len(),
            submission.unknown.len()
        );
        Ok(submission)
    }

    fn collect_files(&mut self) -> io::Result<()> {
        let mut paths = fs::read_dir(&self.source_dir)?
            .map(|entry| entry.map(|entry| entry.path()))
            .collect::<io::Result<Vec<_>>>()?;
        paths.sort();

        for path in paths {
            match SourceKind::of(&path) {
                SourceKind::Source => self.sources.push(path),
                SourceKind::Header => self.headers.push(path),
                SourceKind::Unknown => self.unknown.push(path),
            }
        }
        Ok(())
    }

    pub fn source_dir(&self) -> &Path {
        &self.source_dir
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn sources(&self) -> &[PathBuf] {
        &self.sources
    }

    pub fn headers(&self) -> &[PathBuf] {
        &self.headers
    }

    pub fn unknown_files(&self) -> &[PathBuf] {
        &self.unknown
    }

    pub fn binary(&self, instrumented: bool) -> Option<&Path> {
        self.binaries.get(&instrumented).map(PathBuf::as_path)
    }

    fn compile_args(&self) -> Vec<String> {
        self.include_dirs
            .iter()
            .map(|dir| format!("-I{}", dir.display()))
            .chain(self.compiler_args.iter().cloned())
            .collect()
    }

    /// Builds the plain or the instrumented binary, replacing any cached one.
    /// Compiler output goes to `compiler.txt` in the output directory.
    #[tracing::instrument(skip(self, ctx), fields(run_id = ?ctx.run_id))]
    pub fn build(&mut self, instrumented: bool, ctx: &RunContext) -> Result<bool, SubmissionError> {
        let mut binary = self.work_dir.join(PROGRAM_NAME);
        let mut extra_args = self.compile_args();

        if instrumented {
            binary.set_extension(INSTRUMENTED_EXTENSION);
            extra_args.extend(INSTRUMENTATION_ARGS.map(String::from));
        }

        self.binaries.remove(&instrumented);

        let job = BuildJob {
            sources: &self.sources,
            extra_args: &extra_args,
            output: &binary,
            limits: RunLimits {
                timeout: Some(BUILD_TIMEOUT),
                memory_bytes: Some(BUILD_MEMORY_LIMIT),
                ..Default::default()
            },
            log: File::create(self.output_dir.join(COMPILER_OUTPUT_FILE))?,
        };

        if !self.toolchain.build(job, ctx)? {
            return Ok(false);
        }

        self.binaries
            .insert(instrumented, std::path::absolute(&binary)?);
        Ok(true)
    }

    fn ensure_built(&mut self, instrumented: bool, ctx: &RunContext) -> Result<PathBuf, SubmissionError> {
        if let Some(binary) = self.binaries.get(&instrumented) {
            return Ok(binary.clone());
        }

        if !self.build(instrumented, ctx)? {
            return Err(SubmissionError::BuildFailed);
        }

        self.binaries
            .get(&instrumented)
            .cloned()
            .ok_or(SubmissionError::BuildFailed)
    }

    /// Runs one test case confined, writing the program's stdout to `output`.
    ///
    /// Instrumented runs also mine sanitizer reports and persist them as
    /// `<test case>-sanitizers.json` when there are any.
    #[tracing::instrument(skip(self, comparator, options, ctx), fields(case = %case.id, run_id = ?ctx.run_id))]
    pub fn check_output(
        &mut self,
        case: &TestCase,
        output: &Path,
        comparator: Option<&dyn Comparator>,
        options: &CheckOptions,
        ctx: &RunContext,
    ) -> Result<CheckReport, SubmissionError> {
        let sandbox = self
            .toolchain
            .sandbox()
            .cloned()
            .ok_or(SubmissionError::Unavailable(Capability::Sandbox))?;
        let binary = self.ensure_built(options.instrumented, ctx)?;

        let env = if options.instrumented {
            SANITIZER_ENV
                .iter()
                .map(|(key, value)| (key.to_string(), value.to_string()))
                .collect()
        } else {
            Vec::new()
        };

        let request = RunRequest {
            command: vec![binary.to_string_lossy().into_owned()],
            stdin: Some(File::open(&case.input)?),
            stdout: Some(File::create(output)?),
            stderr: None,
            limits: RunLimits {
                timeout: options.time_limit,
                memory_bytes: options.memory_limit_bytes,
                tasks: Some(TEST_TASK_LIMIT),
                ..Default::default()
            },
            env,
            run_id: ctx.run_id.clone(),
            ..Default::default()
        };

        let started = Local::now();
        let outcome = sandbox.run(request, &ctx.cancellation)?;

        let verdict = Verdict::from_run(outcome.status, || match comparator {
            Some(comparator) => comparator.matches(&case.input, output, &case.expected),
            None => Ok(fs::read(output)? == fs::read(&case.expected)?),
        })?;
        info!("Test case {}: {verdict}", case.id);

        let diagnostics = if options.instrumented {
            let query = LogQuery {
                run_id: ctx.run_id.clone(),
                since: Some(started),
                identifier: binary
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned()),
            };

            let mut log = sandbox.read_log(&query).unwrap_or_else(|e| {
                warn!("Cannot read the system log: {e}");
                Vec::new()
            });
            if log.is_empty() {
                if let Some(stderr) = &outcome.stderr {
                    log = String::from_utf8_lossy(stderr)
                        .lines()
                        .map(str::to_string)
                        .collect();
                }
            }

            let diagnostics = self.toolchain.sanitizers().parse(&log);
            if !diagnostics.is_empty() {
                let file = format!("{}{SANITIZER_DIAGS_SUFFIX}", case.id);
                self.persist(
                    &file,
                    &SanitizerRecord {
                        verdict,
                        diagnostics: diagnostics.clone(),
                    },
                )?;
            }
            Some(diagnostics)
        } else {
            None
        };

        Ok(CheckReport {
            verdict,
            cpu_time: outcome.cpu_time,
            peak_memory_bytes: outcome.peak_memory_bytes,
            diagnostics,
        })
    }

    /// Runs clang-tidy unconfined over every source file.
    #[tracing::instrument(skip(self))]
    pub fn check_static(&self) -> Result<Vec<Diagnostic>, SubmissionError> {
        let clang_tidy = self
            .toolchain
            .clang_tidy()
            .ok_or(SubmissionError::Unavailable(Capability::StaticAnalyzer))?;

        let export = self.output_dir.join(CLANG_TIDY_EXPORT_FILE);
        match fs::remove_file(&export) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e.into()),
            _ => {}
        }

        let args: Vec<String> = self
            .toolchain
            .compiler_args()
            .iter()
            .cloned()
            .chain(self.compile_args())
            .collect();

        clang_tidy.run(&self.sources, &args, &export)?;
        let diagnostics = clang_tidy.explain(&export, true)?;
        info!("clang-tidy reported {} diagnostics", diagnostics.len());

        self.persist(STATIC_DIAGS_FILE, &diagnostics)?;
        Ok(diagnostics)
    }

    pub fn check_custom(&self) -> Result<Vec<Diagnostic>, SubmissionError> {
        self.check_custom_with(&mut [])
    }

    /// Runs the built-in AST checks followed by `visitors`.
    #[tracing::instrument(skip(self, visitors))]
    pub fn check_custom_with(
        &self,
        visitors: &mut [&mut dyn Visitor],
    ) -> Result<Vec<Diagnostic>, SubmissionError> {
        let analyzer = self
            .toolchain
            .ast_analyzer()
            .ok_or(SubmissionError::Unavailable(Capability::AstAnalyzer))?;

        let diagnostics = analyzer.analyze(&self.sources, &self.source_dir, visitors)?;
        info!("Custom analysis reported {} diagnostics", diagnostics.len());

        self.persist(CUSTOM_DIAGS_FILE, &diagnostics)?;
        Ok(diagnostics)
    }

    /// Merges every persisted diagnostic file into one ranked list.
    ///
    /// With `must_explain`, sanitizer diagnostics must explain the verdict of
    /// their own run and the others must explain some observed verdict.
    #[tracing::instrument(skip(self, verdicts))]
    pub fn summary(
        &self,
        min_severity: i32,
        must_explain: bool,
        verdicts: impl IntoIterator<Item = Verdict>,
    ) -> Result<Vec<Diagnostic>, SubmissionError> {
        let mut summary = Summary::new(min_severity, verdicts);

        for record in self.sanitizer_records()? {
            summary.observe(record.verdict);
            let own = BTreeSet::from([record.verdict]);
            summary.extend(
                record
                    .diagnostics
                    .into_iter()
                    .filter(|diag| !must_explain || diag.explains_any(&own)),
            );
        }

        for file in [STATIC_DIAGS_FILE, CUSTOM_DIAGS_FILE] {
            let path = self.output_dir.join(file);
            if !path.exists() {
                continue;
            }

            let diagnostics: Vec<Diagnostic> = load(&path)?;
            let observed = summary.verdicts().clone();
            summary.extend(
                diagnostics
                    .into_iter()
                    .filter(|diag| !must_explain || diag.explains_any(&observed)),
            );
        }

        debug!("Summary keeps {} diagnostics", summary.len());
        Ok(summary.into_diagnostics())
    }

    /// Writes `summary.json` and returns its path.
    pub fn write_summary(&self, diagnostics: &[Diagnostic]) -> Result<PathBuf, SubmissionError> {
        self.persist(SUMMARY_FILE, diagnostics)
    }

    fn sanitizer_records(&self) -> Result<Vec<SanitizerRecord>, SubmissionError> {
        let mut paths = Vec::new();
        for entry in fs::read_dir(&self.output_dir)? {
            let path = entry?.path();
            let is_record = path
                .file_name()
                .is_some_and(|name| name.to_string_lossy().ends_with(SANITIZER_DIAGS_SUFFIX));
            if is_record {
                paths.push(path);
            }
        }
        paths.sort();

        paths.iter().map(|path| load(path)).collect()
    }

    fn persist<T: Serialize + ?Sized>(&self, file: &str, value: &T) -> Result<PathBuf, SubmissionError> {
        let path = self.output_dir.join(file);
        let writer = BufWriter::new(File::create(&path)?);
        serde_json::to_writer(writer, value)?;
        debug!("Wrote {}", path.display());
        Ok(path)
    }
}

fn load<T: DeserializeOwned>(path: &Path) -> Result<T, SubmissionError> {
    let reader = BufReader::new(File::open(path)?);
    Ok(serde_json::from_reader(reader)?)
}

#[cfg(all(test, unix))]
mod tests {
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;
    use std::sync::Mutex;
    use std::thread;
    use std::time::Duration;

    use tempfile::TempDir;

    use super::*;
    use crate::{
        core::domain::{Cancellation, RunOutcome, RunStatus},
        core::knowledge::KnowledgeBase,
        core::toolchain::ToolchainConfig,
        core::traits::sandbox::{MockSandbox, Sandbox},
    };

    const OVERFLOW: &str = "/src/main.cpp:5:10: runtime error: signed integer overflow: \
                            2147483647 + 1 cannot be represented in type 'int'";

    struct Fixture {
        dir: TempDir,
        toolchain: Arc<Toolchain>,
    }

    impl Fixture {
        fn new(sandbox: Option<MockSandbox>) -> Self {
            let dir = TempDir::new().unwrap();

            let compiler = dir.path().join("fake-c++");
            fs::write(&compiler, "#!/bin/sh\n").unwrap();
            fs::set_permissions(&compiler, fs::Permissions::from_mode(0o755)).unwrap();

            let src = dir.path().join("src");
            fs::create_dir(&src).unwrap();
            for file in ["main.cpp", "util.cc", "util.h", "notes.txt"] {
                fs::write(src.join(file), "").unwrap();
            }

            fs::write(dir.path().join("1.in"), "1 2\n").unwrap();
            fs::write(dir.path().join("1.ans"), "3\n").unwrap();

            let config = ToolchainConfig {
                compiler: Some(compiler.to_string_lossy().into_owned()),
                compiler_args: Vec::new(),
                knowledge: KnowledgeBase::builtin().unwrap(),
            };
            let sandbox = sandbox.map(|s| Arc::new(s) as Arc<dyn Sandbox>);
            let toolchain = Arc::new(Toolchain::new(config, sandbox).unwrap());

            Self { dir, toolchain }
        }

        fn submission(&self, name: &str) -> Submission {
            let root = self.dir.path().join(name);
            let options = SubmissionOptions {
                work_dir: Some(root.join("work")),
                output_dir: Some(root.join("output")),
                ..Default::default()
            };
            self.toolchain
                .new_submission(self.dir.path().join("src"), options)
                .unwrap()
        }

        fn case(&self) -> TestCase {
            TestCase::from_paths(self.dir.path().join("1.in"), self.dir.path().join("1.ans"))
        }

        fn output(&self, name: &str) -> PathBuf {
            self.dir.path().join(name)
        }
    }

    fn is_build(request: &RunRequest) -> bool {
        request.command.iter().any(|arg| arg == "-o")
    }

    fn outcome(status: RunStatus) -> RunOutcome {
        RunOutcome {
            status,
            cpu_time: Duration::from_millis(12),
            peak_memory_bytes: 1 << 20,
            stderr: None,
        }
    }

    /// Test runs print `stdout` and finish with `status`.
    fn program(sandbox: &mut MockSandbox, stdout: &'static str, status: RunStatus) {
        sandbox
            .expect_run()
            .withf(|request, _| !is_build(request))
            .returning(move |request, _| {
                if let Some(mut out) = request.stdout {
                    out.write_all(stdout.as_bytes()).unwrap();
                }
                Ok(outcome(status))
            });
    }

    fn successful_builds(sandbox: &mut MockSandbox, times: usize) {
        sandbox
            .expect_run()
            .withf(|request, _| is_build(request))
            .times(times)
            .returning(|_, _| Ok(outcome(RunStatus::Ok)));
    }

    #[test]
    fn test_sources_are_classified() {
        let fixture = Fixture::new(None);
        let submission = fixture.submission("s");

        let names = |paths: &[PathBuf]| -> Vec<String> {
            paths
                .iter()
                .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
                .collect()
        };

        assert_eq!(names(submission.sources()), ["main.cpp", "util.cc"]);
        assert_eq!(names(submission.headers()), ["util.h"]);
        assert_eq!(names(submission.unknown_files()), ["notes.txt"]);
        assert_eq!(SourceKind::of(Path::new("A.CPP")), SourceKind::Source);
    }

    #[test]
    fn test_matching_output_is_accepted_and_binary_cached() {
        let mut sandbox = MockSandbox::new();
        successful_builds(&mut sandbox, 1);
        program(&mut sandbox, "3\n", RunStatus::Ok);

        let fixture = Fixture::new(Some(sandbox));
        let mut submission = fixture.submission("s");
        let ctx = RunContext::default();

        for _ in 0..2 {
            let report = submission
                .check_output(&fixture.case(), &fixture.output("1.out"), None, &CheckOptions::default(), &ctx)
                .unwrap();

            assert_eq!(report.verdict, Verdict::AC);
            assert_eq!(report.cpu_time, Duration::from_millis(12));
            assert!(report.diagnostics.is_none());
        }

        let binary = submission.binary(false).unwrap();
        assert!(binary.ends_with("work/program"));
        assert!(submission.binary(true).is_none());
    }

    #[test]
    fn test_differing_output_is_wrong_answer() {
        let mut sandbox = MockSandbox::new();
        successful_builds(&mut sandbox, 1);
        program(&mut sandbox, "4\n", RunStatus::Ok);

        let fixture = Fixture::new(Some(sandbox));
        let mut submission = fixture.submission("s");

        let report = submission
            .check_output(
                &fixture.case(),
                &fixture.output("1.out"),
                None,
                &CheckOptions::default(),
                &RunContext::default(),
            )
            .unwrap();
        assert_eq!(report.verdict, Verdict::WA);
    }

    #[test]
    fn test_comparator_overrides_byte_equality() {
        let mut sandbox = MockSandbox::new();
        successful_builds(&mut sandbox, 1);
        program(&mut sandbox, "3   \n", RunStatus::Ok);

        let fixture = Fixture::new(Some(sandbox));
        let mut submission = fixture.submission("s");

        let trimmed = |_: &Path, output: &Path, expected: &Path| -> io::Result<bool> {
            Ok(fs::read_to_string(output)?.trim() == fs::read_to_string(expected)?.trim())
        };

        let report = submission
            .check_output(
                &fixture.case(),
                &fixture.output("1.out"),
                Some(&trimmed),
                &CheckOptions::default(),
                &RunContext::default(),
            )
            .unwrap();
        assert_eq!(report.verdict, Verdict::AC);
    }

    #[test]
    fn test_abnormal_runs_map_to_verdicts() {
        for (status, verdict) in [
            (RunStatus::Timeout, Verdict::TLE),
            (RunStatus::Oom, Verdict::MLE),
            (RunStatus::Error, Verdict::RTE),
        ] {
            let mut sandbox = MockSandbox::new();
            successful_builds(&mut sandbox, 1);
            // Matching output must not rescue an abnormal run.
            program(&mut sandbox, "3\n", status);

            let fixture = Fixture::new(Some(sandbox));
            let mut submission = fixture.submission("s");

            let report = submission
                .check_output(
                    &fixture.case(),
                    &fixture.output("1.out"),
                    None,
                    &CheckOptions::default(),
                    &RunContext::default(),
                )
                .unwrap();
            assert_eq!(report.verdict, verdict);
        }
    }

    #[test]
    fn test_failed_build_is_not_cached() {
        let mut sandbox = MockSandbox::new();
        sandbox
            .expect_run()
            .withf(|request, _| is_build(request))
            .times(2)
            .returning(|_, _| Ok(outcome(RunStatus::Error)));

        let fixture = Fixture::new(Some(sandbox));
        let mut submission = fixture.submission("s");

        for _ in 0..2 {
            let result = submission.check_output(
                &fixture.case(),
                &fixture.output("1.out"),
                None,
                &CheckOptions::default(),
                &RunContext::default(),
            );
            assert!(matches!(result, Err(SubmissionError::BuildFailed)));
        }

        assert!(submission.binary(false).is_none());
        assert!(submission.output_dir().join("compiler.txt").exists());
    }

    #[test]
    fn test_instrumented_run_persists_sanitizer_diagnostics() {
        let queries = Arc::new(Mutex::new(Vec::new()));

        let mut sandbox = MockSandbox::new();
        successful_builds(&mut sandbox, 1);
        sandbox
            .expect_run()
            .withf(|request, _| {
                !is_build(request)
                    && request.command[0].ends_with("program.instr")
                    && request.env.iter().any(|(key, _)| key == "UBSAN_OPTIONS")
                    && request.limits.tasks == Some(2)
            })
            .returning(|_, _| Ok(outcome(RunStatus::Error)));
        let recorded = queries.clone();
        sandbox.expect_read_log().returning(move |query| {
            recorded.lock().unwrap().push(query.clone());
            Ok(vec!["unrelated line".to_string(), OVERFLOW.to_string()])
        });

        let fixture = Fixture::new(Some(sandbox));
        let mut submission = fixture.submission("s");
        let options = CheckOptions {
            instrumented: true,
            ..Default::default()
        };
        let ctx = RunContext::new("worker-1", Cancellation::new());

        let report = submission
            .check_output(&fixture.case(), &fixture.output("1.out"), None, &options, &ctx)
            .unwrap();

        assert_eq!(report.verdict, Verdict::RTE);
        let diagnostics = report.diagnostics.unwrap();
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].id, "integer-overflow");
        assert_eq!(diagnostics[0].line, Some(5));

        let queries = queries.lock().unwrap();
        assert_eq!(queries[0].identifier.as_deref(), Some("program.instr"));
        assert_eq!(queries[0].run_id.as_deref(), Some("worker-1"));

        let record: SanitizerRecord =
            load(&submission.output_dir().join("1-sanitizers.json")).unwrap();
        assert_eq!(record.verdict, Verdict::RTE);
        assert_eq!(record.diagnostics, diagnostics);
    }

    #[test]
    fn test_sanitizer_reports_fall_back_to_stderr() {
        let mut sandbox = MockSandbox::new();
        successful_builds(&mut sandbox, 1);
        sandbox
            .expect_run()
            .withf(|request, _| !is_build(request))
            .returning(|_, _| {
                Ok(RunOutcome {
                    stderr: Some(format!("{OVERFLOW}\n").into_bytes()),
                    ..outcome(RunStatus::Error)
                })
            });
        sandbox.expect_read_log().returning(|_| Ok(Vec::new()));

        let fixture = Fixture::new(Some(sandbox));
        let mut submission = fixture.submission("s");
        let options = CheckOptions {
            instrumented: true,
            ..Default::default()
        };

        let report = submission
            .check_output(&fixture.case(), &fixture.output("1.out"), None, &options, &RunContext::default())
            .unwrap();

        assert_eq!(report.diagnostics.map(|d| d.len()), Some(1));
    }

    #[test]
    fn test_clean_instrumented_run_writes_no_record() {
        let mut sandbox = MockSandbox::new();
        successful_builds(&mut sandbox, 1);
        program(&mut sandbox, "3\n", RunStatus::Ok);
        sandbox.expect_read_log().returning(|_| Ok(Vec::new()));

        let fixture = Fixture::new(Some(sandbox));
        let mut submission = fixture.submission("s");
        let options = CheckOptions {
            instrumented: true,
            ..Default::default()
        };

        let report = submission
            .check_output(&fixture.case(), &fixture.output("1.out"), None, &options, &RunContext::default())
            .unwrap();

        assert_eq!(report.verdict, Verdict::AC);
        assert_eq!(report.diagnostics, Some(Vec::new()));
        assert!(!submission.output_dir().join("1-sanitizers.json").exists());
    }

    #[test]
    fn test_missing_capabilities_are_unavailable() {
        let fixture = Fixture::new(None);
        let mut submission = fixture.submission("s");

        assert!(matches!(
            submission.check_static(),
            Err(SubmissionError::Unavailable(Capability::StaticAnalyzer))
        ));
        assert!(matches!(
            submission.check_custom(),
            Err(SubmissionError::Unavailable(Capability::AstAnalyzer))
        ));

        let result = submission.check_output(
            &fixture.case(),
            &fixture.output("1.out"),
            None,
            &CheckOptions::default(),
            &RunContext::default(),
        );
        assert!(matches!(
            result,
            Err(SubmissionError::Unavailable(Capability::Sandbox))
        ));
        assert!(result.unwrap_err().is_degraded());
    }

    fn diag(id: &str, severity: i32, explains: &[Verdict]) -> Diagnostic {
        Diagnostic {
            id: id.to_string(),
            file: Some("main.cpp".to_string()),
            line: Some(1),
            short: id.to_string(),
            severity,
            explains: explains.iter().copied().collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_summary_merges_persisted_sources() {
        let fixture = Fixture::new(None);
        let submission = fixture.submission("s");

        submission
            .persist(
                "1-sanitizers.json",
                &SanitizerRecord {
                    verdict: Verdict::RTE,
                    diagnostics: vec![
                        diag("out-of-bounds", 7, &[Verdict::RTE, Verdict::WA]),
                        diag("slow-path", 9, &[Verdict::TLE]),
                    ],
                },
            )
            .unwrap();
        submission
            .persist(
                STATIC_DIAGS_FILE,
                &[
                    diag("narrowing-conversion", 5, &[Verdict::WA]),
                    diag("copy-in-loop", 6, &[Verdict::TLE]),
                    diag("style", 1, &[Verdict::WA]),
                ],
            )
            .unwrap();
        submission
            .persist(CUSTOM_DIAGS_FILE, &[diag("out-of-bounds", 7, &[Verdict::RTE])])
            .unwrap();

        let ids = |diags: Vec<Diagnostic>| -> Vec<String> {
            diags.into_iter().map(|d| d.id).collect()
        };

        let explained = submission.summary(4, true, [Verdict::WA]).unwrap();
        assert_eq!(ids(explained), ["out-of-bounds", "narrowing-conversion"]);

        let everything = submission.summary(4, false, [Verdict::WA]).unwrap();
        assert_eq!(
            ids(everything),
            ["out-of-bounds", "narrowing-conversion", "slow-path", "copy-in-loop"]
        );

        let path = submission.write_summary(&[diag("style", 1, &[])]).unwrap();
        assert!(path.ends_with("summary.json"));
    }

    #[test]
    fn test_concurrent_submissions_are_isolated() {
        let mut sandbox = MockSandbox::new();
        sandbox
            .expect_run()
            .withf(|request, _| is_build(request))
            .returning(|_, _| Ok(outcome(RunStatus::Ok)));
        sandbox
            .expect_run()
            .withf(|request, _| !is_build(request))
            .returning(|request, _| {
                if request.run_id.as_deref() == Some("worker-0") {
                    thread::sleep(Duration::from_millis(20));
                    return Ok(outcome(RunStatus::Oom));
                }
                if let Some(mut out) = request.stdout {
                    out.write_all(b"3\n").unwrap();
                }
                Ok(outcome(RunStatus::Ok))
            });

        let fixture = Fixture::new(Some(sandbox));
        let verdicts: Vec<Verdict> = thread::scope(|scope| {
            let handles: Vec<_> = (0..2)
                .map(|n| {
                    let fixture = &fixture;
                    scope.spawn(move || {
                        let mut submission = fixture.submission(&format!("s{n}"));
                        let ctx = RunContext::new(format!("worker-{n}"), Cancellation::new());
                        submission
                            .check_output(
                                &fixture.case(),
                                &fixture.output(&format!("{n}.out")),
                                None,
                                &CheckOptions::default(),
                                &ctx,
                            )
                            .unwrap()
                            .verdict
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(verdicts, [Verdict::MLE, Verdict::AC]);
    }
}
