#![cfg(unix)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::sync::mpsc;

use crate::{
    core::domain::{CheckOptions, RunContext, RunStatus, TestCase, Verdict},
    core::errors::SubmissionError,
    core::knowledge::KnowledgeBase,
    core::pipeline::judging::{JobResult, JudgeJob, WorkerPool, handle_judging},
    core::submission::{Submission, SubmissionOptions},
    core::toolchain::{Toolchain, ToolchainConfig},
    core::traits::sandbox::{Sandbox, SandboxError},
    stubs::sandbox::SandboxStub,
};

const OVERFLOW: &str = "/src/main.cpp:6:15: runtime error: signed integer overflow: \
                        2147483647 + 1 cannot be represented in type 'int'";

/// A problem directory with one submission and its test cases.
struct Problem {
    dir: TempDir,
}

impl Problem {
    fn new(source: &str, cases: &[(&str, &str, &str)]) -> Self {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src");
        fs::create_dir(&src).unwrap();
        fs::write(src.join("main.cpp"), source).unwrap();

        let tests = dir.path().join("tests");
        fs::create_dir(&tests).unwrap();
        for (id, input, answer) in cases {
            fs::write(tests.join(format!("{id}.in")), input).unwrap();
            fs::write(tests.join(format!("{id}.ans")), answer).unwrap();
        }

        Self { dir }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    fn cases(&self) -> Vec<TestCase> {
        TestCase::discover(&self.path("tests")).unwrap()
    }

    fn submission(&self, toolchain: &Arc<Toolchain>, name: &str) -> Submission {
        let root = self.path(name);
        let options = SubmissionOptions {
            work_dir: Some(root.join("work")),
            output_dir: Some(root.join("output")),
            ..Default::default()
        };
        toolchain.new_submission(self.path("src"), options).unwrap()
    }
}

/// Toolchain whose compiler is never run because the sandbox is a stub.
fn stub_toolchain(dir: &Path, sandbox: SandboxStub) -> Arc<Toolchain> {
    let compiler = dir.join("fake-c++");
    fs::write(&compiler, "#!/bin/sh\n").unwrap();
    fs::set_permissions(&compiler, fs::Permissions::from_mode(0o755)).unwrap();

    let config = ToolchainConfig {
        compiler: Some(compiler.to_string_lossy().into_owned()),
        compiler_args: Vec::new(),
        knowledge: KnowledgeBase::builtin().unwrap(),
    };
    let sandbox = Arc::new(sandbox) as Arc<dyn Sandbox>;
    Arc::new(Toolchain::new(config, Some(sandbox)).unwrap())
}

/// Real compiler and systemd user session, or `None` when either is missing.
fn confined_toolchain() -> Option<Arc<Toolchain>> {
    let toolchain = Toolchain::discover(ToolchainConfig::from_env().ok()?).ok()?;
    if toolchain.compiler().is_none() || toolchain.sandbox().is_none() {
        eprintln!("Skipping: needs a compiler and a systemd user session");
        return None;
    }
    Some(Arc::new(toolchain))
}

fn unconfined_toolchain() -> Option<Arc<Toolchain>> {
    let toolchain = Toolchain::new(ToolchainConfig::from_env().ok()?, None).ok()?;
    if toolchain.compiler().is_none() {
        eprintln!("Skipping: needs a compiler");
        return None;
    }
    Some(Arc::new(toolchain))
}

async fn collect<T>(mut res_rx: mpsc::Receiver<JobResult<T>>) -> Vec<JobResult<T>> {
    let mut results = Vec::new();
    while let Some(result) = res_rx.recv().await {
        results.push(result);
    }
    results
}

/// Runs every case of `problem` through one submission on a worker slot.
fn judge_all(
    problem: Arc<Problem>,
    toolchain: Arc<Toolchain>,
    name: &'static str,
    options: CheckOptions,
) -> JudgeJob<Result<Vec<Verdict>, SubmissionError>> {
    JudgeJob::new(move |ctx: &RunContext| {
        let mut submission = problem.submission(&toolchain, name);
        problem
            .cases()
            .iter()
            .map(|case| {
                let output = submission.output_dir().join(format!("{}.out", case.id));
                submission
                    .check_output(case, &output, None, &options, ctx)
                    .map(|report| report.verdict)
            })
            .collect()
    })
}

#[tokio::test]
async fn test_pool_judges_submissions_with_stub_sandbox() {
    let problem = Arc::new(Problem::new(
        "int main() {}",
        &[("1", "1 2\n", "3\n"), ("2", "2 2\n", "4\n")],
    ));
    let toolchain = stub_toolchain(
        problem.dir.path(),
        SandboxStub::new(RunStatus::Ok, "3\n", Duration::from_millis(5)),
    );

    let (job_tx, job_rx) = mpsc::channel(4);
    let (res_tx, res_rx) = mpsc::channel(4);
    let handle = handle_judging(WorkerPool::new(2), job_rx, res_tx);

    for name in ["a", "b"] {
        job_tx
            .send(judge_all(
                problem.clone(),
                toolchain.clone(),
                name,
                CheckOptions::default(),
            ))
            .await
            .unwrap();
    }
    drop(job_tx);

    let results = collect(res_rx).await;
    handle.await.unwrap();

    assert_eq!(results.len(), 2);
    for result in results {
        let verdicts = result.output.unwrap();
        assert_eq!(verdicts, [Verdict::AC, Verdict::WA]);
    }
    assert!(problem.path("a/output/compiler.txt").is_file());
    assert!(problem.path("b/output/compiler.txt").is_file());
}

#[test]
fn test_instrumented_failure_reaches_summary() {
    let problem = Problem::new("int main() {}", &[("1", "2147483647 1\n", "2147483648\n")]);
    let toolchain = stub_toolchain(
        problem.dir.path(),
        SandboxStub::new(RunStatus::Ok, "-2147483648\n", Duration::ZERO).with_log([OVERFLOW]),
    );
    let mut submission = problem.submission(&toolchain, "s");
    let ctx = RunContext::default();
    let case = &problem.cases()[0];
    let output = problem.path("1.out");

    let plain = submission
        .check_output(case, &output, None, &CheckOptions::default(), &ctx)
        .unwrap();
    assert_eq!(plain.verdict, Verdict::WA);
    assert!(plain.diagnostics.is_none());

    let options = CheckOptions {
        instrumented: true,
        ..Default::default()
    };
    let instrumented = submission
        .check_output(case, &output, None, &options, &ctx)
        .unwrap();
    assert_eq!(instrumented.verdict, Verdict::WA);
    assert!(submission.binary(true).is_some());

    let summary = submission.summary(0, true, [plain.verdict]).unwrap();
    assert_eq!(summary.len(), 1);
    assert_eq!(summary[0].id, "integer-overflow");
    assert_eq!(summary[0].line, Some(6));

    let path = submission.write_summary(&summary).unwrap();
    assert!(path.ends_with("s/output/summary.json"));
}

#[tokio::test]
async fn test_cancelling_pool_stops_sandboxed_run() {
    let problem = Arc::new(Problem::new("int main() {}", &[("1", "", "")]));
    let toolchain = stub_toolchain(
        problem.dir.path(),
        SandboxStub::new(RunStatus::Ok, "", Duration::from_secs(30)),
    );

    let pool = WorkerPool::new(1);
    let (job_tx, job_rx) = mpsc::channel(1);
    let (res_tx, mut res_rx) = mpsc::channel(1);
    handle_judging(pool.clone(), job_rx, res_tx);

    job_tx
        .send(judge_all(problem, toolchain, "s", CheckOptions::default()))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    pool.cancel();

    let result = tokio::time::timeout(Duration::from_secs(5), res_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(
        result.output,
        Err(SubmissionError::Sandbox(SandboxError::Cancelled))
    ));
}

#[test]
fn test_unconfined_build_reports_compiler_errors() {
    let Some(toolchain) = unconfined_toolchain() else {
        return;
    };

    let problem = Problem::new(include_str!("../testbins/sum.cpp"), &[]);
    let mut submission = problem.submission(&toolchain, "ok");
    assert!(submission.build(false, &RunContext::default()).unwrap());
    assert!(submission.binary(false).unwrap().is_file());

    let broken = Problem::new("int main() { return missing; }", &[]);
    let mut submission = broken.submission(&toolchain, "broken");
    assert!(!submission.build(false, &RunContext::default()).unwrap());

    let log = fs::read_to_string(submission.output_dir().join("compiler.txt")).unwrap();
    assert!(log.contains("missing"));
}

#[test]
fn test_confined_runs_get_expected_verdicts() {
    let Some(toolchain) = confined_toolchain() else {
        return;
    };

    let options = CheckOptions {
        instrumented: false,
        time_limit: Some(Duration::from_secs(1)),
        memory_limit_bytes: Some(64 * 1024 * 1024),
    };

    for (source, input, answer, expected) in [
        (include_str!("../testbins/sum.cpp"), "1 2\n", "3\n", Verdict::AC),
        (include_str!("../testbins/sum.cpp"), "1 2\n", "4\n", Verdict::WA),
        (include_str!("../testbins/segfault.cpp"), "", "", Verdict::RTE),
        (include_str!("../testbins/busy_loop.cpp"), "", "", Verdict::TLE),
        (include_str!("../testbins/memory_limit.cpp"), "", "", Verdict::MLE),
    ] {
        let problem = Problem::new(source, &[("1", input, answer)]);
        let mut submission = problem.submission(&toolchain, "s");
        let ctx = RunContext::new("integration", Default::default());

        let report = submission
            .check_output(&problem.cases()[0], &problem.path("1.out"), None, &options, &ctx)
            .unwrap();

        assert_eq!(report.verdict, expected, "{source}");
    }
}

#[test]
fn test_confined_runs_are_isolated() {
    let Some(toolchain) = confined_toolchain() else {
        return;
    };

    // Each program exits non-zero only when it escaped its confinement.
    for source in [
        include_str!("../testbins/net_isolation.cpp"),
        include_str!("../testbins/pids_limit.cpp"),
        include_str!("../testbins/read_only_fs.cpp"),
    ] {
        let problem = Problem::new(source, &[("1", "", "")]);
        let mut submission = problem.submission(&toolchain, "s");
        let ctx = RunContext::new("isolation", Default::default());

        let report = submission
            .check_output(
                &problem.cases()[0],
                &problem.path("1.out"),
                None,
                &CheckOptions {
                    time_limit: Some(Duration::from_secs(5)),
                    ..Default::default()
                },
                &ctx,
            )
            .unwrap();

        assert_eq!(report.verdict, Verdict::AC, "{source}");
    }
}

#[test]
fn test_confined_instrumented_run_explains_overflow() {
    let Some(toolchain) = confined_toolchain() else {
        return;
    };

    let problem = Problem::new(
        include_str!("../testbins/overflow.cpp"),
        &[("1", "2147483647 1\n", "2147483648\n")],
    );
    let mut submission = problem.submission(&toolchain, "s");
    let ctx = RunContext::new("sanitizers", Default::default());
    let options = CheckOptions {
        instrumented: true,
        time_limit: Some(Duration::from_secs(5)),
        ..Default::default()
    };

    let report = match submission.check_output(
        &problem.cases()[0],
        &problem.path("1.out"),
        None,
        &options,
        &ctx,
    ) {
        Err(SubmissionError::BuildFailed) => {
            eprintln!("Skipping: the compiler does not support sanitizers");
            return;
        }
        result => result.unwrap(),
    };

    assert_eq!(report.verdict, Verdict::WA);
    let diagnostics = report.diagnostics.unwrap();
    assert!(diagnostics.iter().any(|diag| diag.id == "integer-overflow"));
    assert!(submission.output_dir().join("1-sanitizers.json").is_file());
}

#[test]
fn test_custom_checks_on_real_ast() {
    let Some(toolchain) = unconfined_toolchain() else {
        return;
    };
    let Ok(Some(analyzer)) = crate::analysis::ast::AstAnalyzer::discover(
        toolchain.knowledge().clone(),
        toolchain.compiler_args().to_vec(),
    ) else {
        eprintln!("Skipping: needs clang");
        return;
    };

    let toolchain = Arc::new(
        Toolchain::new(ToolchainConfig::from_env().unwrap(), None)
            .unwrap()
            .with_ast_analyzer(Some(analyzer)),
    );
    let problem = Problem::new(
        "struct Counter { Counter() : n(0) {} int n; };\n\
         int fact(int n) { return n <= 1 ? 1 : n * fact(n - 1); }\n\
         void unused(Counter c) {}\n\
         int main() { return fact(3) == 6 ? 0 : 1; }\n",
        &[],
    );
    let submission = problem.submission(&toolchain, "s");

    let diagnostics = submission.check_custom().unwrap();
    let ids: Vec<&str> = diagnostics.iter().map(|diag| diag.id.as_str()).collect();

    assert!(ids.contains(&"unreachable-func"), "{ids:?}");
    assert!(ids.contains(&"nonpod-by-value"), "{ids:?}");
    assert!(submission.output_dir().join("custom-analysis.json").is_file());
}
