use std::panic;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use itertools::Itertools;
use tokio::sync::mpsc;
use tokio::task;
use tracing_subscriber::EnvFilter;

use codegavel::core::{
    diagnostic::render_text,
    domain::{CheckOptions, RunContext},
    errors::SubmissionError,
    pipeline::judging::{JudgeJob, WorkerPool, handle_judging},
    pipeline::session::{SessionReport, SessionSettings, judge_submission},
    submission::SubmissionOptions,
    toolchain::{Toolchain, ToolchainConfig},
};

const BOLD: &str = "\x1b[1m";
const GREEN: &str = "\x1b[32m";
const RESET: &str = "\x1b[0m";

#[derive(Parser, Debug)]
#[command(name = "codegavel")]
#[command(about = "Judge and explain C/C++ submissions.", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand, Debug)]
enum Command {
    /// Show which tools were found and their versions.
    Info,
    /// Build a submission, run its test cases and explain the failures.
    Judge(JudgeArgs),
}

#[derive(clap::Args, Debug)]
struct JudgeArgs {
    /// Directory holding the submission's sources.
    #[arg(value_name = "SOURCE_DIR")]
    source_dir: PathBuf,

    /// Directory with `<name>.in` and `<name>.ans` (or `<name>.out`) pairs.
    #[arg(long, value_name = "DIR")]
    tests: PathBuf,

    #[arg(long, value_name = "SECS")]
    time_limit: Option<f64>,

    #[arg(long, value_name = "MB")]
    memory_limit: Option<u64>,

    /// Re-run WA and RTE cases with sanitizers.
    #[arg(long)]
    instrument_failures: bool,

    #[arg(long, value_name = "N", default_value_t = 0)]
    min_severity: i32,

    /// Keep only diagnostics that explain an observed verdict.
    #[arg(long)]
    must_explain: bool,

    /// Where diagnostics go. A timestamped directory is created when unset.
    #[arg(long, value_name = "DIR")]
    output_dir: Option<PathBuf>,
}

#[tokio::main]
#[tracing::instrument]
async fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    set_panic_hook();

    let cli = Cli::parse();
    let config = ToolchainConfig::from_env()?;
    let toolchain = Arc::new(task::spawn_blocking(move || Toolchain::discover(config)).await??);

    match cli.command {
        Command::Info => {
            let rows = task::spawn_blocking(move || toolchain.info()).await?;
            print_info(&rows);
            Ok(ExitCode::SUCCESS)
        }
        Command::Judge(args) => {
            let report = judge_in_pool(toolchain, args).await?;
            print_report(&report);

            Ok(if report.accepted() {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(1)
            })
        }
    }
}

/// Runs the whole judging session as one job so Ctrl-C can stop the
/// in-flight sandboxed run and release its unit.
async fn judge_in_pool(
    toolchain: Arc<Toolchain>,
    args: JudgeArgs,
) -> Result<SessionReport, Box<dyn std::error::Error>> {
    let pool = WorkerPool::new(1);
    let (job_tx, job_rx) = mpsc::channel(1);
    let (res_tx, mut res_rx) = mpsc::channel(1);
    let handle = handle_judging(pool.clone(), job_rx, res_tx);

    job_tx
        .send(JudgeJob::new(move |ctx| judge(&toolchain, &args, ctx)))
        .await?;
    drop(job_tx);

    let result = tokio::select! {
        result = res_rx.recv() => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted, stopping the current run");
            pool.cancel();
            res_rx.recv().await
        }
    };
    handle.await?;

    match result {
        Some(result) => Ok(result.output?),
        None => Err("judging job did not finish".into()),
    }
}

fn judge(
    toolchain: &Arc<Toolchain>,
    args: &JudgeArgs,
    ctx: &RunContext,
) -> Result<SessionReport, SubmissionError> {
    let mut submission = toolchain.new_submission(
        &args.source_dir,
        SubmissionOptions {
            output_dir: args.output_dir.clone(),
            ..Default::default()
        },
    )?;

    let settings = SessionSettings {
        tests: args.tests.clone(),
        check: CheckOptions {
            instrumented: false,
            time_limit: args.time_limit.map(Duration::from_secs_f64),
            memory_limit_bytes: args.memory_limit.map(|mb| mb * 1_000_000),
        },
        instrument_failures: args.instrument_failures,
        min_severity: args.min_severity,
        must_explain: args.must_explain,
    };

    judge_submission(&mut submission, &settings, ctx)
}

fn print_info(rows: &[(&'static str, Option<String>)]) {
    let width = rows.iter().map(|(name, _)| name.len()).max().unwrap_or(0);
    for (name, version) in rows {
        let status = match version {
            Some(version) => format!("{GREEN}yes{RESET} ({version})"),
            None => "no".to_string(),
        };
        println!("{BOLD}{name:<width$}{RESET}  {status}");
    }
}

fn print_report(report: &SessionReport) {
    if report.built {
        let verdicts = report
            .verdicts
            .iter()
            .map(|(id, verdict)| format!("{id}: {verdict}"))
            .join("\n");
        println!("{verdicts}");
    } else {
        println!("Build failed");
    }

    if !report.diagnostics.is_empty() {
        println!();
        print!("{}", render_text(&report.diagnostics));
    }
    println!();
    println!("Summary written to {}", report.summary.display());
}

fn set_panic_hook() {
    panic::set_hook(Box::new(|panic_info| {
        tracing::error!(
            message = "panic occurred",
            panic = %panic_info
        );
    }));
}
