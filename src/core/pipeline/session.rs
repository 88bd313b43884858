use std::path::PathBuf;

use crate::{
    constants::COMPILER_OUTPUT_FILE,
    core::diagnostic::Diagnostic,
    core::domain::{CheckOptions, RunContext, TestCase, Verdict},
    core::errors::SubmissionError,
    core::submission::Submission,
};

/// What one judging session runs and how its summary is filtered.
#[derive(Clone, Debug, Default)]
pub struct SessionSettings {
    pub tests: PathBuf,
    pub check: CheckOptions,
    /// Re-run WA and RTE cases with sanitizers.
    pub instrument_failures: bool,
    pub min_severity: i32,
    pub must_explain: bool,
}

#[derive(Debug)]
pub struct SessionReport {
    pub built: bool,
    /// Verdicts of the cases that ran, in test case order.
    pub verdicts: Vec<(String, Verdict)>,
    pub diagnostics: Vec<Diagnostic>,
    pub summary: PathBuf,
}

impl SessionReport {
    pub fn accepted(&self) -> bool {
        self.built && self.verdicts.iter().all(|(_, verdict)| *verdict == Verdict::AC)
    }
}

/// Builds the submission, runs its test cases, runs both analyzers and
/// writes the summary.
///
/// Missing capabilities and a failed build only skip the steps that need
/// them. The summary is always written.
#[tracing::instrument(skip_all, fields(source = %submission.source_dir().display(), run_id = ?ctx.run_id))]
pub fn judge_submission(
    submission: &mut Submission,
    settings: &SessionSettings,
    ctx: &RunContext,
) -> Result<SessionReport, SubmissionError> {
    let built = submission.build(false, ctx)?;
    let mut verdicts = Vec::new();

    if built {
        for case in TestCase::discover(&settings.tests)? {
            match run_case(submission, &case, settings, ctx) {
                Ok(verdict) => verdicts.push((case.id, verdict)),
                Err(e) if e.is_degraded() => {
                    tracing::warn!("Not running test cases: {e}");
                    break;
                }
                Err(e) => return Err(e),
            }
        }
    } else {
        tracing::warn!(
            "Build failed, see {}",
            submission.output_dir().join(COMPILER_OUTPUT_FILE).display()
        );
    }

    degrade(submission.check_static())?;
    degrade(submission.check_custom())?;

    let diagnostics = submission.summary(
        settings.min_severity,
        settings.must_explain,
        verdicts.iter().map(|(_, verdict)| *verdict),
    )?;
    let summary = submission.write_summary(&diagnostics)?;

    Ok(SessionReport {
        built,
        verdicts,
        diagnostics,
        summary,
    })
}

fn run_case(
    submission: &mut Submission,
    case: &TestCase,
    settings: &SessionSettings,
    ctx: &RunContext,
) -> Result<Verdict, SubmissionError> {
    let output = submission.output_dir().join(format!("{}.out", case.id));
    let verdict = submission
        .check_output(case, &output, None, &settings.check, ctx)?
        .verdict;

    if settings.instrument_failures && matches!(verdict, Verdict::WA | Verdict::RTE) {
        let instrumented = CheckOptions {
            instrumented: true,
            ..settings.check.clone()
        };
        let output = submission.output_dir().join(format!("{}.instr.out", case.id));
        match submission.check_output(case, &output, None, &instrumented, ctx) {
            Ok(report) => tracing::debug!(
                "Instrumented re-run of {}: {} with {} diagnostics",
                case.id,
                report.verdict,
                report.diagnostics.map_or(0, |diags| diags.len())
            ),
            Err(e) if e.is_degraded() => {
                tracing::warn!("No instrumented re-run of {}: {e}", case.id)
            }
            Err(e) => return Err(e),
        }
    }

    Ok(verdict)
}

/// Missing analyzers only cost diagnostics.
fn degrade(result: Result<Vec<Diagnostic>, SubmissionError>) -> Result<(), SubmissionError> {
    match result {
        Ok(_) => Ok(()),
        Err(e) if e.is_degraded() => {
            tracing::warn!("Skipping analysis: {e}");
            Ok(())
        }
        Err(e) => Err(e),
    }
}
