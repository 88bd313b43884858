//! Parser for AddressSanitizer and UndefinedBehaviorSanitizer reports.

use std::path::Path;
use std::sync::Arc;

use regex::Regex;
use tracing::debug;

use crate::{
    analysis::AnalysisError,
    core::diagnostic::{Diagnostic, StackFrame},
    core::domain::Verdict,
    core::knowledge::KnowledgeBase,
};

const UBSAN_ERROR: &str = r"^([^:]+):(\d+):(\d+): runtime error: (.*)";
const ASAN_ERROR: &str = r"^==\d+==ERROR: AddressSanitizer: SEGV on unknown address";
/// Frames point into a module or a source position. Newer runtimes append the module's build id.
const ASAN_FRAME: &str = concat!(
    r"^\s*#\d+ 0x[0-9a-fA-F]+ in (.+?) ",
    r"(?:\(([^+)]+)\+0x[0-9a-fA-F]+\)|(\S+:\d+(?::\d+)?))",
    r"(?:\s+\(BuildId: [0-9a-fA-F]+\))?\s*$",
);
const ASAN_END: &str = "AddressSanitizer can not provide";

const OUT_OF_BOUNDS_ID: &str = "out-of-bounds";
const OUT_OF_BOUNDS_SEVERITY: i32 = 7;
const OUT_OF_BOUNDS_READ: &str = "attempt to read memory out of range";
const OUT_OF_BOUNDS_WRITE: &str = "attempt to write memory out of range";

/// Whether an AddressSanitizer report line says the faulting access was a write.
pub fn is_write_access(line: &str) -> bool {
    line.contains("caused by a WRITE memory access")
}

enum State {
    Normal,
    /// Inside an AddressSanitizer report, collecting the open diagnostic.
    Asan(Diagnostic),
}

#[derive(Clone, Debug)]
pub struct SanitizerParser {
    kb: Arc<KnowledgeBase>,
    ubsan_error: Regex,
    asan_error: Regex,
    asan_frame: Regex,
}

impl SanitizerParser {
    pub fn new(kb: Arc<KnowledgeBase>) -> Result<Self, AnalysisError> {
        Ok(Self {
            kb,
            ubsan_error: Regex::new(UBSAN_ERROR)?,
            asan_error: Regex::new(ASAN_ERROR)?,
            asan_frame: Regex::new(ASAN_FRAME)?,
        })
    }

    /// Unrecognized lines are skipped. A report that is never terminated is dropped.
    pub fn parse<I, S>(&self, lines: I) -> Vec<Diagnostic>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut diags = Vec::new();
        let mut state = State::Normal;

        for line in lines {
            let line = line.as_ref();

            state = match state {
                State::Normal => {
                    if let Some(diag) = self.parse_ubsan(line) {
                        diags.push(diag);
                    }

                    if self.asan_error.is_match(line) {
                        State::Asan(Diagnostic {
                            id: OUT_OF_BOUNDS_ID.to_string(),
                            short: OUT_OF_BOUNDS_READ.to_string(),
                            severity: OUT_OF_BOUNDS_SEVERITY,
                            explains: [Verdict::RTE, Verdict::WA].into(),
                            ..Default::default()
                        })
                    } else {
                        State::Normal
                    }
                }
                State::Asan(mut current) => {
                    if is_write_access(line) {
                        current.short = OUT_OF_BOUNDS_WRITE.to_string();
                        State::Asan(current)
                    } else if line.starts_with(ASAN_END) {
                        diags.push(current);
                        State::Normal
                    } else {
                        if let Some(frame) = self.parse_frame(line) {
                            current.stack.push(frame);
                        }
                        State::Asan(current)
                    }
                }
            };
        }

        debug!("Parsed {} sanitizer diagnostics", diags.len());
        diags
    }

    fn parse_ubsan(&self, line: &str) -> Option<Diagnostic> {
        let caps = self.ubsan_error.captures(line)?;
        let message = &caps[4];
        let template = self.kb.match_ubsan(message)?;

        let mut diag = template.instantiate("runtime-error");
        diag.file = Some(basename(&caps[1]));
        diag.line = caps[2].parse().ok();
        diag.column = caps[3].parse().ok();
        diag.raw_message = Some(message.to_string());
        Some(diag)
    }

    fn parse_frame(&self, line: &str) -> Option<StackFrame> {
        let caps = self.asan_frame.captures(line)?;
        let location = caps.get(2).or_else(|| caps.get(3))?;

        Some(StackFrame {
            function: caps[1].to_string(),
            location: location.as_str().to_string(),
        })
    }
}

fn basename(path: &str) -> String {
    Path::new(path)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string())
}
