//! clang-tidy adapter: runs the linter restricted to known checks and enriches its findings.

use std::collections::HashMap;
use std::ffi::OsString;
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;

use itertools::Itertools;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::{
    analysis::AnalysisError,
    constants::CLANG_TIDY,
    core::diagnostic::Diagnostic,
    core::knowledge::KnowledgeBase,
    core::probe,
};

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TidyExport {
    #[serde(default)]
    diagnostics: Vec<TidyDiagnostic>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TidyDiagnostic {
    diagnostic_name: String,
    diagnostic_message: TidyMessage,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct TidyMessage {
    message: String,
    #[serde(default)]
    file_path: String,
    #[serde(default)]
    file_offset: u64,
}

/// Forward-only translation of byte offsets into line and column.
///
/// Offsets must be queried in non-decreasing order. Columns are byte
/// offsets within the line, not character positions.
pub struct LineCursor<R> {
    reader: R,
    line_start: u64,
    line_number: u32,
    line: Vec<u8>,
}

impl<R: BufRead> LineCursor<R> {
    pub fn new(mut reader: R) -> io::Result<Self> {
        let mut line = Vec::new();
        reader.read_until(b'\n', &mut line)?;

        Ok(Self {
            reader,
            line_start: 0,
            line_number: 1,
            line,
        })
    }

    /// Offset of the first byte of the current line.
    pub fn line_start(&self) -> u64 {
        self.line_start
    }

    /// Returns the 1-based line, 0-based byte column and the line text,
    /// or `None` when the offset lies past the end of the input.
    pub fn seek(&mut self, offset: u64) -> io::Result<Option<(u32, u32, &[u8])>> {
        while offset >= self.line_start + self.line.len() as u64 {
            if self.line.is_empty() {
                return Ok(None);
            }

            self.line_start += self.line.len() as u64;
            self.line.clear();
            self.reader.read_until(b'\n', &mut self.line)?;
            self.line_number += 1;
        }

        let column = (offset - self.line_start) as u32;
        Ok(Some((self.line_number, column, &self.line)))
    }
}

#[derive(Clone, Debug)]
pub struct ClangTidy {
    program: PathBuf,
    kb: Arc<KnowledgeBase>,
}

impl ClangTidy {
    pub fn new(program: impl Into<PathBuf>, kb: Arc<KnowledgeBase>) -> Self {
        Self {
            program: program.into(),
            kb,
        }
    }

    pub fn discover(kb: Arc<KnowledgeBase>) -> Option<Self> {
        let program = probe::find_in_path(CLANG_TIDY)?;
        debug!("Found clang-tidy at {}", program.display());
        Some(Self::new(program, kb))
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Only checks that have a curated template are enabled.
    pub fn check_filter(&self) -> String {
        self.kb.clang_tidy.keys().join(",")
    }

    pub fn command_line<S, A>(&self, sources: &[S], compiler_args: &[A], export: &Path) -> Vec<OsString>
    where
        S: AsRef<Path>,
        A: AsRef<str>,
    {
        let mut cmd: Vec<OsString> = vec![self.program.clone().into()];
        cmd.extend(sources.iter().map(|s| s.as_ref().as_os_str().to_owned()));
        cmd.push(format!("--checks={}", self.check_filter()).into());
        cmd.push("-header-filter=.*".into());

        let mut export_flag = OsString::from("--export-fixes=");
        export_flag.push(export);
        cmd.push(export_flag);

        cmd.push("--".into());
        cmd.extend(compiler_args.iter().map(|a| OsString::from(a.as_ref())));
        cmd
    }

    /// Runs the linter unconfined. Its exit status is not meaningful: it fails
    /// on compile errors yet still exports whatever it found.
    pub fn run<S, A>(&self, sources: &[S], compiler_args: &[A], export: &Path) -> Result<(), AnalysisError>
    where
        S: AsRef<Path>,
        A: AsRef<str>,
    {
        let cmd = self.command_line(sources, compiler_args, export);
        let status = Command::new(&cmd[0])
            .args(&cmd[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map_err(|source| AnalysisError::Spawn {
                tool: CLANG_TIDY.to_string(),
                source,
            })?;

        debug!("clang-tidy exited with {status}");
        Ok(())
    }

    /// Reads an `--export-fixes` file. A missing file means no findings.
    pub fn explain(&self, export: &Path, include_code: bool) -> Result<Vec<Diagnostic>, AnalysisError> {
        if !export.exists() {
            return Ok(Vec::new());
        }

        let reader = BufReader::new(File::open(export)?);
        let export: TidyExport = serde_yaml::from_reader(reader)?;
        Ok(self.explain_export(export, include_code))
    }

    fn explain_export(&self, export: TidyExport, include_code: bool) -> Vec<Diagnostic> {
        let mut cursors: HashMap<String, LineCursor<BufReader<File>>> = HashMap::new();
        let mut diags = Vec::new();

        for tidy in export.diagnostics {
            let Some(template) = self.kb.clang_tidy.get(&tidy.diagnostic_name) else {
                continue;
            };

            let message = tidy.diagnostic_message;
            let mut diag = template.instantiate(&tidy.diagnostic_name);
            diag.raw_message = Some(message.message);

            if !message.file_path.is_empty() {
                diag.file = Path::new(&message.file_path)
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned());

                match locate(&mut cursors, &message.file_path, message.file_offset) {
                    Ok(Some((line, column, code))) => {
                        diag.line = Some(line);
                        diag.column = Some(column);
                        if include_code {
                            diag.code = Some(code);
                        }
                    }
                    Ok(None) => warn!(
                        "Offset {} is past the end of {}",
                        message.file_offset, message.file_path
                    ),
                    Err(e) => warn!("Cannot read {}: {e}", message.file_path),
                }
            }

            diags.push(diag);
        }

        debug!("Explained {} clang-tidy diagnostics", diags.len());
        diags
    }
}

fn locate(
    cursors: &mut HashMap<String, LineCursor<BufReader<File>>>,
    file: &str,
    offset: u64,
) -> io::Result<Option<(u32, u32, String)>> {
    let rewind = cursors
        .get(file)
        .is_none_or(|cursor| offset < cursor.line_start());

    if rewind {
        let cursor = LineCursor::new(BufReader::new(File::open(file)?))?;
        cursors.insert(file.to_string(), cursor);
    }

    let Some(cursor) = cursors.get_mut(file) else {
        return Ok(None);
    };

    Ok(cursor.seek(offset)?.map(|(line, column, text)| {
        let code = String::from_utf8_lossy(text)
            .trim_end_matches(['\r', '\n'])
            .to_string();
        (line, column, code)
    }))
}
