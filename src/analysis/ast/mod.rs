//! Custom checks over clang's AST: call graph, recursion and by-value copies,
//! plus the compiler warnings clang reports while producing the AST.

pub mod callgraph;
pub mod checks;
pub mod tree;
pub mod walk;

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;

use regex::Regex;
use tracing::{debug, warn};

use crate::{
    analysis::AnalysisError,
    analysis::ast::callgraph::CallGraphBuilder,
    analysis::ast::checks::CommonBugs,
    analysis::ast::tree::{Ast, DeclIndex, Location, UserFiles},
    analysis::ast::walk::{walk, Visitor},
    constants::{ANALYZER_WARNING_ARGS, CLANG_CANDIDATES},
    core::diagnostic::Diagnostic,
    core::knowledge::{DiagnosticTemplate, KnowledgeBase},
    core::probe,
};

const COMPILER_DIAGNOSTIC: &str =
    r"^(.+?):(\d+):(\d+): (warning|error|note|fatal error): (.*?)(?: \[([^\]]+)\])?$";

const UNREACHABLE_FUNC: &str = "unreachable-func";

/// Builds a diagnostic located at `loc` from a curated template.
pub fn issue(
    loc: &Location,
    name: &str,
    template: &DiagnosticTemplate,
    args: &[(&str, &str)],
) -> Diagnostic {
    let mut diag = template.instantiate_with(name, args);
    diag.file = Path::new(&loc.file)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned());
    diag.line = Some(loc.line);
    diag.column = Some(loc.column);
    diag
}

#[derive(Clone, Debug)]
pub struct AstAnalyzer {
    clang: PathBuf,
    compiler_args: Vec<String>,
    kb: Arc<KnowledgeBase>,
    diagnostic_line: Regex,
}

impl AstAnalyzer {
    pub fn new(
        clang: impl Into<PathBuf>,
        compiler_args: Vec<String>,
        kb: Arc<KnowledgeBase>,
    ) -> Result<Self, AnalysisError> {
        Ok(Self {
            clang: clang.into(),
            compiler_args,
            kb,
            diagnostic_line: Regex::new(COMPILER_DIAGNOSTIC)?,
        })
    }

    /// `Ok(None)` when no clang front end is installed.
    pub fn discover(
        kb: Arc<KnowledgeBase>,
        compiler_args: Vec<String>,
    ) -> Result<Option<Self>, AnalysisError> {
        let Some(clang) = CLANG_CANDIDATES
            .iter()
            .find_map(|candidate| probe::find_in_path(candidate))
        else {
            return Ok(None);
        };

        debug!("Found clang at {}", clang.display());
        Self::new(clang, compiler_args, kb).map(Some)
    }

    pub fn program(&self) -> &Path {
        &self.clang
    }

    pub fn version(&self) -> Option<String> {
        probe::tool_version(&self.clang)
    }

    /// Analyzes each source as its own translation unit. Only code under
    /// `user_dir` is inspected or reported.
    #[tracing::instrument(skip(self, sources, visitors))]
    pub fn analyze(
        &self,
        sources: &[PathBuf],
        user_dir: &Path,
        visitors: &mut [&mut dyn Visitor],
    ) -> Result<Vec<Diagnostic>, AnalysisError> {
        let user = UserFiles::new(user_dir.canonicalize()?);
        let mut issues = Vec::new();

        for source in sources {
            let source = source.canonicalize()?;
            let (json, stderr) = self.dump(&source)?;

            issues.extend(self.compiler_diagnostics(&stderr, &user));

            if json.is_empty() {
                warn!("clang produced no AST for {}", source.display());
                continue;
            }

            match Ast::from_json(&json) {
                Ok(ast) => issues.extend(self.analyze_unit(&ast, &user, visitors)),
                Err(e) => warn!("Skipping AST checks for {}: {e}", source.display()),
            }
        }

        debug!("AST analysis found {} issues", issues.len());
        Ok(issues)
    }

    fn dump(&self, source: &Path) -> Result<(Vec<u8>, String), AnalysisError> {
        let out = Command::new(&self.clang)
            .arg("-fsyntax-only")
            .arg("-Xclang")
            .arg("-ast-dump=json")
            .arg("-fno-color-diagnostics")
            .args(ANALYZER_WARNING_ARGS)
            .args(&self.compiler_args)
            .arg(source)
            .stdin(Stdio::null())
            .output()
            .map_err(|source| AnalysisError::Spawn {
                tool: self.clang.display().to_string(),
                source,
            })?;

        Ok((out.stdout, String::from_utf8_lossy(&out.stderr).into_owned()))
    }

    /// Runs the built-in passes and then `visitors` over one translation unit.
    pub fn analyze_unit(
        &self,
        ast: &Ast,
        user: &UserFiles,
        visitors: &mut [&mut dyn Visitor],
    ) -> Vec<Diagnostic> {
        let index = DeclIndex::build(ast);
        let roots = ast.user_roots(user);

        let mut builder = CallGraphBuilder::new(&index, user);
        walk(ast, &roots, &mut builder);
        let graph = builder.finish();
        let recursion = graph.find_recursive();

        let mut issues = Vec::new();

        if let Some(template) = self.kb.custom.get(UNREACHABLE_FUNC) {
            for func in &recursion.unreachable {
                let name = graph.names.get(func).map(String::as_str).unwrap_or_default();
                issues.push(issue(func, UNREACHABLE_FUNC, template, &[("fname", name)]));
            }
        }

        let mut bugs = CommonBugs::new(&index, &self.kb, &recursion.reachable);
        walk(ast, &roots, &mut bugs);
        issues.extend(bugs.take_diagnostics());

        for visitor in visitors.iter_mut() {
            walk(ast, &roots, &mut **visitor);
            issues.extend(visitor.take_diagnostics());
        }

        issues
    }

    /// Compiler warnings with a curated template, located in user files.
    pub fn compiler_diagnostics(&self, stderr: &str, user: &UserFiles) -> Vec<Diagnostic> {
        stderr
            .lines()
            .filter_map(|line| {
                let caps = self.diagnostic_line.captures(line)?;
                let flag = caps
                    .get(6)?
                    .as_str()
                    .split(',')
                    .filter(|option| option.starts_with("-W"))
                    .last()?;
                let template = self.kb.compiler.get(flag)?;

                let file = &caps[1];
                if !user.contains(file) {
                    return None;
                }

                let loc = Location {
                    file: file.to_string(),
                    line: caps[2].parse().ok()?,
                    column: caps[3].parse().ok()?,
                };
                let mut diag = issue(&loc, flag, template, &[]);
                diag.raw_message = Some(caps[5].to_string());
                Some(diag)
            })
            .collect()
    }
}
