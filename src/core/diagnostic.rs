use std::cmp::Reverse;
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeSet, HashSet};
use std::fmt::Write;
use std::hash::{Hash, Hasher};

use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::core::domain::Verdict;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackFrame {
    pub function: String,
    pub location: String,
}

/// Common shape of every finding, whichever tool produced it.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column: Option<u32>,
    pub short: String,
    pub severity: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub explains: BTreeSet<Verdict>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stack: Vec<StackFrame>,
    /// Source line the diagnostic points at.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl Diagnostic {
    pub fn explains_any(&self, verdicts: &BTreeSet<Verdict>) -> bool {
        !self.explains.is_disjoint(verdicts)
    }

    fn location(&self) -> Option<String> {
        let file = self.file.as_deref()?;
        Some(match (self.line, self.column) {
            (Some(line), Some(column)) => format!("{file}:{line}:{column}"),
            (Some(line), None) => format!("{file}:{line}"),
            _ => file.to_string(),
        })
    }
}

#[derive(PartialEq, Eq, Hash)]
struct DedupKey {
    id: String,
    file: Option<String>,
    line: Option<u32>,
    column: Option<u32>,
    short_hash: u64,
}

impl DedupKey {
    fn of(diag: &Diagnostic) -> Self {
        let mut hasher = DefaultHasher::new();
        diag.short.hash(&mut hasher);

        Self {
            id: diag.id.clone(),
            file: diag.file.clone(),
            line: diag.line,
            column: diag.column,
            short_hash: hasher.finish(),
        }
    }
}

/// Deduplicated collection of diagnostics ranked by relevance to the observed verdicts.
#[derive(Default)]
pub struct Summary {
    min_severity: i32,
    verdicts: BTreeSet<Verdict>,
    entries: Vec<Diagnostic>,
    seen: HashSet<DedupKey>,
}

impl Summary {
    pub fn new(min_severity: i32, verdicts: impl IntoIterator<Item = Verdict>) -> Self {
        Self {
            min_severity,
            verdicts: verdicts.into_iter().collect(),
            ..Default::default()
        }
    }

    pub fn verdicts(&self) -> &BTreeSet<Verdict> {
        &self.verdicts
    }

    pub fn observe(&mut self, verdict: Verdict) {
        self.verdicts.insert(verdict);
    }

    /// Returns whether the diagnostic was kept. The first of several
    /// equivalent diagnostics wins.
    pub fn add(&mut self, diag: Diagnostic) -> bool {
        if diag.severity < self.min_severity {
            return false;
        }

        if !self.seen.insert(DedupKey::of(&diag)) {
            return false;
        }

        self.entries.push(diag);
        true
    }

    pub fn extend(&mut self, diags: impl IntoIterator<Item = Diagnostic>) {
        for diag in diags {
            self.add(diag);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn into_diagnostics(self) -> Vec<Diagnostic> {
        let Self {
            verdicts,
            mut entries,
            ..
        } = self;

        entries.sort_by_key(|diag| Reverse((diag.explains_any(&verdicts), diag.severity)));
        entries
    }
}

/// Plain-text listing of ranked diagnostics. Explanations are printed once per id.
pub fn render_text(diagnostics: &[Diagnostic]) -> String {
    let mut explained = HashSet::new();
    let mut out = String::new();

    for diag in diagnostics {
        match diag.location() {
            Some(location) => {
                let _ = writeln!(out, "{location}: {}", diag.short);
            }
            None => {
                let _ = writeln!(out, "{}", diag.short);
            }
        }

        if !diag.stack.is_empty() {
            let frames = diag
                .stack
                .iter()
                .map(|frame| format!("    at {} ({})", frame.function, frame.location))
                .join("\n");
            let _ = writeln!(out, "{frames}");
        }

        match (&diag.extra, &diag.raw_message) {
            (Some(extra), _) => {
                if explained.insert(diag.id.as_str()) {
                    let _ = writeln!(out, "    {extra}");
                }
            }
            (None, Some(raw)) => {
                let _ = writeln!(out, "    {raw}");
            }
            (None, None) => {}
        }
    }

    out
}
