use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use regex::Regex;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::debug;

use crate::{
    core::diagnostic::Diagnostic,
    core::domain::Verdict,
};

pub const CLANG_TIDY_FILE: &str = "clang-tidy.json";
pub const UBSAN_FILE: &str = "ubsan-diagnostics.json";
pub const COMPILER_FILE: &str = "clang-diagnostics.json";
pub const CUSTOM_FILE: &str = "custom-diagnostics.json";

#[derive(Debug, Error)]
pub enum KnowledgeError {
    #[error("cannot read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("malformed {file}: {source}")]
    Json {
        file: String,
        source: serde_json::Error,
    },
    #[error("invalid pattern {pattern:?}: {source}")]
    Regex {
        pattern: String,
        source: regex::Error,
    },
}

/// Curated description of a known problem, turned into a `Diagnostic` when it is found.
#[derive(Clone, Debug, Default, PartialEq, Deserialize)]
pub struct DiagnosticTemplate {
    #[serde(default)]
    pub id: Option<String>,
    pub short: String,
    pub severity: i32,
    #[serde(default)]
    pub explains: BTreeSet<Verdict>,
    #[serde(default)]
    pub extra: Option<String>,
}

impl DiagnosticTemplate {
    /// The template's own id takes precedence over `fallback_id`.
    pub fn instantiate(&self, fallback_id: &str) -> Diagnostic {
        Diagnostic {
            id: self.id.clone().unwrap_or_else(|| fallback_id.to_string()),
            short: self.short.clone(),
            severity: self.severity,
            explains: self.explains.clone(),
            extra: self.extra.clone(),
            ..Default::default()
        }
    }

    /// Same as `instantiate`, filling `{name}` placeholders in the messages.
    pub fn instantiate_with(&self, fallback_id: &str, args: &[(&str, &str)]) -> Diagnostic {
        let mut diag = self.instantiate(fallback_id);
        diag.short = fill_placeholders(&diag.short, args);
        diag.extra = diag.extra.map(|extra| fill_placeholders(&extra, args));
        diag
    }
}

fn fill_placeholders(text: &str, args: &[(&str, &str)]) -> String {
    args.iter().fold(text.to_string(), |acc, (name, value)| {
        acc.replace(&format!("{{{name}}}"), value)
    })
}

#[derive(Clone, Debug)]
pub struct UbsanPattern {
    pub pattern: Regex,
    pub template: DiagnosticTemplate,
}

#[derive(Deserialize)]
struct RawUbsanPattern {
    #[serde(rename = "match")]
    pattern: String,
    info: DiagnosticTemplate,
}

/// Read-only tables mapping tool findings to curated diagnostics.
#[derive(Clone, Debug, Default)]
pub struct KnowledgeBase {
    /// Keyed by clang-tidy check name. Ordered so the check list is stable.
    pub clang_tidy: BTreeMap<String, DiagnosticTemplate>,
    pub ubsan: Vec<UbsanPattern>,
    /// Keyed by warning flag, e.g. `-Wuninitialized`.
    pub compiler: HashMap<String, DiagnosticTemplate>,
    pub custom: HashMap<String, DiagnosticTemplate>,
}

impl KnowledgeBase {
    pub fn builtin() -> Result<Self, KnowledgeError> {
        Self::from_sources(
            include_str!("../../data/clang-tidy.json"),
            include_str!("../../data/ubsan-diagnostics.json"),
            include_str!("../../data/clang-diagnostics.json"),
            include_str!("../../data/custom-diagnostics.json"),
        )
    }

    pub fn from_dir(dir: &Path) -> Result<Self, KnowledgeError> {
        let read = |file: &str| {
            let path = dir.join(file);
            fs::read_to_string(&path).map_err(|source| KnowledgeError::Io { path, source })
        };

        debug!("Loading knowledge base from {}", dir.display());
        Self::from_sources(
            &read(CLANG_TIDY_FILE)?,
            &read(UBSAN_FILE)?,
            &read(COMPILER_FILE)?,
            &read(CUSTOM_FILE)?,
        )
    }

    pub fn from_sources(
        clang_tidy: &str,
        ubsan: &str,
        compiler: &str,
        custom: &str,
    ) -> Result<Self, KnowledgeError> {
        let ubsan = parse::<Vec<RawUbsanPattern>>(UBSAN_FILE, ubsan)?
            .into_iter()
            .map(|raw| {
                // Messages are matched from their start only.
                let anchored = format!("^(?:{})", raw.pattern);
                let pattern = Regex::new(&anchored).map_err(|source| KnowledgeError::Regex {
                    pattern: raw.pattern,
                    source,
                })?;
                Ok(UbsanPattern {
                    pattern,
                    template: raw.info,
                })
            })
            .collect::<Result<_, KnowledgeError>>()?;

        Ok(Self {
            clang_tidy: parse(CLANG_TIDY_FILE, clang_tidy)?,
            ubsan,
            compiler: parse(COMPILER_FILE, compiler)?,
            custom: parse(CUSTOM_FILE, custom)?,
        })
    }

    /// First undefined-behavior pattern matching the runtime error message.
    pub fn match_ubsan(&self, message: &str) -> Option<&DiagnosticTemplate> {
        self.ubsan
            .iter()
            .find(|known| known.pattern.is_match(message))
            .map(|known| &known.template)
    }
}

fn parse<T: DeserializeOwned>(file: &str, text: &str) -> Result<T, KnowledgeError> {
    serde_json::from_str(text).map_err(|source| KnowledgeError::Json {
        file: file.to_string(),
        source,
    })
}
