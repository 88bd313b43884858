//! Producers that turn external tool output into `Diagnostic`s.
pub mod ast;
pub mod clang_tidy;
pub mod sanitizers;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("cannot run {tool}: {source}")]
    Spawn {
        tool: String,
        source: std::io::Error,
    },
    #[error("{tool} produced no usable output: {msg}")]
    ToolFailed { tool: String, msg: String },
    #[error("malformed clang-tidy export: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("malformed AST dump: {0}")]
    AstJson(#[from] serde_json::Error),
    #[error("invalid pattern: {0}")]
    Pattern(#[from] regex::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
