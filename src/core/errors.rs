use thiserror::Error;

use crate::{
    analysis::AnalysisError,
    core::domain::Capability,
    core::traits::sandbox::SandboxError,
};

#[derive(Debug, Error)]
pub enum SubmissionError {
    /// The capability was not discovered at startup. Callers degrade instead of aborting.
    #[error("{0} is not available")]
    Unavailable(Capability),
    #[error("build failed")]
    BuildFailed,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Sandbox(#[from] SandboxError),
    #[error(transparent)]
    Analysis(#[from] AnalysisError),
    #[error("malformed diagnostics file: {0}")]
    Json(#[from] serde_json::Error),
}

impl SubmissionError {
    /// Whether the error only means a feature is missing or the code does not build.
    pub fn is_degraded(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::BuildFailed)
    }
}
