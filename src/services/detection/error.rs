// Detection error taxonomy

use thiserror::Error;

use crate::services::providers::ProviderError;

/// Failures that cross the `analyze` boundary.
#[derive(Error, Debug)]
pub enum AnalysisError {
    #[error("Invalid configuration: {0}")]
    Configuration(String),
    #[error("Document is too short to analyze (minimum {min_chars} characters)")]
    EmptyInput { min_chars: usize },
    /// The pattern path itself could not run. Not produced by any backend failure.
    #[error("Analysis failed: {0}")]
    Internal(String),
}

/// Per-chunk detector failures. Absorbed by the orchestrator and answered with pattern output.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DetectorError {
    #[error("Detector unavailable: {0}")]
    Unavailable(String),
    #[error("Malformed detector output: {0}")]
    MalformedOutput(String),
    #[error("Detector timed out after {secs}s")]
    Timeout { secs: u64 },
}

impl From<ProviderError> for DetectorError {
    fn from(err: ProviderError) -> Self {
        DetectorError::Unavailable(err.to_string())
    }
}

impl From<serde_json::Error> for DetectorError {
    fn from(err: serde_json::Error) -> Self {
        DetectorError::MalformedOutput(err.to_string())
    }
}
