// Detection Module
// Clause risk detection organized into specialized submodules:
// - category_catalog: Compiled risk categories, aliases and unknown-label profiles
// - pattern_detector: Deterministic regex detector, also the universal fallback
// - classifier: Probability-threshold multi-label detector over a pluggable backend
// - llm_analyzer: Structured extraction through an external reasoning service
// - scoring: Match confidence heuristic and severity adjustment
// - merge: Cross-chunk deduplication
// - aggregation: Overall risk level
// - orchestrator: Chunk -> detect -> merge -> aggregate pipeline

pub mod aggregation;
pub mod category_catalog;
pub mod classifier;
pub mod error;
pub mod llm_analyzer;
pub mod merge;
pub mod orchestrator;
pub mod pattern_detector;
pub mod scoring;

use async_trait::async_trait;

use crate::models::{Chunk, DetectorKind, RawFinding};

/// Detector capability shared by every variant. Implementations never mutate the chunk and
/// may run concurrently on disjoint chunks.
#[async_trait]
pub trait Detector: Send + Sync {
    fn kind(&self) -> DetectorKind;

    async fn detect(&self, chunk: &Chunk) -> Result<Vec<RawFinding>, error::DetectorError>;
}

/// Runs CPU-bound detection on the blocking pool. A panic resumes in the awaiting task.
pub(crate) async fn run_blocking<T, F>(work: F) -> Result<T, error::DetectorError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(work).await {
        Ok(value) => Ok(value),
        Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
        Err(e) => Err(error::DetectorError::Unavailable(format!(
            "detector task cancelled: {}",
            e
        ))),
    }
}

// Re-export commonly used items
pub use aggregation::{aggregate_risk, risk_from_counts, SeverityCounts};
pub use category_catalog::{
    builtin_definitions, normalize_label, Category, CategoryProfile, CategorySet,
};
pub use classifier::{ClassifierBackend, ClassifierDetector};
pub use error::{AnalysisError, DetectorError};
pub use llm_analyzer::{
    detect_document_type, ExtractionBackend, ProviderBackend, StructuredExtractionDetector,
};
pub use merge::merge_findings;
pub use orchestrator::{analyze, AnalysisConfig, Analyzer, DetectorStatus};
pub use pattern_detector::PatternDetector;
pub use scoring::{adjust_severity, clamp_confidence, score_match};
