// ClauseGuard Core Services

pub mod text_processor;
pub mod config_store;
pub mod providers;
pub mod detection;

pub use text_processor::*;
pub use config_store::*;
pub use providers::*;

// Re-export detection pipeline entry points
pub use detection::{
    aggregate_risk,
    analyze,
    detect_document_type,
    merge_findings,
    AnalysisConfig,
    AnalysisError,
    Analyzer,
    CategorySet,
    ClassifierBackend,
    Detector,
    DetectorError,
    DetectorStatus,
    ExtractionBackend,
    PatternDetector,
    ProviderBackend,
};
