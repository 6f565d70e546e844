// ClauseGuard Data Models
// Documents, chunks, findings and analysis results shared across the pipeline

use serde::{Deserialize, Serialize};
use std::fmt;

// ============ Document & Chunk ============

/// Plain-text input for one analysis request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub text: String,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub declared_type: Option<String>,
}

impl Document {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            source: None,
            declared_type: None,
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_declared_type(mut self, declared_type: impl Into<String>) -> Self {
        self.declared_type = Some(declared_type.into());
        self
    }
}

/// Byte range, end-exclusive. Always on UTF-8 char boundaries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Move a chunk-local span into document coordinates.
    pub fn shifted(self, offset: usize) -> Self {
        Self {
            start: self.start + offset,
            end: self.end + offset,
        }
    }

    pub fn overlap_len(&self, other: &Span) -> usize {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        end.saturating_sub(start)
    }

    /// Overlap measured against the shorter of the two spans.
    pub fn overlap_fraction(&self, other: &Span) -> f64 {
        let overlap = self.overlap_len(other);
        if overlap == 0 {
            return 0.0;
        }
        let shorter = self.len().min(other.len()).max(1);
        overlap as f64 / shorter as f64
    }
}

/// Contiguous slice of a document handed to a detector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub index: usize,
    /// UTF-8 byte offset into the original document.
    pub start: usize,
    /// UTF-8 byte offset (end-exclusive) into the original document.
    pub end: usize,
    pub text: String,
}

// ============ Severity & Risk ============

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
        }
    }

    pub fn parse(val: &str) -> Option<Self> {
        match val.trim().to_ascii_lowercase().as_str() {
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            _ => None,
        }
    }

    /// One step up; `High` stays `High`.
    pub fn escalate(self) -> Self {
        match self {
            Severity::Low => Severity::Medium,
            Severity::Medium | Severity::High => Severity::High,
        }
    }

    /// One step down; `Low` stays `Low`.
    pub fn deescalate(self) -> Self {
        match self {
            Severity::High => Severity::Medium,
            Severity::Medium | Severity::Low => Severity::Low,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============ Detectors ============

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectorKind {
    #[default]
    Pattern,
    Classifier,
    StructuredExtraction,
}

impl DetectorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            DetectorKind::Pattern => "pattern",
            DetectorKind::Classifier => "classifier",
            DetectorKind::StructuredExtraction => "structured_extraction",
        }
    }

    pub fn parse(val: &str) -> Option<Self> {
        match val.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "pattern" | "regex" => Some(Self::Pattern),
            "classifier" | "ml" => Some(Self::Classifier),
            "structured_extraction" | "llm" | "extraction" => Some(Self::StructuredExtraction),
            _ => None,
        }
    }
}

impl fmt::Display for DetectorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============ Findings ============

/// Detector output before merge. `span` is relative to the chunk text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawFinding {
    pub category: String,
    pub title: String,
    pub severity: Severity,
    /// `None` when the detector leaves scoring to the pipeline.
    pub confidence: Option<f64>,
    pub span: Span,
    /// `None` when the detector leaves context extraction to the pipeline.
    pub context: Option<String>,
    pub description: String,
    pub recommendation: String,
    pub detector: DetectorKind,
}

/// Merged, user-facing finding. `span` is in document coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub category: String,
    pub severity: Severity,
    #[serde(rename = "text")]
    pub context: String,
    pub description: String,
    pub recommendation: String,
    pub confidence: f64,
    pub title: String,
    pub span: Span,
    pub detector: DetectorKind,
}

// ============ Analysis Result ============

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingMetadata {
    pub request_id: String,
    pub processing_time_ms: u64,
    pub primary_detector: DetectorKind,
    pub detector_used: String,
    pub fallback_used: bool,
    pub fallback_chunks: usize,
    pub total_chunks: usize,
    pub raw_finding_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub risk_level: RiskLevel,
    pub word_count: usize,
    /// Descending severity, then descending confidence.
    pub red_flags: Vec<Finding>,
    pub analysis_timestamp: String,
    pub detector_used: String,
    pub metadata: ProcessingMetadata,
}

// ============ Analysis Options ============

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkingOptions {
    #[serde(default = "default_chunk_size")]
    pub max_chunk_size: usize,
    #[serde(default = "default_overlap")]
    pub overlap_size: usize,
}

impl Default for ChunkingOptions {
    fn default() -> Self {
        Self {
            max_chunk_size: default_chunk_size(),
            overlap_size: default_overlap(),
        }
    }
}

/// How duplicate findings are grouped before the highest-confidence member is kept.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum MergeGranularity {
    /// Coarse: one finding per (category, severity).
    #[default]
    CategorySeverity,
    /// Findings of one category collapse when their document spans overlap by more than
    /// `min_overlap` of the shorter span.
    SpanOverlap {
        #[serde(default)]
        min_overlap: f64,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractionOptions {
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,
    #[serde(default = "default_max_prompt_chars")]
    pub max_prompt_chars: usize,
    /// Linear backoff unit between attempts (`unit * attempt`).
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

impl Default for ExtractionOptions {
    fn default() -> Self {
        Self {
            max_in_flight: default_max_in_flight(),
            timeout_secs: default_timeout_secs(),
            max_attempts: default_max_attempts(),
            max_prompt_chars: default_max_prompt_chars(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

/// Serializable form of a risk category; compiled into a `CategorySet`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoryDefinition {
    pub id: String,
    pub title: String,
    pub pattern: String,
    pub default_severity: Severity,
    pub description: String,
    pub recommendation: String,
    #[serde(default)]
    pub aliases: Vec<String>,
}

// ============ Default Value Functions ============

fn default_chunk_size() -> usize { 1000 }
fn default_overlap() -> usize { 100 }
fn default_max_in_flight() -> usize { 4 }
fn default_timeout_secs() -> u64 { 60 }
fn default_max_attempts() -> usize { 3 }
fn default_max_prompt_chars() -> usize { 15000 }
fn default_retry_backoff_ms() -> u64 { 400 }
