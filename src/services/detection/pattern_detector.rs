// Pattern Detector
// Deterministic regex rules, one per catalog category

use async_trait::async_trait;
use std::sync::Arc;

use crate::models::{Chunk, DetectorKind, RawFinding, Span};
use crate::services::detection::category_catalog::CategorySet;
use crate::services::detection::error::DetectorError;
use crate::services::detection::{run_blocking, Detector};

/// Emits one raw finding per non-overlapping case-insensitive match.
///
/// Findings carry no context or confidence; the orchestrator fills both from the match span.
#[derive(Debug, Clone)]
pub struct PatternDetector {
    categories: Arc<CategorySet>,
}

impl PatternDetector {
    pub fn new(categories: Arc<CategorySet>) -> Self {
        Self { categories }
    }

    /// Infallible scan. Zero matches is a valid result.
    pub fn scan(&self, chunk: &Chunk) -> Vec<RawFinding> {
        let mut findings = Vec::new();
        for category in self.categories.iter() {
            for m in category.regex().find_iter(&chunk.text) {
                if m.start() == m.end() {
                    continue;
                }
                findings.push(RawFinding {
                    category: category.id.clone(),
                    title: category.title.clone(),
                    severity: category.default_severity,
                    confidence: None,
                    span: Span::new(m.start(), m.end()),
                    context: None,
                    description: category.description.clone(),
                    recommendation: category.recommendation.clone(),
                    detector: DetectorKind::Pattern,
                });
            }
        }
        findings
    }
}

#[async_trait]
impl Detector for PatternDetector {
    fn kind(&self) -> DetectorKind {
        DetectorKind::Pattern
    }

    async fn detect(&self, chunk: &Chunk) -> Result<Vec<RawFinding>, DetectorError> {
        let detector = self.clone();
        let chunk = chunk.clone();
        run_blocking(move || detector.scan(&chunk)).await
    }
}
