// Classifier Detector
// Multi-label probability backend behind a threshold

use async_trait::async_trait;
use regex::{Regex, RegexBuilder};
use std::sync::Arc;
use tracing::debug;

use crate::models::{Chunk, DetectorKind, RawFinding, Span};
use crate::services::detection::category_catalog::{CategoryProfile, CategorySet};
use crate::services::detection::error::DetectorError;
use crate::services::detection::scoring::adjust_severity;
use crate::services::detection::{run_blocking, Detector};
use crate::services::text_processor::{extract_context, prefix_chars};

const FALLBACK_CONTEXT_CHARS: usize = 300;

/// Anything that turns chunk text into one independent probability per label.
///
/// Model loading, device placement and weights live behind this trait.
pub trait ClassifierBackend: Send + Sync {
    /// Labels in probability-vector order. May be catalog ids, aliases or unknown names.
    fn labels(&self) -> &[String];

    fn score(&self, text: &str) -> Result<Vec<f64>, DetectorError>;

    fn model_version(&self) -> Option<String> {
        None
    }
}

/// Catalog facts and word regexes for one backend label, resolved once.
#[derive(Debug)]
struct LabelTarget {
    profile: CategoryProfile,
    terms: Vec<Regex>,
}

impl LabelTarget {
    fn new(label: &str, categories: &CategorySet) -> Self {
        let profile = categories.profile(label);
        let terms = profile
            .id
            .split('_')
            .filter(|t| !t.is_empty())
            .filter_map(|term| {
                RegexBuilder::new(&format!(r"\b{}\b", regex::escape(term)))
                    .case_insensitive(true)
                    .build()
                    .ok()
            })
            .collect();
        Self { profile, terms }
    }
}

#[derive(Clone)]
pub struct ClassifierDetector {
    backend: Arc<dyn ClassifierBackend>,
    categories: Arc<CategorySet>,
    targets: Arc<Vec<LabelTarget>>,
    threshold: f64,
    context_radius: usize,
}

impl ClassifierDetector {
    pub fn new(
        backend: Arc<dyn ClassifierBackend>,
        categories: Arc<CategorySet>,
        threshold: f64,
        context_radius: usize,
    ) -> Self {
        let targets = backend
            .labels()
            .iter()
            .map(|label| LabelTarget::new(label, &categories))
            .collect();
        Self {
            backend,
            categories,
            targets: Arc::new(targets),
            threshold,
            context_radius,
        }
    }

    pub fn model_version(&self) -> Option<String> {
        self.backend.model_version()
    }

    /// Picks a span for a label: the category rule, then any word of the label, then the
    /// head of the chunk.
    fn locate(&self, text: &str, label: &str, target: &LabelTarget) -> (Span, String) {
        let rule = self.categories.resolve(label).map(|c| c.regex());
        for re in rule.into_iter().chain(target.terms.iter()) {
            if let Some(m) = re.find(text) {
                let span = Span::new(m.start(), m.end());
                return (span, extract_context(text, span, self.context_radius));
            }
        }

        let head = prefix_chars(text, FALLBACK_CONTEXT_CHARS);
        (Span::new(0, head.len()), format!("{}...", head))
    }

    /// Scores one chunk synchronously. Callers on an async runtime go through `detect`.
    pub fn classify(&self, chunk: &Chunk) -> Result<Vec<RawFinding>, DetectorError> {
        let labels = self.backend.labels();
        let probabilities = self.backend.score(&chunk.text)?;

        if probabilities.len() != labels.len() || labels.len() != self.targets.len() {
            return Err(DetectorError::MalformedOutput(format!(
                "expected {} probabilities, got {}",
                self.targets.len(),
                probabilities.len()
            )));
        }

        let mut findings = Vec::new();
        for ((label, target), &p) in labels.iter().zip(self.targets.iter()).zip(&probabilities) {
            if !p.is_finite() || !(0.0..=1.0).contains(&p) {
                return Err(DetectorError::MalformedOutput(format!(
                    "probability {} for '{}' is outside [0, 1]",
                    p, label
                )));
            }
            if p < self.threshold {
                continue;
            }

            let profile = &target.profile;
            let (span, context) = self.locate(&chunk.text, label, target);
            findings.push(RawFinding {
                severity: adjust_severity(profile.default_severity, p),
                confidence: Some(p),
                span,
                context: Some(context),
                detector: DetectorKind::Classifier,
                category: profile.id.clone(),
                title: profile.title.clone(),
                description: profile.description.clone(),
                recommendation: profile.recommendation.clone(),
            });
        }

        debug!(
            "[CLASSIFIER] chunk={} labels={} flagged={}",
            chunk.index,
            labels.len(),
            findings.len()
        );
        Ok(findings)
    }
}

#[async_trait]
impl Detector for ClassifierDetector {
    fn kind(&self) -> DetectorKind {
        DetectorKind::Classifier
    }

    async fn detect(&self, chunk: &Chunk) -> Result<Vec<RawFinding>, DetectorError> {
        let detector = self.clone();
        let chunk = chunk.clone();
        run_blocking(move || detector.classify(&chunk)).await?
    }
}
