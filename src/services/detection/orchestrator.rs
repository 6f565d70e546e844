// Analysis Orchestrator
// validate -> chunk -> detect per chunk (with pattern fallback) -> finalize -> merge -> aggregate

use rayon::prelude::*;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::models::{
    AnalysisResult, Chunk, ChunkingOptions, DetectorKind, Document, ExtractionOptions, Finding,
    MergeGranularity, ProcessingMetadata, RawFinding, Span,
};
use crate::services::detection::aggregation::aggregate_risk;
use crate::services::detection::category_catalog::CategorySet;
use crate::services::detection::classifier::{ClassifierBackend, ClassifierDetector};
use crate::services::detection::error::AnalysisError;
use crate::services::detection::llm_analyzer::{
    detect_document_type, ExtractionBackend, StructuredExtractionDetector, DEFAULT_DOCUMENT_TYPE,
};
use crate::services::detection::merge::merge_findings;
use crate::services::detection::pattern_detector::PatternDetector;
use crate::services::detection::scoring::{clamp_confidence, score_match};
use crate::services::detection::Detector;
use crate::services::text_processor::{extract_context, word_count, Chunker};

const PATTERN_MODEL_VERSION: &str = "pattern-matching";
const PATTERN_FALLBACK_MODEL_VERSION: &str = "pattern-matching-fallback";
const DEFAULT_LOCAL_SLOTS: usize = 4;

/// Runtime analysis configuration. Validated once, when the `Analyzer` is built.
#[derive(Debug, Clone)]
pub struct AnalysisConfig {
    pub chunking: ChunkingOptions,
    pub confidence_threshold: f64,
    pub detector: DetectorKind,
    pub merge: MergeGranularity,
    pub context_radius: usize,
    pub min_document_chars: usize,
    pub categories: Arc<CategorySet>,
    pub extraction: ExtractionOptions,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            chunking: ChunkingOptions::default(),
            confidence_threshold: 0.7,
            detector: DetectorKind::Pattern,
            merge: MergeGranularity::default(),
            context_radius: 90,
            min_document_chars: 10,
            categories: CategorySet::builtin(),
            extraction: ExtractionOptions::default(),
        }
    }
}

impl AnalysisConfig {
    pub fn validate(&self) -> Result<(), AnalysisError> {
        Chunker::new(self.chunking.max_chunk_size, self.chunking.overlap_size)?;

        let invalid = |msg: String| Err(AnalysisError::Configuration(msg));
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return invalid(format!(
                "confidence_threshold {} must be within [0, 1]",
                self.confidence_threshold
            ));
        }
        if let MergeGranularity::SpanOverlap { min_overlap } = self.merge {
            if !(0.0..1.0).contains(&min_overlap) {
                return invalid(format!("min_overlap {} must be within [0, 1)", min_overlap));
            }
        }
        if self.categories.is_empty() {
            return invalid("category set is empty".to_string());
        }
        let ex = &self.extraction;
        if ex.max_in_flight == 0 {
            return invalid("extraction max_in_flight must be at least 1".to_string());
        }
        if ex.max_attempts == 0 {
            return invalid("extraction max_attempts must be at least 1".to_string());
        }
        if ex.timeout_secs == 0 {
            return invalid("extraction timeout_secs must be at least 1".to_string());
        }
        if ex.max_prompt_chars == 0 {
            return invalid("extraction max_prompt_chars must be at least 1".to_string());
        }
        Ok(())
    }
}

/// Which backends are attached, and whether the configured primary can run.
#[derive(Debug, Clone, Serialize)]
pub struct DetectorStatus {
    pub primary: DetectorKind,
    pub primary_ready: bool,
    pub pattern_available: bool,
    pub classifier_loaded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub classifier_model: Option<String>,
    pub extraction_loaded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extraction_backend: Option<String>,
}

struct ChunkOutcome {
    findings: Vec<RawFinding>,
    fell_back: bool,
}

enum Detection {
    PerChunk(Vec<ChunkOutcome>),
    /// Primary detector could not run at all; the whole document goes through patterns.
    Failed(String),
}

/// Flags blocking work to stop once the owning future is dropped.
struct CancelOnDrop(Arc<AtomicBool>);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

pub struct Analyzer {
    config: AnalysisConfig,
    chunker: Chunker,
    pattern: Arc<PatternDetector>,
    classifier: Option<Arc<ClassifierDetector>>,
    extraction: Option<Arc<dyn ExtractionBackend>>,
}

impl Analyzer {
    pub fn new(config: AnalysisConfig) -> Result<Self, AnalysisError> {
        config.validate()?;
        let chunker = Chunker::new(config.chunking.max_chunk_size, config.chunking.overlap_size)?;
        let pattern = Arc::new(PatternDetector::new(config.categories.clone()));
        Ok(Self {
            config,
            chunker,
            pattern,
            classifier: None,
            extraction: None,
        })
    }

    pub fn with_classifier(mut self, backend: Arc<dyn ClassifierBackend>) -> Self {
        self.classifier = Some(Arc::new(ClassifierDetector::new(
            backend,
            self.config.categories.clone(),
            self.config.confidence_threshold,
            self.config.context_radius,
        )));
        self
    }

    pub fn with_extraction_backend(mut self, backend: Arc<dyn ExtractionBackend>) -> Self {
        self.extraction = Some(backend);
        self
    }

    pub fn detector_status(&self) -> DetectorStatus {
        let primary = self.config.detector;
        let primary_ready = match primary {
            DetectorKind::Pattern => true,
            DetectorKind::Classifier => self.classifier.is_some(),
            DetectorKind::StructuredExtraction => self.extraction.is_some(),
        };
        DetectorStatus {
            primary,
            primary_ready,
            pattern_available: true,
            classifier_loaded: self.classifier.is_some(),
            classifier_model: self.classifier.as_ref().and_then(|c| c.model_version()),
            extraction_loaded: self.extraction.is_some(),
            extraction_backend: self.extraction.as_ref().map(|b| b.name()),
        }
    }

    /// Analyze one document. Detector failures degrade to pattern output; only invalid
    /// input reaches the caller as an error.
    pub async fn analyze(&self, document: &Document) -> Result<AnalysisResult, AnalysisError> {
        let started = Instant::now();
        let request_id = Uuid::new_v4().to_string();

        let meaningful_chars = document.text.trim().chars().count();
        if meaningful_chars == 0 || meaningful_chars < self.config.min_document_chars {
            warn!(
                "[ORCHESTRATOR] request_id={} rejected: {} meaningful chars (min {})",
                request_id, meaningful_chars, self.config.min_document_chars
            );
            return Err(AnalysisError::EmptyInput {
                min_chars: self.config.min_document_chars.max(1),
            });
        }

        let chunks = Arc::new(self.chunker.split(&document.text));
        let primary = self.config.detector;
        let document_type = self.document_type(document);
        info!(
            "[ORCHESTRATOR] request_id={} chars={} chunks={} detector={}",
            request_id,
            document.text.chars().count(),
            chunks.len(),
            primary
        );

        let detection = match self.primary_detector(document_type.as_deref()) {
            Ok(detector) => self.run_detector(chunks.clone(), detector).await,
            Err(reason) => Detection::Failed(reason),
        };

        let (per_chunk, fallback_chunks, whole_fallback) = match detection {
            Detection::PerChunk(outcomes) => {
                let fallbacks = outcomes.iter().filter(|o| o.fell_back).count();
                let findings = outcomes.into_iter().map(|o| o.findings).collect::<Vec<_>>();
                (findings, fallbacks, false)
            }
            Detection::Failed(reason) => {
                warn!(
                    "[ORCHESTRATOR] request_id={} {} failed ({}), re-running pattern detection",
                    request_id, primary, reason
                );
                let findings = self.pattern_pass(chunks.clone()).await?;
                (findings, chunks.len(), true)
            }
        };

        let radius = self.config.context_radius;
        let mut raw_finding_count = 0usize;
        let mut finalized = Vec::new();
        for (chunk, raws) in chunks.iter().zip(per_chunk) {
            raw_finding_count += raws.len();
            finalized.extend(raws.into_iter().map(|raw| finalize(raw, chunk, radius)));
        }

        let red_flags = merge_findings(finalized, self.config.merge);
        let risk_level = aggregate_risk(&red_flags);
        let total_chunks = chunks.len();
        let detector_used = detector_label(primary, fallback_chunks, total_chunks, whole_fallback);
        let all_fell_back = fallback_chunks > 0 && fallback_chunks == total_chunks;
        let model_version = if whole_fallback || all_fell_back {
            Some(PATTERN_FALLBACK_MODEL_VERSION.to_string())
        } else {
            match primary {
                DetectorKind::Pattern => Some(PATTERN_MODEL_VERSION.to_string()),
                DetectorKind::Classifier => {
                    self.classifier.as_ref().and_then(|c| c.model_version())
                }
                DetectorKind::StructuredExtraction => self.extraction.as_ref().map(|b| b.name()),
            }
        };
        let processing_time_ms = started.elapsed().as_millis() as u64;

        info!(
            "[ORCHESTRATOR] request_id={} done: risk={} raw={} merged={} fallback_chunks={}/{} \
             detector_used={} elapsed_ms={}",
            request_id,
            risk_level,
            raw_finding_count,
            red_flags.len(),
            fallback_chunks,
            total_chunks,
            detector_used,
            processing_time_ms
        );

        Ok(AnalysisResult {
            risk_level,
            word_count: word_count(&document.text),
            red_flags,
            analysis_timestamp: chrono::Utc::now().to_rfc3339(),
            detector_used: detector_used.clone(),
            metadata: ProcessingMetadata {
                request_id,
                processing_time_ms,
                primary_detector: primary,
                detector_used,
                fallback_used: fallback_chunks > 0,
                fallback_chunks,
                total_chunks,
                raw_finding_count,
                model_version,
                document_type,
                source: document.source.clone(),
            },
        })
    }

    fn document_type(&self, document: &Document) -> Option<String> {
        match (&document.declared_type, self.config.detector) {
            (Some(declared), _) => Some(declared.clone()),
            (None, DetectorKind::StructuredExtraction) => Some(detect_document_type(
                &document.text,
                document.source.as_deref(),
            )),
            (None, _) => None,
        }
    }

    /// The configured primary detector, or why it cannot run. Extraction detectors are built
    /// per analysis so the document type and request bound belong to this document.
    fn primary_detector(&self, document_type: Option<&str>) -> Result<Arc<dyn Detector>, String> {
        match self.config.detector {
            DetectorKind::Pattern => Ok(self.pattern.clone() as Arc<dyn Detector>),
            DetectorKind::Classifier => self
                .classifier
                .clone()
                .map(|c| c as Arc<dyn Detector>)
                .ok_or_else(|| "no classifier backend attached".to_string()),
            DetectorKind::StructuredExtraction => self
                .extraction
                .as_ref()
                .map(|backend| {
                    Arc::new(StructuredExtractionDetector::new(
                        backend.clone(),
                        self.config.categories.clone(),
                        self.config.extraction.clone(),
                        document_type.unwrap_or(DEFAULT_DOCUMENT_TYPE),
                    )) as Arc<dyn Detector>
                })
                .ok_or_else(|| "no extraction backend attached".to_string()),
        }
    }

    /// One task per chunk, at most `task_slots` running. A failing chunk gets pattern output;
    /// a panic fails the whole pass. Returning early drops the task set, which aborts
    /// whatever is still running.
    async fn run_detector(&self, chunks: Arc<Vec<Chunk>>, primary: Arc<dyn Detector>) -> Detection {
        let kind = primary.kind();
        let started = Instant::now();
        let total = chunks.len();
        let slots = Arc::new(Semaphore::new(task_slots(kind, total)));
        let mut join_set: JoinSet<(usize, ChunkOutcome)> = JoinSet::new();

        for idx in 0..total {
            let chunks = chunks.clone();
            let primary = primary.clone();
            let pattern = self.pattern.clone();
            let slots = slots.clone();
            join_set.spawn(async move {
                let _slot = slots.acquire().await.ok();
                let chunk = &chunks[idx];
                let outcome = match primary.detect(chunk).await {
                    Ok(findings) => ChunkOutcome {
                        findings,
                        fell_back: false,
                    },
                    Err(e) => {
                        warn!(
                            "[ORCHESTRATOR] {} failed on chunk {}: {}; using pattern output",
                            kind, chunk.index, e
                        );
                        ChunkOutcome {
                            findings: pattern.detect(chunk).await.unwrap_or_default(),
                            fell_back: true,
                        }
                    }
                };
                (idx, outcome)
            });
        }

        let mut outcomes: Vec<Option<ChunkOutcome>> = (0..total).map(|_| None).collect();
        let mut done = 0usize;
        while let Some(res) = join_set.join_next().await {
            match res {
                Ok((idx, outcome)) => outcomes[idx] = Some(outcome),
                Err(e) => return Detection::Failed(format!("{} task failed: {}", kind, e)),
            }
            done += 1;
            if done == total || done % 5 == 0 {
                debug!(
                    "[ORCHESTRATOR] {} progress: {}/{} (elapsed_ms={})",
                    kind,
                    done,
                    total,
                    started.elapsed().as_millis()
                );
            }
        }

        match outcomes.into_iter().collect::<Option<Vec<_>>>() {
            Some(outcomes) => Detection::PerChunk(outcomes),
            None => Detection::Failed(format!("{} left chunks unprocessed", kind)),
        }
    }

    /// Pattern detector alone over every chunk, on the rayon pool. Stops early once the
    /// owning future is dropped.
    async fn pattern_pass(
        &self,
        chunks: Arc<Vec<Chunk>>,
    ) -> Result<Vec<Vec<RawFinding>>, AnalysisError> {
        let pattern = self.pattern.clone();
        let cancelled = Arc::new(AtomicBool::new(false));
        let _cancel_guard = CancelOnDrop(cancelled.clone());

        tokio::task::spawn_blocking(move || {
            chunks
                .as_slice()
                .par_iter()
                .map(|chunk| {
                    if cancelled.load(Ordering::Relaxed) {
                        return Vec::new();
                    }
                    pattern.scan(chunk)
                })
                .collect::<Vec<_>>()
        })
        .await
        .map_err(|e| AnalysisError::Internal(format!("pattern detection task failed: {}", e)))
    }
}

/// Concurrent chunk tasks for one pass. Extraction bounds its own requests; local detectors
/// are capped at the machine's parallelism.
fn task_slots(kind: DetectorKind, chunks: usize) -> usize {
    match kind {
        DetectorKind::StructuredExtraction => chunks.max(1),
        DetectorKind::Pattern | DetectorKind::Classifier => std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(DEFAULT_LOCAL_SLOTS),
    }
}

/// Fills context and confidence the detector left open and maps the span into document
/// coordinates.
fn finalize(raw: RawFinding, chunk: &Chunk, radius: usize) -> Finding {
    let end = raw.span.end.min(chunk.text.len());
    let start = raw.span.start.min(end);
    let local = Span::new(start, end);

    let context = match raw.context {
        Some(context) => context,
        None => extract_context(&chunk.text, local, radius),
    };
    let confidence = match raw.confidence {
        Some(c) => clamp_confidence(c),
        None => score_match(chunk.text.get(start..end).unwrap_or(""), &context),
    };

    Finding {
        category: raw.category,
        severity: raw.severity,
        context,
        description: raw.description,
        recommendation: raw.recommendation,
        confidence,
        title: raw.title,
        span: local.shifted(chunk.start),
        detector: raw.detector,
    }
}

fn detector_label(
    primary: DetectorKind,
    fallback_chunks: usize,
    total: usize,
    whole: bool,
) -> String {
    if whole || (primary != DetectorKind::Pattern && total > 0 && fallback_chunks >= total) {
        "pattern-fallback".to_string()
    } else if fallback_chunks > 0 {
        format!("{}+pattern-fallback", primary)
    } else {
        primary.as_str().to_string()
    }
}

/// Analyze plain text with `config`.
pub async fn analyze(
    text: &str,
    config: &AnalysisConfig,
) -> Result<AnalysisResult, AnalysisError> {
    Analyzer::new(config.clone())?.analyze(&Document::new(text)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{RiskLevel, Severity};
    use crate::services::detection::error::DetectorError;
    use crate::services::providers::ProviderError;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use std::time::Duration;

    const SCENARIO: &str = "This agreement shall automatically renew for an additional \
                            term of one year... All disputes shall be resolved through \
                            binding arbitration.";

    fn long_contract() -> String {
        (1..=30)
            .map(|i| {
                format!("Clause {}. Either party may terminate this agreement with notice. ", i)
            })
            .collect()
    }

    fn config(detector: DetectorKind) -> AnalysisConfig {
        AnalysisConfig {
            detector,
            extraction: ExtractionOptions {
                retry_backoff_ms: 1,
                ..ExtractionOptions::default()
            },
            ..AnalysisConfig::default()
        }
    }

    fn small_chunks(detector: DetectorKind) -> AnalysisConfig {
        AnalysisConfig {
            chunking: ChunkingOptions {
                max_chunk_size: 300,
                overlap_size: 40,
            },
            ..config(detector)
        }
    }

    // ---- classifier stubs ----

    struct FailingClassifier {
        labels: Vec<String>,
    }

    impl ClassifierBackend for FailingClassifier {
        fn labels(&self) -> &[String] {
            &self.labels
        }

        fn score(&self, _text: &str) -> Result<Vec<f64>, DetectorError> {
            Err(DetectorError::Unavailable("model not loaded".to_string()))
        }
    }

    /// Fails on chunks mentioning `poison`, otherwise flags the first label.
    struct SelectiveClassifier {
        labels: Vec<String>,
        poison: &'static str,
    }

    impl ClassifierBackend for SelectiveClassifier {
        fn labels(&self) -> &[String] {
            &self.labels
        }

        fn score(&self, text: &str) -> Result<Vec<f64>, DetectorError> {
            if text.contains(self.poison) {
                return Err(DetectorError::MalformedOutput("bad tensor".to_string()));
            }
            Ok((0..self.labels.len()).map(|i| if i == 0 { 0.8 } else { 0.1 }).collect())
        }

        fn model_version(&self) -> Option<String> {
            Some("stub-classifier-1".to_string())
        }
    }

    struct PanickingClassifier {
        labels: Vec<String>,
    }

    impl ClassifierBackend for PanickingClassifier {
        fn labels(&self) -> &[String] {
            &self.labels
        }

        fn score(&self, _text: &str) -> Result<Vec<f64>, DetectorError> {
            panic!("inference crashed");
        }
    }

    /// Flags nothing, slowly, and counts every scoring call.
    struct SlowClassifier {
        labels: Vec<String>,
        calls: Arc<AtomicUsize>,
    }

    impl ClassifierBackend for SlowClassifier {
        fn labels(&self) -> &[String] {
            &self.labels
        }

        fn score(&self, _text: &str) -> Result<Vec<f64>, DetectorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(100));
            Ok(vec![0.0; self.labels.len()])
        }
    }

    fn builtin_labels() -> Vec<String> {
        CategorySet::builtin().iter().map(|c| c.id.clone()).collect()
    }

    // ---- extraction stubs ----

    fn excerpt_of(prompt: &str) -> &str {
        let body = prompt.split("<<<\n").nth(1).unwrap_or("");
        body.split("\n>>>").next().unwrap_or("")
    }

    /// Reports every "arbitration" in the excerpt as a high-severity finding.
    struct ArbitrationSpotter;

    #[async_trait]
    impl ExtractionBackend for ArbitrationSpotter {
        fn name(&self) -> String {
            "spotter".to_string()
        }

        async fn infer(&self, _system: &str, prompt: &str) -> Result<String, ProviderError> {
            let excerpt = excerpt_of(prompt);
            let findings: Vec<String> = excerpt
                .match_indices("arbitration")
                .map(|(byte, m)| {
                    let start = excerpt[..byte].chars().count();
                    serde_json::json!({
                        "start": start,
                        "end": start + m.chars().count(),
                        "category": "arbitration",
                        "severity": "high",
                        "confidence": 0.9,
                        "rationale": "Binding arbitration."
                    })
                    .to_string()
                })
                .collect();
            Ok(format!("Here you go: {{\"findings\": [{}]}}", findings.join(",")))
        }
    }

    /// Records every prompt and reports nothing.
    #[derive(Default)]
    struct CapturingBackend {
        prompts: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ExtractionBackend for CapturingBackend {
        fn name(&self) -> String {
            "capturing".to_string()
        }

        async fn infer(&self, _system: &str, prompt: &str) -> Result<String, ProviderError> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            Ok(r#"{"findings": []}"#.to_string())
        }
    }

    struct MalformedBackend;

    #[async_trait]
    impl ExtractionBackend for MalformedBackend {
        fn name(&self) -> String {
            "malformed".to_string()
        }

        async fn infer(&self, _system: &str, _prompt: &str) -> Result<String, ProviderError> {
            Ok(r#"{"findings": [{"start": 0, "end": 3, "category": "x",
                "severity": "catastrophic", "confidence": 0.5}]}"#
                .to_string())
        }
    }

    struct SlowBackend;

    #[async_trait]
    impl ExtractionBackend for SlowBackend {
        fn name(&self) -> String {
            "slow".to_string()
        }

        async fn infer(&self, _system: &str, _prompt: &str) -> Result<String, ProviderError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(r#"{"findings": []}"#.to_string())
        }
    }

    struct PanickingBackend;

    #[async_trait]
    impl ExtractionBackend for PanickingBackend {
        fn name(&self) -> String {
            "panicking".to_string()
        }

        async fn infer(&self, _system: &str, _prompt: &str) -> Result<String, ProviderError> {
            panic!("service client crashed");
        }
    }

    #[derive(Default)]
    struct CountingBackend {
        in_flight: AtomicUsize,
        max_seen: AtomicUsize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ExtractionBackend for CountingBackend {
        fn name(&self) -> String {
            "counting".to_string()
        }

        async fn infer(&self, _system: &str, _prompt: &str) -> Result<String, ProviderError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_seen.fetch_max(now, Ordering::SeqCst);
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(r#"{"findings": []}"#.to_string())
        }
    }

    struct DropCounter(Arc<AtomicUsize>);

    impl Drop for DropCounter {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct HangingBackend {
        started: Arc<AtomicUsize>,
        dropped: Arc<AtomicUsize>,
        completed: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ExtractionBackend for HangingBackend {
        fn name(&self) -> String {
            "hanging".to_string()
        }

        async fn infer(&self, _system: &str, _prompt: &str) -> Result<String, ProviderError> {
            self.started.fetch_add(1, Ordering::SeqCst);
            let _guard = DropCounter(self.dropped.clone());
            tokio::time::sleep(Duration::from_secs(30)).await;
            self.completed.fetch_add(1, Ordering::SeqCst);
            Ok(r#"{"findings": []}"#.to_string())
        }
    }

    async fn pattern_result(text: &str, cfg: AnalysisConfig) -> AnalysisResult {
        let cfg = AnalysisConfig {
            detector: DetectorKind::Pattern,
            ..cfg
        };
        Analyzer::new(cfg).unwrap().analyze(&Document::new(text)).await.unwrap()
    }

    // ---- tests ----

    #[tokio::test]
    async fn test_renewal_and_arbitration_scenario_is_high_risk() {
        let result = analyze(SCENARIO, &AnalysisConfig::default()).await.unwrap();
        assert_eq!(result.risk_level, RiskLevel::High);
        assert_eq!(result.detector_used, "pattern");
        assert_eq!(result.word_count, 20);

        let categories: Vec<(&str, Severity)> = result
            .red_flags
            .iter()
            .map(|f| (f.category.as_str(), f.severity))
            .collect();
        assert_eq!(
            categories,
            vec![("auto_renewal", Severity::High), ("arbitration", Severity::High)]
        );
        assert!(result.red_flags[1].context.contains("binding arbitration"));
        assert!((result.red_flags[0].confidence - 0.7).abs() < 1e-9);
        assert!(!result.metadata.fallback_used);
        assert_eq!(result.metadata.model_version.as_deref(), Some("pattern-matching"));
    }

    #[tokio::test]
    async fn test_whitespace_only_is_rejected() {
        let err = analyze("   \n\t  ", &AnalysisConfig::default()).await.unwrap_err();
        assert!(matches!(err, AnalysisError::EmptyInput { min_chars: 10 }));
        let err = analyze("short", &AnalysisConfig::default()).await.unwrap_err();
        assert!(matches!(err, AnalysisError::EmptyInput { .. }));
    }

    #[tokio::test]
    async fn test_two_medium_findings_compound_to_high() {
        let text =
            "A late fee applies to overdue invoices. We may assign this account to an affiliate.";
        let result = analyze(text, &AnalysisConfig::default()).await.unwrap();
        let severities: Vec<Severity> = result.red_flags.iter().map(|f| f.severity).collect();
        assert_eq!(severities, vec![Severity::Medium, Severity::Medium]);
        assert_eq!(result.risk_level, RiskLevel::High);
    }

    #[tokio::test]
    async fn test_invalid_configuration_is_rejected() {
        let bad_overlap = AnalysisConfig {
            chunking: ChunkingOptions {
                max_chunk_size: 100,
                overlap_size: 100,
            },
            ..AnalysisConfig::default()
        };
        assert!(matches!(Analyzer::new(bad_overlap), Err(AnalysisError::Configuration(_))));

        let bad_threshold = AnalysisConfig {
            confidence_threshold: 1.5,
            ..AnalysisConfig::default()
        };
        assert!(matches!(Analyzer::new(bad_threshold), Err(AnalysisError::Configuration(_))));

        let bad_overlap_fraction = AnalysisConfig {
            merge: MergeGranularity::SpanOverlap { min_overlap: 1.0 },
            ..AnalysisConfig::default()
        };
        assert!(matches!(
            Analyzer::new(bad_overlap_fraction),
            Err(AnalysisError::Configuration(_))
        ));

        let mut no_slots = AnalysisConfig::default();
        no_slots.extraction.max_in_flight = 0;
        assert!(matches!(Analyzer::new(no_slots), Err(AnalysisError::Configuration(_))));

        let err = analyze(SCENARIO, &AnalysisConfig {
            chunking: ChunkingOptions {
                max_chunk_size: 0,
                overlap_size: 0,
            },
            ..AnalysisConfig::default()
        })
        .await
        .unwrap_err();
        assert!(matches!(err, AnalysisError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_failing_classifier_matches_pattern_only_result() {
        let text = long_contract();
        let cfg = small_chunks(DetectorKind::Classifier);
        let analyzer = Analyzer::new(cfg.clone())
            .unwrap()
            .with_classifier(Arc::new(FailingClassifier { labels: builtin_labels() }));

        let result = analyzer.analyze(&Document::new(text.clone())).await.unwrap();
        let baseline = pattern_result(&text, cfg).await;

        assert_eq!(result.red_flags, baseline.red_flags);
        assert_eq!(result.risk_level, baseline.risk_level);
        assert_eq!(result.detector_used, "pattern-fallback");
        assert!(result.metadata.fallback_used);
        assert_eq!(result.metadata.fallback_chunks, result.metadata.total_chunks);
        assert!(result.metadata.total_chunks > 1);
    }

    #[tokio::test]
    async fn test_partial_classifier_failure_is_reported() {
        let text = format!("{} The buyer must pay every fee on time.", long_contract());
        let analyzer = Analyzer::new(small_chunks(DetectorKind::Classifier))
            .unwrap()
            .with_classifier(Arc::new(SelectiveClassifier {
                labels: vec!["hidden_fees".to_string(), "arbitration".to_string()],
                poison: "buyer",
            }));

        let result = analyzer.analyze(&Document::new(text)).await.unwrap();
        assert_eq!(result.detector_used, "classifier+pattern-fallback");
        assert_eq!(result.metadata.fallback_chunks, 1);
        assert_eq!(result.metadata.model_version.as_deref(), Some("stub-classifier-1"));
        assert!(result
            .red_flags
            .iter()
            .any(|f| f.detector == DetectorKind::Classifier && f.category == "hidden_fees"));
    }

    #[tokio::test]
    async fn test_panicking_classifier_reruns_whole_document_with_patterns() {
        let analyzer = Analyzer::new(config(DetectorKind::Classifier))
            .unwrap()
            .with_classifier(Arc::new(PanickingClassifier { labels: builtin_labels() }));
        let result = analyzer.analyze(&Document::new(SCENARIO)).await.unwrap();
        let baseline = pattern_result(SCENARIO, config(DetectorKind::Pattern)).await;

        assert_eq!(result.red_flags, baseline.red_flags);
        assert_eq!(result.detector_used, "pattern-fallback");
        assert_eq!(result.metadata.model_version.as_deref(), Some("pattern-matching-fallback"));
    }

    #[tokio::test]
    async fn test_missing_backend_falls_back() {
        let analyzer = Analyzer::new(config(DetectorKind::StructuredExtraction)).unwrap();
        assert!(!analyzer.detector_status().primary_ready);
        let result = analyzer.analyze(&Document::new(SCENARIO)).await.unwrap();
        assert_eq!(result.detector_used, "pattern-fallback");
        assert_eq!(result.risk_level, RiskLevel::High);
    }

    #[tokio::test]
    async fn test_structured_extraction_maps_spans_to_document() {
        let text = "The parties agree to the following terms. \
                    Any disagreement goes to binding arbitration in Delaware.";
        let cfg = AnalysisConfig {
            chunking: ChunkingOptions {
                max_chunk_size: 60,
                overlap_size: 10,
            },
            ..config(DetectorKind::StructuredExtraction)
        };
        let analyzer = Analyzer::new(cfg)
            .unwrap()
            .with_extraction_backend(Arc::new(ArbitrationSpotter));

        let status = analyzer.detector_status();
        assert!(status.primary_ready);
        assert_eq!(status.extraction_backend.as_deref(), Some("spotter"));

        let doc = Document::new(text).with_source("msa.txt");
        let result = analyzer.analyze(&doc).await.unwrap();
        assert_eq!(result.detector_used, "structured_extraction");
        assert_eq!(result.red_flags.len(), 1);

        let flag = &result.red_flags[0];
        assert_eq!(&text[flag.span.start..flag.span.end], "arbitration");
        assert_eq!(flag.severity, Severity::High);
        assert_eq!(flag.description, "Binding arbitration.");
        assert!(flag.context.contains("binding arbitration"));
        assert_eq!(result.metadata.document_type.as_deref(), Some("legal_agreement"));
        assert_eq!(result.metadata.source.as_deref(), Some("msa.txt"));
    }

    #[tokio::test]
    async fn test_declared_type_reaches_extraction_prompt() {
        let backend = Arc::new(CapturingBackend::default());
        let analyzer = Analyzer::new(config(DetectorKind::StructuredExtraction))
            .unwrap()
            .with_extraction_backend(backend.clone());

        let doc = Document::new(SCENARIO).with_declared_type("lease_agreement");
        let result = analyzer.analyze(&doc).await.unwrap();
        assert_eq!(result.metadata.document_type.as_deref(), Some("lease_agreement"));
        assert_eq!(result.detector_used, "structured_extraction");
        assert_eq!(result.metadata.model_version.as_deref(), Some("capturing"));

        let prompts = backend.prompts.lock().unwrap();
        assert_eq!(prompts.len(), result.metadata.total_chunks);
        assert!(prompts.iter().all(|p| p.contains("lease agreement excerpt")));
    }

    #[tokio::test]
    async fn test_declared_type_is_reported_for_local_detectors() {
        let analyzer = Analyzer::new(config(DetectorKind::Pattern)).unwrap();
        let doc = Document::new(SCENARIO).with_declared_type("employment_contract");
        let result = analyzer.analyze(&doc).await.unwrap();
        assert_eq!(result.metadata.document_type.as_deref(), Some("employment_contract"));

        let undeclared = analyzer.analyze(&Document::new(SCENARIO)).await.unwrap();
        assert_eq!(undeclared.metadata.document_type, None);
    }

    #[tokio::test]
    async fn test_malformed_extraction_falls_back_per_chunk() {
        let analyzer = Analyzer::new(config(DetectorKind::StructuredExtraction))
            .unwrap()
            .with_extraction_backend(Arc::new(MalformedBackend));
        let result = analyzer.analyze(&Document::new(SCENARIO)).await.unwrap();
        let baseline = pattern_result(SCENARIO, config(DetectorKind::Pattern)).await;
        assert_eq!(result.red_flags, baseline.red_flags);
        assert_eq!(result.detector_used, "pattern-fallback");
    }

    #[tokio::test]
    async fn test_extraction_timeout_falls_back() {
        let mut cfg = config(DetectorKind::StructuredExtraction);
        cfg.extraction.timeout_secs = 1;
        cfg.extraction.max_attempts = 1;
        let analyzer = Analyzer::new(cfg).unwrap().with_extraction_backend(Arc::new(SlowBackend));

        let result = analyzer.analyze(&Document::new(SCENARIO)).await.unwrap();
        assert_eq!(result.detector_used, "pattern-fallback");
        assert_eq!(result.risk_level, RiskLevel::High);
    }

    #[tokio::test]
    async fn test_panicking_extraction_reruns_with_patterns() {
        let analyzer = Analyzer::new(small_chunks(DetectorKind::StructuredExtraction))
            .unwrap()
            .with_extraction_backend(Arc::new(PanickingBackend));
        let text = long_contract();
        let result = analyzer.analyze(&Document::new(text.clone())).await.unwrap();
        let baseline = pattern_result(&text, small_chunks(DetectorKind::Pattern)).await;
        assert_eq!(result.red_flags, baseline.red_flags);
        assert_eq!(result.detector_used, "pattern-fallback");
    }

    #[tokio::test]
    async fn test_in_flight_requests_are_bounded() {
        let mut cfg = small_chunks(DetectorKind::StructuredExtraction);
        cfg.extraction.max_in_flight = 2;
        let backend = Arc::new(CountingBackend::default());
        let analyzer = Analyzer::new(cfg).unwrap().with_extraction_backend(backend.clone());

        let result = analyzer.analyze(&Document::new(long_contract())).await.unwrap();
        assert_eq!(result.detector_used, "structured_extraction");
        assert_eq!(backend.calls.load(Ordering::SeqCst), result.metadata.total_chunks);
        let max_seen = backend.max_seen.load(Ordering::SeqCst);
        assert!(max_seen >= 1 && max_seen <= 2, "max in flight was {}", max_seen);
    }

    #[tokio::test]
    async fn test_dropping_analysis_cancels_outstanding_calls() {
        let mut cfg = small_chunks(DetectorKind::StructuredExtraction);
        cfg.extraction.max_in_flight = 2;
        let backend = Arc::new(HangingBackend::default());
        let analyzer = Analyzer::new(cfg).unwrap().with_extraction_backend(backend.clone());
        let doc = Document::new(long_contract());

        let res = tokio::time::timeout(Duration::from_millis(200), analyzer.analyze(&doc)).await;
        assert!(res.is_err());
        tokio::time::sleep(Duration::from_millis(100)).await;

        let started = backend.started.load(Ordering::SeqCst);
        assert!(started >= 1 && started <= 2);
        assert_eq!(backend.dropped.load(Ordering::SeqCst), started);
        assert_eq!(backend.completed.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_dropping_analysis_stops_local_detection() {
        let text: String = (1..=400)
            .map(|i| format!("Clause {}. Either party may terminate this agreement. ", i))
            .collect();
        let cfg = AnalysisConfig {
            chunking: ChunkingOptions {
                max_chunk_size: 80,
                overlap_size: 10,
            },
            ..config(DetectorKind::Classifier)
        };
        let total = Chunker::new(80, 10).unwrap().split(&text).len();
        let calls = Arc::new(AtomicUsize::new(0));
        let analyzer = Analyzer::new(cfg).unwrap().with_classifier(Arc::new(SlowClassifier {
            labels: builtin_labels(),
            calls: calls.clone(),
        }));
        let doc = Document::new(text);

        let res = tokio::time::timeout(Duration::from_millis(150), analyzer.analyze(&doc)).await;
        assert!(res.is_err());
        let at_drop = calls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(300)).await;
        let later = calls.load(Ordering::SeqCst);

        let slots = task_slots(DetectorKind::Classifier, total);
        assert!(later < total, "{} of {} chunks scored after cancellation", later, total);
        assert!(later <= at_drop + slots, "calls kept starting: {} -> {}", at_drop, later);
    }

    #[test]
    fn test_task_slots() {
        assert_eq!(task_slots(DetectorKind::StructuredExtraction, 12), 12);
        assert_eq!(task_slots(DetectorKind::StructuredExtraction, 0), 1);
        assert!(task_slots(DetectorKind::Pattern, 12) >= 1);
    }

    #[tokio::test]
    async fn test_merge_granularity_across_chunks() {
        let text = long_contract();

        let coarse = pattern_result(&text, small_chunks(DetectorKind::Pattern)).await;
        let cancellations = coarse
            .red_flags
            .iter()
            .filter(|f| f.category == "cancellation_terms")
            .count();
        assert_eq!(cancellations, 1);

        let fine_cfg = AnalysisConfig {
            merge: MergeGranularity::SpanOverlap { min_overlap: 0.0 },
            ..small_chunks(DetectorKind::Pattern)
        };
        let fine = pattern_result(&text, fine_cfg).await;
        assert_eq!(fine.red_flags.len(), 30);
        for flag in &fine.red_flags {
            assert!(flag.span.end <= text.len());
            assert_eq!(text[flag.span.start..flag.span.end].to_lowercase(), "terminate");
        }
    }

    #[tokio::test]
    async fn test_result_serializes_to_stable_shape() {
        let result = analyze(SCENARIO, &AnalysisConfig::default()).await.unwrap();
        let json = serde_json::to_value(&result).unwrap();
        let top_level = [
            "risk_level",
            "word_count",
            "red_flags",
            "analysis_timestamp",
            "detector_used",
        ];
        for key in top_level {
            assert!(json.get(key).is_some(), "missing {}", key);
        }
        let flag = &json["red_flags"][0];
        for key in ["category", "severity", "text", "description", "recommendation", "confidence"] {
            assert!(flag.get(key).is_some(), "missing red_flags[].{}", key);
        }
        assert_eq!(json["risk_level"], "high");
        let timestamp = json["analysis_timestamp"].as_str().unwrap();
        assert!(chrono::DateTime::parse_from_rfc3339(timestamp).is_ok());
    }

    #[test]
    fn test_detector_label() {
        assert_eq!(detector_label(DetectorKind::Pattern, 0, 3, false), "pattern");
        assert_eq!(detector_label(DetectorKind::Classifier, 0, 3, false), "classifier");
        assert_eq!(
            detector_label(DetectorKind::Classifier, 1, 3, false),
            "classifier+pattern-fallback"
        );
        assert_eq!(detector_label(DetectorKind::Classifier, 3, 3, false), "pattern-fallback");
        assert_eq!(
            detector_label(DetectorKind::StructuredExtraction, 0, 3, true),
            "pattern-fallback"
        );
    }

    #[test]
    fn test_finalize_scores_and_shifts() {
        let chunk = Chunk {
            index: 1,
            start: 500,
            end: 540,
            text: "Renewal happens yearly. Renewal is auto.".to_string(),
        };
        let raw = RawFinding {
            category: "auto_renewal".to_string(),
            title: "Automatic Renewal".to_string(),
            severity: Severity::High,
            confidence: None,
            span: Span::new(0, 7),
            context: None,
            description: "d".to_string(),
            recommendation: "r".to_string(),
            detector: DetectorKind::Pattern,
        };
        let finding = finalize(raw, &chunk, 90);
        assert_eq!(finding.span, Span::new(500, 507));
        assert_eq!(finding.context, chunk.text);
        // "renewal" recurs in the context
        assert!((finding.confidence - 0.6).abs() < 1e-9);
    }
}
