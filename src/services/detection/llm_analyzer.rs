// LLM Analyzer
// Structured extraction through an external reasoning service
// - prompt construction with bounded excerpt length
// - schema validation of the returned findings
// - per-chunk retry, timeout and bounded in-flight requests

use async_trait::async_trait;
use regex::{Regex, RegexBuilder};
use serde::Deserialize;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::models::{Chunk, DetectorKind, ExtractionOptions, RawFinding, Severity, Span};
use crate::services::detection::category_catalog::CategorySet;
use crate::services::detection::error::DetectorError;
use crate::services::detection::Detector;
use crate::services::providers::{
    get_api_key, parse_provider, ProviderClient, ProviderError, ProviderSpec,
};
use crate::services::text_processor::{char_to_byte_index, prefix_chars};

const TRUNCATION_MARKER: &str = "[... excerpt truncated ...]";
const EXTRACTION_MAX_TOKENS: u32 = 4000;

const EXTRACTION_SYSTEM_PROMPT: &str = "You are a contract review assistant. You read an excerpt \
of a document and flag clauses that carry risk for the person agreeing to it.
Return only a JSON object, no prose and no markdown fences.";

/// Keyword rules for guessing the document type used in the prompt.
const DOCUMENT_TYPE_PATTERNS: &[(&str, &str)] = &[
    (
        "legal_agreement",
        r"agreement|contract|terms|parties|whereas|hereby|shall|party|clause|provision",
    ),
    (
        "financial_report",
        r"revenue|profit|financial|quarter|fiscal|earnings|balance|income|cash flow",
    ),
    (
        "policy_document",
        r"policy|procedure|guidelines|compliance|standard|regulation|requirement",
    ),
    (
        "technical_spec",
        r"specification|requirements|architecture|design|implementation|technical|system",
    ),
    (
        "employment_contract",
        r"employment|employee|employer|salary|benefits|termination|duties|responsibilities",
    ),
    (
        "lease_agreement",
        r"lease|rental|tenant|landlord|property|premises|rent|security deposit",
    ),
];
const FILENAME_HINT_BONUS: usize = 5;
pub const DEFAULT_DOCUMENT_TYPE: &str = "legal_agreement";

fn document_type_rules() -> &'static [(&'static str, Regex)] {
    static RULES: OnceLock<Vec<(&'static str, Regex)>> = OnceLock::new();
    RULES.get_or_init(|| {
        DOCUMENT_TYPE_PATTERNS
            .iter()
            .map(|&(doc_type, pattern)| {
                let re = RegexBuilder::new(pattern)
                    .case_insensitive(true)
                    .build()
                    .expect("document type pattern");
                (doc_type, re)
            })
            .collect()
    })
}

/// Keyword-density guess; ties keep the earlier type. A filename containing the type name
/// (without underscores) adds a bonus.
pub fn detect_document_type(text: &str, filename: Option<&str>) -> String {
    let filename = filename.map(|f| f.to_lowercase()).unwrap_or_default();
    let mut best: Option<(&str, usize)> = None;

    for &(doc_type, ref re) in document_type_rules() {
        let mut score = re.find_iter(text).count();
        if !filename.is_empty() && filename.contains(&doc_type.replace('_', "")) {
            score += FILENAME_HINT_BONUS;
        }
        if best.map_or(true, |(_, s)| score > s) {
            best = Some((doc_type, score));
        }
    }

    best.map(|(t, _)| t).unwrap_or(DEFAULT_DOCUMENT_TYPE).to_string()
}

/// Anything that answers a prompt with text expected to contain a JSON object.
#[async_trait]
pub trait ExtractionBackend: Send + Sync {
    fn name(&self) -> String;

    async fn infer(&self, system: &str, prompt: &str) -> Result<String, ProviderError>;
}

/// `ExtractionBackend` over an HTTP provider.
pub struct ProviderBackend {
    client: ProviderClient,
    spec: ProviderSpec,
    api_key: String,
}

impl ProviderBackend {
    pub fn new(client: ProviderClient, provider: &str, api_key: impl Into<String>) -> Self {
        Self {
            client,
            spec: parse_provider(provider),
            api_key: api_key.into(),
        }
    }

    /// Resolves the API key from environment or settings file.
    pub fn from_env(provider: &str) -> Result<Self, ProviderError> {
        let spec = parse_provider(provider);
        let api_key = get_api_key(&spec.name).ok_or(ProviderError::MissingApiKey)?;
        Ok(Self {
            client: ProviderClient::new(),
            spec,
            api_key,
        })
    }
}

#[async_trait]
impl ExtractionBackend for ProviderBackend {
    fn name(&self) -> String {
        format!("{}:{}", self.spec.name, self.spec.model_or_default())
    }

    async fn infer(&self, system: &str, prompt: &str) -> Result<String, ProviderError> {
        let result = self
            .client
            .call(&self.spec, &self.api_key, system, prompt, EXTRACTION_MAX_TOKENS)
            .await?;
        debug!("[LLM_ANALYZER] provider={} latency_ms={}", self.spec.name, result.latency_ms);
        Ok(result.content)
    }
}

#[derive(Debug, Deserialize)]
struct ExtractionPayload {
    findings: Vec<ExtractedFinding>,
}

#[derive(Debug, Deserialize)]
struct ExtractedFinding {
    start: usize,
    end: usize,
    category: String,
    severity: String,
    confidence: f64,
    #[serde(default)]
    rationale: Option<String>,
}

/// Locate the JSON object inside a reply that may carry surrounding prose.
fn extract_json(content: &str) -> Result<&str, DetectorError> {
    let content = content.trim();
    if content.starts_with('{') {
        return Ok(content);
    }
    match (content.find('{'), content.rfind('}')) {
        (Some(start), Some(end)) if end > start => Ok(&content[start..=end]),
        (Some(_), _) => Err(DetectorError::MalformedOutput("Invalid JSON response".to_string())),
        _ => Err(DetectorError::MalformedOutput("No JSON in response".to_string())),
    }
}

/// Extraction detector for one analysis. The document type is fixed for its lifetime and
/// the semaphore bounds requests across every chunk it serves.
pub struct StructuredExtractionDetector {
    backend: Arc<dyn ExtractionBackend>,
    categories: Arc<CategorySet>,
    options: ExtractionOptions,
    document_type: String,
    in_flight: Semaphore,
}

impl StructuredExtractionDetector {
    pub fn new(
        backend: Arc<dyn ExtractionBackend>,
        categories: Arc<CategorySet>,
        options: ExtractionOptions,
        document_type: impl Into<String>,
    ) -> Self {
        let in_flight = Semaphore::new(options.max_in_flight.max(1));
        Self {
            backend,
            categories,
            options,
            document_type: document_type.into(),
            in_flight,
        }
    }

    /// Returns the prompt and the excerpt it embeds. Offsets in the reply are validated
    /// against that excerpt.
    pub fn build_prompt<'a>(&self, text: &'a str) -> (String, &'a str) {
        let excerpt = prefix_chars(text, self.options.max_prompt_chars);
        let truncated = excerpt.len() < text.len();

        let categories = self
            .categories
            .iter()
            .map(|c| format!("- {}: {}", c.id, c.title))
            .collect::<Vec<_>>()
            .join("\n");

        let mut prompt = format!(
            r#"Analyze this {} excerpt and return a JSON object with this structure:

{{"findings": [{{"start": 0, "end": 42, "category": "auto_renewal",
  "severity": "low|medium|high", "confidence": 0.92,
  "rationale": "One sentence explanation"}}]}}

"start" and "end" are character offsets into the excerpt, end-exclusive.
"confidence" is a number between 0 and 1.
Prefer these categories:
{}
Return {{"findings": []}} when nothing is noteworthy.

Excerpt:
<<<
{}"#,
            self.document_type.replace('_', " "),
            categories,
            excerpt
        );
        if truncated {
            prompt.push('\n');
            prompt.push_str(TRUNCATION_MARKER);
        }
        prompt.push_str("\n>>>");

        (prompt, excerpt)
    }

    /// Validates the reply schema. Any invalid entry rejects the whole reply.
    pub fn parse_findings(
        &self,
        content: &str,
        excerpt: &str,
    ) -> Result<Vec<RawFinding>, DetectorError> {
        let payload: ExtractionPayload = serde_json::from_str(extract_json(content)?)?;
        let excerpt_chars = excerpt.chars().count();
        let mut findings = Vec::with_capacity(payload.findings.len());

        for item in payload.findings {
            if item.category.trim().is_empty() {
                return Err(DetectorError::MalformedOutput("empty category".to_string()));
            }
            let severity = Severity::parse(&item.severity).ok_or_else(|| {
                DetectorError::MalformedOutput(format!("invalid severity '{}'", item.severity))
            })?;
            if !item.confidence.is_finite() || !(0.0..=1.0).contains(&item.confidence) {
                return Err(DetectorError::MalformedOutput(format!(
                    "confidence {} outside [0, 1]",
                    item.confidence
                )));
            }
            if item.start >= item.end || item.end > excerpt_chars {
                return Err(DetectorError::MalformedOutput(format!(
                    "span {}..{} outside excerpt of {} chars",
                    item.start, item.end, excerpt_chars
                )));
            }
            let (Some(start), Some(end)) = (
                char_to_byte_index(excerpt, item.start),
                char_to_byte_index(excerpt, item.end),
            ) else {
                return Err(DetectorError::MalformedOutput(
                    "span not on char boundary".to_string(),
                ));
            };

            let profile = self.categories.profile(&item.category);
            let description = item
                .rationale
                .map(|r| r.trim().to_string())
                .filter(|r| !r.is_empty())
                .unwrap_or(profile.description);

            findings.push(RawFinding {
                category: profile.id,
                title: profile.title,
                severity,
                confidence: Some(item.confidence),
                span: Span::new(start, end),
                context: None,
                description,
                recommendation: profile.recommendation,
                detector: DetectorKind::StructuredExtraction,
            });
        }

        Ok(findings)
    }

}

#[async_trait]
impl Detector for StructuredExtractionDetector {
    fn kind(&self) -> DetectorKind {
        DetectorKind::StructuredExtraction
    }

    /// Runs one chunk through the service with retries. A request slot is held only for the
    /// request itself, not across backoff.
    async fn detect(&self, chunk: &Chunk) -> Result<Vec<RawFinding>, DetectorError> {
        let (prompt, excerpt) = self.build_prompt(&chunk.text);
        let timeout_secs = self.options.timeout_secs;
        let mut last_err: Option<DetectorError> = None;

        for attempt in 1..=self.options.max_attempts {
            let res = {
                let _permit = self
                    .in_flight
                    .acquire()
                    .await
                    .map_err(|_| DetectorError::Unavailable("semaphore closed".to_string()))?;
                let fut = self.backend.infer(EXTRACTION_SYSTEM_PROMPT, &prompt);
                tokio::time::timeout(Duration::from_secs(timeout_secs), fut).await
            };

            let outcome = match res {
                Ok(Ok(content)) => self.parse_findings(&content, excerpt),
                Ok(Err(e)) => Err(DetectorError::from(e)),
                Err(_) => Err(DetectorError::Timeout { secs: timeout_secs }),
            };

            match outcome {
                Ok(findings) => {
                    info!(
                        "[LLM_ANALYZER] extraction ok backend={} chunk={} attempt={} findings={}",
                        self.backend.name(),
                        chunk.index,
                        attempt,
                        findings.len()
                    );
                    return Ok(findings);
                }
                Err(e) => {
                    warn!(
                        "[LLM_ANALYZER] extraction failed backend={} chunk={} attempt={} : {}",
                        self.backend.name(),
                        chunk.index,
                        attempt,
                        e
                    );
                    last_err = Some(e);
                }
            }

            if attempt < self.options.max_attempts {
                let backoff_ms = self.options.retry_backoff_ms * attempt as u64;
                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
            }
        }

        Err(last_err
            .unwrap_or_else(|| DetectorError::Unavailable("no attempts made".to_string())))
    }
}
