// Finding merge
// Collapses duplicates across chunks and keeps the strongest member of each group

use std::cmp::Ordering;
use std::collections::HashMap;

use crate::models::{Finding, MergeGranularity, Severity};

/// Strongest first: confidence, then severity, then earlier span, then category.
fn stronger_first(a: &Finding, b: &Finding) -> Ordering {
    b.confidence
        .total_cmp(&a.confidence)
        .then_with(|| b.severity.cmp(&a.severity))
        .then_with(|| a.span.start.cmp(&b.span.start))
        .then_with(|| a.span.end.cmp(&b.span.end))
        .then_with(|| a.category.cmp(&b.category))
}

/// Output order: severity desc, confidence desc, then position.
fn presentation_order(a: &Finding, b: &Finding) -> Ordering {
    b.severity
        .cmp(&a.severity)
        .then_with(|| b.confidence.total_cmp(&a.confidence))
        .then_with(|| a.span.start.cmp(&b.span.start))
        .then_with(|| a.category.cmp(&b.category))
}

fn by_category_severity(findings: Vec<Finding>) -> Vec<Finding> {
    let mut groups: HashMap<(String, Severity), Finding> = HashMap::new();
    for finding in findings {
        let key = (finding.category.clone(), finding.severity);
        match groups.get(&key) {
            Some(best) if stronger_first(best, &finding) != Ordering::Greater => {}
            _ => {
                groups.insert(key, finding);
            }
        }
    }
    groups.into_values().collect()
}

/// Greedy suppression: walk strongest first and drop anything that overlaps an already
/// kept finding of the same category by more than `min_overlap` of the shorter span.
fn suppress_overlaps(mut findings: Vec<Finding>, min_overlap: f64) -> Vec<Finding> {
    findings.sort_by(stronger_first);
    let mut kept: Vec<Finding> = Vec::with_capacity(findings.len());
    for finding in findings {
        let duplicate = kept.iter().any(|k| {
            k.category == finding.category && k.span.overlap_fraction(&finding.span) > min_overlap
        });
        if !duplicate {
            kept.push(finding);
        }
    }
    kept
}

/// Merge findings from every chunk and detector of one document.
///
/// `CategorySeverity` keeps the strongest finding per (category, severity) and then drops
/// same-category findings of another severity whose spans touch a stronger one.
/// `SpanOverlap` only collapses findings above its overlap fraction. Merging an already
/// merged list returns it unchanged.
pub fn merge_findings(findings: Vec<Finding>, granularity: MergeGranularity) -> Vec<Finding> {
    let mut merged = match granularity {
        MergeGranularity::CategorySeverity => {
            suppress_overlaps(by_category_severity(findings), 0.0)
        }
        MergeGranularity::SpanOverlap { min_overlap } => suppress_overlaps(findings, min_overlap),
    };
    merged.sort_by(presentation_order);
    merged
}
