// Aggregation Logic
// Reduces the merged finding set to one overall risk level

use crate::models::{Finding, RiskLevel, Severity};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SeverityCounts {
    pub high: usize,
    pub medium: usize,
    pub low: usize,
}

impl SeverityCounts {
    pub fn from_severities<I>(severities: I) -> Self
    where
        I: IntoIterator<Item = Severity>,
    {
        let mut counts = Self::default();
        for severity in severities {
            match severity {
                Severity::High => counts.high += 1,
                Severity::Medium => counts.medium += 1,
                Severity::Low => counts.low += 1,
            }
        }
        counts
    }

    pub fn total(&self) -> usize {
        self.high + self.medium + self.low
    }
}

/// Rule table, first match wins:
/// empty -> low; any high -> high; two or more medium -> high; one medium -> medium;
/// otherwise low.
pub fn risk_from_counts(counts: SeverityCounts) -> RiskLevel {
    if counts.total() == 0 {
        RiskLevel::Low
    } else if counts.high > 0 {
        RiskLevel::High
    } else if counts.medium > 1 {
        // multiple medium issues compound
        RiskLevel::High
    } else if counts.medium == 1 {
        RiskLevel::Medium
    } else {
        RiskLevel::Low
    }
}

/// Aggregate merged findings into a risk level
pub fn aggregate_risk(findings: &[Finding]) -> RiskLevel {
    risk_from_counts(SeverityCounts::from_severities(findings.iter().map(|f| f.severity)))
}
