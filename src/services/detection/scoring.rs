// Confidence scoring and probability-driven severity adjustment

use crate::models::Severity;

const BASE_CONFIDENCE: f64 = 0.5;
const LONG_MATCH_BONUS: f64 = 0.2;
const RECURRENCE_BONUS: f64 = 0.1;
const LONG_MATCH_CHARS: usize = 10;

const ESCALATE_ABOVE: f64 = 0.9;
const DEESCALATE_BELOW: f64 = 0.75;

/// Heuristic confidence for a pattern match.
///
/// Starts at 0.5, adds 0.2 when the matched text is longer than 10 chars and 0.1 when the
/// matched term occurs more than once (case-insensitive) inside its context.
pub fn score_match(match_text: &str, context: &str) -> f64 {
    let mut confidence = BASE_CONFIDENCE;

    if match_text.chars().count() > LONG_MATCH_CHARS {
        confidence += LONG_MATCH_BONUS;
    }

    let needle = match_text.to_lowercase();
    if !needle.is_empty() && context.to_lowercase().matches(needle.as_str()).count() > 1 {
        confidence += RECURRENCE_BONUS;
    }

    clamp_confidence(confidence)
}

/// Clamps into `[0, 1]`; NaN becomes 0.
pub fn clamp_confidence(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

/// Moves a category's default severity one step based on classifier probability.
pub fn adjust_severity(base: Severity, probability: f64) -> Severity {
    if probability > ESCALATE_ABOVE {
        base.escalate()
    } else if probability < DEESCALATE_BELOW {
        base.deescalate()
    } else {
        base
    }
}
