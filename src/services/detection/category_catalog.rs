// Risk category catalog
// Compiled once per configuration and shared by reference with every detector

use regex::{Regex, RegexBuilder};
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use crate::models::{CategoryDefinition, Severity};
use crate::services::detection::error::AnalysisError;

#[derive(Debug, Clone)]
pub struct Category {
    pub id: String,
    pub title: String,
    pub default_severity: Severity,
    pub description: String,
    pub recommendation: String,
    pub aliases: Vec<String>,
    regex: Regex,
}

impl Category {
    /// Case-insensitive rule used by the pattern detector.
    pub fn regex(&self) -> &Regex {
        &self.regex
    }
}

/// Category facts attached to a finding, known or not.
#[derive(Debug, Clone, PartialEq)]
pub struct CategoryProfile {
    pub id: String,
    pub title: String,
    pub default_severity: Severity,
    pub description: String,
    pub recommendation: String,
}

#[derive(Debug, Clone)]
pub struct CategorySet {
    categories: Vec<Category>,
    // normalized id or alias -> position in `categories`
    labels: HashMap<String, usize>,
}

static BUILTIN: OnceLock<Arc<CategorySet>> = OnceLock::new();

impl CategorySet {
    pub fn from_definitions(definitions: Vec<CategoryDefinition>) -> Result<Self, AnalysisError> {
        if definitions.is_empty() {
            return Err(AnalysisError::Configuration(
                "category set must contain at least one category".to_string(),
            ));
        }

        let mut categories = Vec::with_capacity(definitions.len());
        let mut labels = HashMap::new();

        for def in definitions {
            let id = normalize_label(&def.id);
            if id.is_empty() {
                return Err(AnalysisError::Configuration(format!(
                    "category id '{}' is empty after normalization",
                    def.id
                )));
            }
            let regex = RegexBuilder::new(&def.pattern)
                .case_insensitive(true)
                .build()
                .map_err(|e| {
                    AnalysisError::Configuration(format!("invalid pattern for '{}': {}", id, e))
                })?;

            let position = categories.len();
            for label in std::iter::once(&def.id).chain(def.aliases.iter()) {
                let key = normalize_label(label);
                if key.is_empty() {
                    continue;
                }
                if let Some(prev) = labels.insert(key.clone(), position) {
                    if prev != position {
                        return Err(AnalysisError::Configuration(format!(
                            "label '{}' is claimed by more than one category",
                            key
                        )));
                    }
                }
            }

            categories.push(Category {
                id,
                title: def.title,
                default_severity: def.default_severity,
                description: def.description,
                recommendation: def.recommendation,
                aliases: def.aliases,
                regex,
            });
        }

        Ok(Self { categories, labels })
    }

    /// Process-wide built-in table.
    pub fn builtin() -> Arc<CategorySet> {
        BUILTIN
            .get_or_init(|| {
                Arc::new(
                    CategorySet::from_definitions(builtin_definitions())
                        .expect("built-in category table compiles"),
                )
            })
            .clone()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Category> {
        self.categories.iter()
    }

    pub fn len(&self) -> usize {
        self.categories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.categories.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Category> {
        self.resolve(id)
    }

    /// Looks a label up by id or alias, ignoring case and separators.
    pub fn resolve(&self, label: &str) -> Option<&Category> {
        self.labels
            .get(&normalize_label(label))
            .and_then(|&idx| self.categories.get(idx))
    }

    /// Catalog facts for `label`, or generic medium-severity text for labels the catalog
    /// does not know.
    pub fn profile(&self, label: &str) -> CategoryProfile {
        if let Some(category) = self.resolve(label) {
            return CategoryProfile {
                id: category.id.clone(),
                title: category.title.clone(),
                default_severity: category.default_severity,
                description: category.description.clone(),
                recommendation: category.recommendation.clone(),
            };
        }

        let id = normalize_label(label);
        let words = id.replace('_', " ");
        CategoryProfile {
            title: title_case(&words),
            default_severity: Severity::Medium,
            description: format!("Important {} clause detected", words),
            recommendation: format!("Review {} terms carefully", words),
            id,
        }
    }
}

/// `"Renewal Term"`, `"renewal-term"` and `"renewalTerm"` all become `renewal_term`.
pub fn normalize_label(label: &str) -> String {
    let mut out = String::with_capacity(label.len());
    let mut prev_lower = false;
    for ch in label.trim().chars() {
        if ch.is_alphanumeric() {
            if ch.is_uppercase() && prev_lower {
                out.push('_');
            }
            prev_lower = ch.is_lowercase() || ch.is_ascii_digit();
            out.extend(ch.to_lowercase());
        } else {
            if !out.ends_with('_') && !out.is_empty() {
                out.push('_');
            }
            prev_lower = false;
        }
    }
    out.trim_end_matches('_').to_string()
}

fn title_case(words: &str) -> String {
    words
        .split_whitespace()
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn def(
    id: &str,
    title: &str,
    pattern: &str,
    default_severity: Severity,
    description: &str,
    recommendation: &str,
    aliases: &[&str],
) -> CategoryDefinition {
    CategoryDefinition {
        id: id.to_string(),
        title: title.to_string(),
        pattern: pattern.to_string(),
        default_severity,
        description: description.to_string(),
        recommendation: recommendation.to_string(),
        aliases: aliases.iter().map(|a| a.to_string()).collect(),
    }
}

/// Built-in rule table. Aliases cover CUAD clause labels and common model outputs.
pub fn builtin_definitions() -> Vec<CategoryDefinition> {
    vec![
        def(
            "auto_renewal",
            "Automatic Renewal",
            r"\b(?:(?:auto|automatic|automatically)\s+renew\w*|renewal|renewed|renewing)\b",
            Severity::High,
            "Contract automatically renews without explicit consent",
            "Request removal or modification of automatic renewal clause",
            &["Renewal Term", "autoRenewal", "automatic_renewal"],
        ),
        def(
            "cancellation_terms",
            "Cancellation Terms",
            r"\b(?:cancel|cancellation|terminate|termination|end|ending|expire|expiration)\b",
            Severity::Medium,
            "Cancellation process is not clearly defined",
            "Request specific cancellation procedures and timelines",
            &["Notice Period to Terminate Renewal", "unclearCancellation", "termination"],
        ),
        def(
            "liability",
            "Liability",
            concat!(
                r"\b(?:liability|responsible|responsibility|obligation|obligations",
                r"|indemnify|indemnification)\b",
            ),
            Severity::Low,
            "Standard liability limitations present",
            "Review liability limits and consider if they are reasonable",
            &[
                "Uncapped Liability",
                "liability_limitation",
                "liability_limitations",
                "Cap on Liability",
            ],
        ),
        def(
            "hidden_fees",
            "Fees and Charges",
            r"\b(?:fee|fees|charge|charges|cost|costs|payment|payments|price|pricing|rate|rates)\b",
            Severity::Medium,
            "Possible hidden fees or charges detected",
            "Request detailed breakdown of all fees and charges",
            &["Revenue/Profit Sharing", "hiddenFees", "fees"],
        ),
        def(
            "data_collection",
            "Data Privacy",
            concat!(
                r"\b(?:data|information|collect|collection|share|sharing|privacy",
                r"|confidential|confidentiality)\b",
            ),
            Severity::Medium,
            "Extensive data collection or sharing terms present",
            "Review data collection and sharing policies",
            &["dataCollection", "privacy", "data_privacy"],
        ),
        def(
            "arbitration",
            "Dispute Resolution",
            r"\b(?:arbitration|arbitrate|arbitrator|dispute|disputes|litigation|court|courts)\b",
            Severity::High,
            "Mandatory arbitration or dispute resolution terms present",
            "Review dispute resolution process and consider if it favors your interests",
            &["dispute_resolution", "Governing Law", "jurisdiction"],
        ),
        def(
            "intellectual_property",
            "Intellectual Property",
            concat!(
                r"\b(?:intellectual property|patent|patents|copyright|copyrights",
                r"|trademark|trademarks|license|licenses)\b",
            ),
            Severity::Medium,
            "Intellectual property rights and licensing terms present",
            "Review IP rights and licensing terms carefully",
            &["IP Ownership Assignment", "ip_rights", "intellectualProperty"],
        ),
        def(
            "non_compete",
            "Non-Compete",
            r"\b(?:non-compete|noncompete|restrict|restriction|restrictions|compete|competition)\b",
            Severity::High,
            "Non-compete or restrictive covenants present",
            "Review scope and duration of non-compete provisions",
            &["competition_restrictions", "Exclusivity", "exclusivity_terms"],
        ),
        def(
            "force_majeure",
            "Force Majeure",
            concat!(
                r"\b(?:force majeure|act of god|unforeseen|unforeseeable",
                r"|circumstances|beyond control)\b",
            ),
            Severity::Medium,
            "Force majeure or unforeseeable circumstances clause present",
            "Review force majeure provisions and their implications",
            &["forceMajeure"],
        ),
        def(
            "assignment",
            "Assignment Rights",
            r"\b(?:assign|assignment|transfer|transfers|transferable|assignable)\b",
            Severity::Medium,
            "Contract assignment or transfer rights present",
            "Review assignment rights and restrictions",
            &["Anti-Assignment", "assignment_rights"],
        ),
    ]
}
