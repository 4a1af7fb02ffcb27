//! Deterministic rule engine (pipeline stage 1).
//!
//! Applies compiled regex patterns against line item descriptions and
//! produces immediate COVERED / NOT_COVERED verdicts at confidence 1.0.
//! The patterns themselves are data, loaded from the `rules` section of
//! the coverage config; the engine only knows the pattern classes:
//!
//! - exclusion patterns (diagnostic, cosmetic work)
//! - non-covered labor patterns (towing, battery charging)
//! - consumable patterns (oil filter, air filter) -- skipped when the
//!   repair context implicates a covered component, so consumables that
//!   support that repair are not denied here
//! - fluid patterns
//! - covered patterns keyed by category (direct approvals)

use std::collections::BTreeMap;

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::normalize::is_labor_type;
use crate::trace::TraceBuilder;
use crate::types::{
    CoverageStatus, LineItemCoverage, MatchMethod, PendingItem, TraceAction, TraceStep,
};

/// Pattern lists for the rule engine, loaded from the `rules` config section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleConfig {
    /// Patterns excluding diagnostic / cosmetic work entirely.
    #[serde(default)]
    pub exclusion_patterns: Vec<String>,

    /// Patterns for labor that is never covered (towing, charging).
    #[serde(default)]
    pub non_covered_labor_patterns: Vec<String>,

    /// Patterns for consumables (filters) denied outside a covered repair.
    #[serde(default)]
    pub consumable_patterns: Vec<String>,

    /// Patterns for fluids (oil, coolant).
    #[serde(default)]
    pub fluid_patterns: Vec<String>,

    /// Category -> patterns that approve an item into that category.
    #[serde(default)]
    pub covered_patterns: BTreeMap<String, Vec<String>>,
}

/// A rule hit: which pattern fired and the resulting reasoning.
#[derive(Debug, Clone)]
pub struct RuleMatch {
    /// The pattern source that matched.
    pub pattern: String,
    /// Human-readable reasoning for the verdict.
    pub match_reasoning: String,
}

/// Compiled rule engine. Read-only after construction.
#[derive(Debug, Default)]
pub struct RuleEngine {
    exclusion: Vec<Regex>,
    non_covered_labor: Vec<Regex>,
    consumable: Vec<Regex>,
    fluid: Vec<Regex>,
    covered: Vec<(String, Regex)>,
}

fn compile(field: &str, patterns: &[String]) -> Result<Vec<Regex>, ConfigError> {
    patterns
        .iter()
        .map(|p| {
            RegexBuilder::new(p)
                .case_insensitive(true)
                .build()
                .map_err(|e| ConfigError::InvalidValue {
                    field: field.to_string(),
                    message: format!("invalid regex '{p}': {e}"),
                })
        })
        .collect()
}

impl RuleEngine {
    /// Compile all patterns. Fails on the first invalid regex.
    pub fn new(config: &RuleConfig) -> Result<Self, ConfigError> {
        let mut covered = Vec::new();
        for (category, patterns) in &config.covered_patterns {
            for regex in compile("rules.covered_patterns", patterns)? {
                covered.push((category.clone(), regex));
            }
        }
        Ok(Self {
            exclusion: compile("rules.exclusion_patterns", &config.exclusion_patterns)?,
            non_covered_labor: compile(
                "rules.non_covered_labor_patterns",
                &config.non_covered_labor_patterns,
            )?,
            consumable: compile("rules.consumable_patterns", &config.consumable_patterns)?,
            fluid: compile("rules.fluid_patterns", &config.fluid_patterns)?,
            covered,
        })
    }

    /// Whether the description matches any exclusion pattern.
    ///
    /// Used by the repair-context extractor to discard keyword hits inside
    /// excluded work (e.g. "culasse" inside "couvre culasse").
    pub fn matches_exclusion(&self, description: &str) -> bool {
        self.exclusion.iter().any(|r| r.is_match(description))
    }

    /// Check a description against the non-covered labor patterns.
    ///
    /// Also used by the part-number stage to re-check labor items that a
    /// keyword-sourced lookup marked COVERED.
    pub fn check_non_covered_labor(&self, description: &str) -> Option<RuleMatch> {
        self.non_covered_labor
            .iter()
            .find(|r| r.is_match(description))
            .map(|r| RuleMatch {
                pattern: r.as_str().to_string(),
                match_reasoning: format!(
                    "Labor matches non-covered pattern '{}'",
                    r.as_str()
                ),
            })
    }

    fn classify(
        &self,
        description: &str,
        item_type: &str,
        skip_consumable_check: bool,
    ) -> Option<(CoverageStatus, Option<String>, Option<String>, String)> {
        for regex in &self.exclusion {
            if regex.is_match(description) {
                return Some((
                    CoverageStatus::NotCovered,
                    Some("excluded_by_rule".to_string()),
                    None,
                    format!("Description matches exclusion pattern '{}'", regex.as_str()),
                ));
            }
        }

        if is_labor_type(item_type) {
            if let Some(hit) = self.check_non_covered_labor(description) {
                return Some((
                    CoverageStatus::NotCovered,
                    Some("non_covered_labor".to_string()),
                    None,
                    hit.match_reasoning,
                ));
            }
        }

        if !skip_consumable_check {
            for regex in &self.consumable {
                if regex.is_match(description) {
                    return Some((
                        CoverageStatus::NotCovered,
                        Some("consumable".to_string()),
                        None,
                        format!(
                            "Description matches consumable pattern '{}'",
                            regex.as_str()
                        ),
                    ));
                }
            }
        }

        for regex in &self.fluid {
            if regex.is_match(description) {
                return Some((
                    CoverageStatus::NotCovered,
                    Some("fluid".to_string()),
                    None,
                    format!("Description matches fluid pattern '{}'", regex.as_str()),
                ));
            }
        }

        for (category, regex) in &self.covered {
            if regex.is_match(description) {
                return Some((
                    CoverageStatus::Covered,
                    None,
                    Some(category.clone()),
                    format!(
                        "Description matches covered pattern '{}' for category '{category}'",
                        regex.as_str()
                    ),
                ));
            }
        }

        None
    }

    /// Classify a batch of items. Matched items get a verdict at confidence
    /// 1.0; unmatched items are returned for the next stage untouched.
    ///
    /// `skip_consumable_check` is set by the caller when the repair context
    /// indicates a covered primary component; `repair_context_component` is
    /// recorded in the trace of skipped consumable checks.
    pub fn batch_match(
        &self,
        items: Vec<PendingItem>,
        skip_consumable_check: bool,
        repair_context_component: Option<&str>,
    ) -> (Vec<LineItemCoverage>, Vec<PendingItem>) {
        let mut matched = Vec::new();
        let mut remaining = Vec::new();

        for pending in items {
            let verdict = self.classify(
                &pending.item.description,
                &pending.item.item_type,
                skip_consumable_check,
            );
            match verdict {
                Some((status, exclusion_reason, category, reasoning)) => {
                    let action = if status == CoverageStatus::Covered {
                        TraceAction::Matched
                    } else {
                        TraceAction::Excluded
                    };
                    let mut detail = serde_json::json!({});
                    if skip_consumable_check {
                        detail = serde_json::json!({
                            "consumable_check_skipped": true,
                            "repair_context_component": repair_context_component,
                        });
                    }
                    let mut tb = TraceBuilder::new();
                    tb.extend(&pending.deferred_trace);
                    tb.add(
                        TraceStep::new("rules", action, reasoning.clone())
                            .with_verdict(status)
                            .with_confidence(1.0)
                            .with_detail(detail),
                    );
                    tracing::debug!(
                        description = %pending.item.description,
                        status = ?status,
                        "Rule engine verdict",
                    );
                    matched.push(LineItemCoverage {
                        coverage_status: status,
                        coverage_category: category,
                        match_method: MatchMethod::Rule,
                        match_confidence: 1.0,
                        match_reasoning: reasoning,
                        exclusion_reason,
                        decision_trace: tb.build(),
                        ..LineItemCoverage::from_item(pending.index, &pending.item)
                    });
                }
                None => remaining.push(pending),
            }
        }

        (matched, remaining)
    }
}
