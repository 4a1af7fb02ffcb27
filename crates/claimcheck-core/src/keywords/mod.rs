//! Language-specific keyword matcher (pipeline stage 3).
//!
//! Maps invoice terms to policy categories with a per-term confidence.
//! A match yields a candidate COVERED classification only when the term's
//! category is covered by the policy; every keyword match is subsequently
//! verified against the policy's explicit parts list (stage 5), which may
//! demote it back to the LLM.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::trace::TraceBuilder;
use crate::types::{
    CoverageStatus, LineItemCoverage, MatchMethod, PendingItem, TraceAction, TraceStep,
};

/// One keyword taxonomy entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeywordMapping {
    /// Policy category the term maps into.
    pub category: String,
    /// Confidence of the mapping.
    pub confidence: f64,
    /// Canonical component name, when the term identifies one. Matches
    /// without a component are verified against the policy list through
    /// the item description instead.
    #[serde(default)]
    pub component: Option<String>,
}

/// Keyword taxonomy, loaded from the `keywords` config section or a
/// sibling `*_keyword_mappings.yaml` file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeywordConfig {
    /// Lower-cased term -> mapping.
    #[serde(default)]
    pub mappings: BTreeMap<String, KeywordMapping>,
}

/// Keyword matcher. Read-only after construction.
#[derive(Debug, Default)]
pub struct KeywordMatcher {
    config: KeywordConfig,
}

impl KeywordMatcher {
    /// Create a matcher over a taxonomy. Terms are matched lower-cased.
    pub fn new(config: KeywordConfig) -> Self {
        let mappings = config
            .mappings
            .into_iter()
            .map(|(k, v)| (k.to_lowercase(), v))
            .collect();
        Self {
            config: KeywordConfig { mappings },
        }
    }

    /// Find the best (longest) matching term for a description.
    fn best_match(&self, description_lower: &str) -> Option<(&str, &KeywordMapping)> {
        let mut best: Option<(&str, &KeywordMapping)> = None;
        for (term, mapping) in &self.config.mappings {
            if description_lower.contains(term.as_str()) {
                let better = match best {
                    Some((current, _)) => term.len() > current.len(),
                    None => true,
                };
                if better {
                    best = Some((term, mapping));
                }
            }
        }
        best
    }

    /// Classify a batch of items. Items whose term maps to a covered
    /// category at or above `min_confidence` become candidate COVERED
    /// matches; everything else stays in `remaining`.
    pub fn batch_match(
        &self,
        items: Vec<PendingItem>,
        covered_categories: &[String],
        min_confidence: f64,
    ) -> (Vec<LineItemCoverage>, Vec<PendingItem>) {
        let covered_lower: Vec<String> =
            covered_categories.iter().map(|c| c.to_lowercase()).collect();
        let mut matched = Vec::new();
        let mut remaining = Vec::new();

        for pending in items {
            let description_lower = pending.item.description.to_lowercase();
            let hit = self.best_match(&description_lower);

            let Some((term, mapping)) = hit else {
                remaining.push(pending);
                continue;
            };

            if !covered_lower.contains(&mapping.category.to_lowercase()) {
                remaining.push(pending);
                continue;
            }

            if mapping.confidence < min_confidence {
                tracing::debug!(
                    term = term,
                    confidence = mapping.confidence,
                    min_confidence = min_confidence,
                    "Keyword match below confidence threshold",
                );
                remaining.push(pending);
                continue;
            }

            let reasoning = format!(
                "Keyword '{}' maps to covered category '{}'",
                term, mapping.category
            );
            let mut tb = TraceBuilder::new();
            tb.extend(&pending.deferred_trace);
            tb.add(
                TraceStep::new("keyword", TraceAction::Matched, reasoning.clone())
                    .with_verdict(CoverageStatus::Covered)
                    .with_confidence(mapping.confidence)
                    .with_detail(serde_json::json!({
                        "term": term,
                        "category": mapping.category,
                        "component": mapping.component,
                    })),
            );
            tracing::debug!(
                description = %pending.item.description,
                term = term,
                category = %mapping.category,
                "Keyword match",
            );
            matched.push(LineItemCoverage {
                coverage_status: CoverageStatus::Covered,
                coverage_category: Some(mapping.category.clone()),
                matched_component: mapping.component.clone(),
                match_method: MatchMethod::Keyword,
                match_confidence: mapping.confidence,
                match_reasoning: reasoning,
                decision_trace: tb.build(),
                ..LineItemCoverage::from_item(pending.index, &pending.item)
            });
        }

        (matched, remaining)
    }
}
