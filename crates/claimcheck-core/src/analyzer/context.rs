//! Repair-context extraction (pipeline stage 0).
//!
//! Scans labor descriptions for repair keywords to identify the primary
//! component being worked on before any item is classified. The context
//! steers later stages: it suppresses false consumable denials (an oil
//! cooler repair must not be denied over the oil-filter rule), feeds the
//! LLM prompt, and anchors the reconciliation passes.

use std::collections::BTreeMap;

use super::policy;
use crate::config::ComponentConfig;
use crate::rules::RuleEngine;
use crate::types::{LineItem, Trilean};

/// Context about the primary repair, extracted from labor descriptions.
#[derive(Debug, Clone)]
pub struct RepairContext {
    /// Primary component being repaired (e.g. "oil_cooler").
    pub primary_component: Option<String>,
    /// Category of the primary component (e.g. "engine").
    pub primary_category: Option<String>,
    /// Whether the primary component is covered by the policy.
    pub is_covered: Trilean,
    /// Labor description that established the context.
    pub source_description: Option<String>,
    /// Components detected across all labor items, deduplicated.
    pub all_detected_components: Vec<String>,
}

impl Default for RepairContext {
    fn default() -> Self {
        Self {
            primary_component: None,
            primary_category: None,
            is_covered: Trilean::No,
            source_description: None,
            all_detected_components: Vec::new(),
        }
    }
}

/// Categories with a non-empty covered-parts list.
pub(crate) fn extract_covered_categories(
    covered_components: &BTreeMap<String, Vec<String>>,
) -> Vec<String> {
    covered_components
        .iter()
        .filter(|(_, parts)| !parts.is_empty())
        .map(|(cat, _)| cat.clone())
        .collect()
}

/// Extract the repair context from a claim's labor items.
///
/// For each labor item, the longest matching repair keyword wins. Keyword
/// hits inside descriptions matching a rule-engine exclusion pattern are
/// discarded (prevents false positives like "culasse" inside "couvre
/// culasse"). The first item that yields a match sets the primary
/// component; coverage is determined by a strict policy-list lookup, then
/// by the representative-not-exhaustive doctrine (category covered and
/// component not explicitly excluded).
pub(crate) fn extract_repair_context(
    line_items: &[LineItem],
    covered_components: &BTreeMap<String, Vec<String>>,
    excluded_components: &BTreeMap<String, Vec<String>>,
    config: &ComponentConfig,
    rules: &RuleEngine,
) -> RepairContext {
    let mut context = RepairContext::default();
    let mut detected: Vec<String> = Vec::new();

    for item in line_items {
        if !crate::normalize::is_labor_type(&item.item_type) {
            continue;
        }
        let description_lower = item.description.to_lowercase();
        if description_lower.is_empty() {
            continue;
        }

        // Longest keyword = most specific
        let best = config
            .repair_context_keywords
            .iter()
            .filter(|(keyword, _)| description_lower.contains(keyword.as_str()))
            .max_by_key(|(keyword, _)| keyword.len());

        let Some((keyword, target)) = best else {
            continue;
        };

        if rules.matches_exclusion(&item.description) {
            tracing::info!(
                keyword = %keyword,
                description = %item.description,
                "Repair context: skipping keyword - matches exclusion pattern",
            );
            continue;
        }

        if !detected.contains(&target.component) {
            detected.push(target.component.clone());
        }

        if context.primary_component.is_some() {
            continue;
        }

        context.primary_component = Some(target.component.clone());
        context.primary_category = Some(target.category.clone());
        context.source_description = Some(item.description.clone());

        let (in_list, _) = policy::is_component_in_policy_list(
            config,
            Some(&target.component),
            Some(&target.category),
            covered_components,
            "",
            true,
        );

        if in_list.is_yes() {
            context.is_covered = Trilean::Yes;
        } else {
            // Not in the covered list: policy lists are representative, not
            // exhaustive. A covered category plus no explicit exclusion
            // still means covered.
            let covered_categories = extract_covered_categories(covered_components);
            let category_covered =
                policy::is_system_covered(config, Some(&target.category), &covered_categories);
            let excluded = policy::is_component_excluded_by_policy(
                config,
                &target.component,
                &target.category,
                &item.description,
                excluded_components,
            );
            if category_covered && !excluded {
                context.is_covered = Trilean::Yes;
                tracing::info!(
                    component = %target.component,
                    category = %target.category,
                    "Repair context: category covered, part not listed, not excluded -> covered",
                );
            } else {
                context.is_covered = Trilean::No;
            }
        }
    }

    context.all_detected_components = detected;

    if let Some(component) = &context.primary_component {
        tracing::info!(
            component = %component,
            category = context.primary_category.as_deref().unwrap_or(""),
            covered = ?context.is_covered,
            "Extracted repair context",
        );
    }

    context
}
