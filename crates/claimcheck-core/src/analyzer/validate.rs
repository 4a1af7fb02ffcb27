//! Post-LLM validation (part of pipeline stage 6).
//!
//! A safety net against LLM category-inference errors, run on every
//! LLM-classified item:
//!
//! - items on the excluded list are forced NOT_COVERED, except labor
//!   (exclusions target replacement parts, not access work) and
//!   ancillaries supporting a covered repair
//! - a NOT_COVERED verdict is overridden to COVERED when a known synonym
//!   in the description is confirmed against the policy list (the LLM
//!   missed a synonym the deterministic lookup knows)
//! - a COVERED verdict with a category the policy does not cover at all is
//!   demoted to REVIEW_NEEDED

use std::collections::BTreeMap;

use super::context::RepairContext;
use super::policy;
use crate::config::ComponentConfig;
use crate::normalize::is_labor_type;
use crate::trace::TraceBuilder;
use crate::types::{CoverageStatus, LineItemCoverage, MatchMethod, TraceAction, TraceStep};

fn append_step(item: &mut LineItemCoverage, step: TraceStep) {
    let mut tb = TraceBuilder::new();
    tb.extend(&item.decision_trace);
    tb.add(step);
    item.decision_trace = tb.build();
}

/// Validate and potentially override one LLM coverage decision. Appends
/// exactly one `llm_validation` trace step describing the outcome.
pub(crate) fn validate_llm_decision(
    item: &mut LineItemCoverage,
    config: &ComponentConfig,
    covered_components: &BTreeMap<String, Vec<String>>,
    excluded_components: &BTreeMap<String, Vec<String>>,
    repair_context: &RepairContext,
) {
    if item.match_method != MatchMethod::Llm {
        return;
    }

    let desc_lower = item.description.to_lowercase();
    let is_labor = is_labor_type(&item.item_type);
    let mut exclusion_skip_note: Option<String> = None;

    // Excluded-list override. Labor is exempt; ancillaries under a covered
    // repair context are exempt.
    if !is_labor && policy::is_in_excluded_list(&item.description, excluded_components) {
        let is_ancillary = repair_context.is_covered.is_yes()
            && config
                .ancillary_keywords
                .iter()
                .any(|kw| desc_lower.contains(kw.as_str()));
        if is_ancillary {
            tracing::info!(
                description = %item.description,
                component = repair_context.primary_component.as_deref().unwrap_or(""),
                "Exclusion skipped: ancillary to covered repair",
            );
            exclusion_skip_note = Some(format!(
                "Exclusion skipped: ancillary to covered repair '{}'",
                repair_context.primary_component.as_deref().unwrap_or("")
            ));
        } else {
            let original_status = item.coverage_status;
            item.coverage_status = CoverageStatus::NotCovered;
            item.exclusion_reason = Some("component_excluded".to_string());
            item.match_reasoning
                .push_str(" [OVERRIDE: Component is in excluded list]");
            append_step(
                item,
                TraceStep::new(
                    "llm_validation",
                    TraceAction::Overridden,
                    "Component is in excluded list",
                )
                .with_verdict(CoverageStatus::NotCovered)
                .with_detail(serde_json::json!({"check": "excluded_list"})),
            );
            tracing::info!(
                description = %item.description,
                original = ?original_status,
                "LLM validation override: item is in excluded list",
            );
            return;
        }
    }

    // Synonym override: the LLM said NOT_COVERED but a known synonym in
    // the description is confirmed in the policy list.
    if item.coverage_status == CoverageStatus::NotCovered {
        if let Some(category) = item.coverage_category.clone() {
            let covered_categories: Vec<String> = covered_components.keys().cloned().collect();
            if policy::is_system_covered(config, Some(&category), &covered_categories) {
                let gasket_hit = config
                    .gasket_seal_indicators
                    .iter()
                    .any(|ind| desc_lower.contains(ind.to_lowercase().as_str()));
                for (comp_type, synonyms) in &config.component_synonyms {
                    for synonym in synonyms {
                        // Short synonyms produce false positives
                        if synonym.chars().count() < 4 {
                            continue;
                        }
                        if !desc_lower.contains(synonym.as_str())
                            && !synonym.contains(desc_lower.as_str())
                        {
                            continue;
                        }
                        // A gasket/seal indicator means the synonym names
                        // the component the gasket seals, not the item.
                        if gasket_hit {
                            tracing::info!(
                                description = %item.description,
                                "Synonym override blocked: gasket/seal indicator present",
                            );
                            continue;
                        }
                        let (is_in_list, reason) = policy::is_component_in_policy_list(
                            config,
                            Some(comp_type),
                            Some(&category),
                            covered_components,
                            &item.description,
                            false,
                        );
                        if is_in_list.is_yes() {
                            let original_status = item.coverage_status;
                            item.coverage_status = CoverageStatus::Covered;
                            item.matched_component = Some(comp_type.clone());
                            item.match_confidence = item.match_confidence.max(0.75);
                            item.match_reasoning.push_str(&format!(
                                " [SYNONYM OVERRIDE: '{}' matches '{synonym}' -> '{comp_type}', confirmed in policy: {reason}]",
                                item.description
                            ));
                            let confidence = item.match_confidence;
                            append_step(
                                item,
                                TraceStep::new(
                                    "llm_validation",
                                    TraceAction::Overridden,
                                    format!("Synonym override: '{synonym}' -> '{comp_type}', {reason}"),
                                )
                                .with_verdict(CoverageStatus::Covered)
                                .with_confidence(confidence)
                                .with_detail(serde_json::json!({
                                    "check": "synonym_override",
                                    "component": comp_type,
                                    "synonym": synonym,
                                    "policy_reason": reason,
                                })),
                            );
                            tracing::info!(
                                description = %item.description,
                                original = ?original_status,
                                synonym = %synonym,
                                component = %comp_type,
                                "Post-LLM synonym override to COVERED",
                            );
                            return;
                        }
                    }
                }
            }
        }
    }

    // Category check: a COVERED verdict in a category the policy does not
    // cover at all cannot stand.
    if item.coverage_status == CoverageStatus::Covered {
        let covered_categories: Vec<String> = covered_components.keys().cloned().collect();
        let category_is_covered = policy::is_system_covered(
            config,
            item.coverage_category.as_deref(),
            &covered_categories,
        );
        if !category_is_covered {
            let category = item.coverage_category.clone().unwrap_or_default();
            item.coverage_status = CoverageStatus::ReviewNeeded;
            item.exclusion_reason = Some("category_not_covered".to_string());
            item.match_confidence = 0.45;
            item.match_reasoning.push_str(&format!(
                " [REVIEW: category '{category}' is not covered by policy]"
            ));
            append_step(
                item,
                TraceStep::new(
                    "llm_validation",
                    TraceAction::Overridden,
                    format!("Category '{category}' is not covered by policy"),
                )
                .with_verdict(CoverageStatus::ReviewNeeded)
                .with_confidence(0.45)
                .with_detail(serde_json::json!({
                    "check": "category_not_covered",
                    "category": category,
                })),
            );
            tracing::info!(
                description = %item.description,
                category = %category,
                "LLM validation override: COVERED to REVIEW_NEEDED",
            );
            return;
        }
    }

    let message = exclusion_skip_note.unwrap_or_else(|| "No override needed".to_string());
    let verdict = item.coverage_status;
    append_step(
        item,
        TraceStep::new("llm_validation", TraceAction::Validated, message).with_verdict(verdict),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{LineItem, Trilean};
    use rust_decimal::Decimal;

    fn config() -> ComponentConfig {
        serde_yaml::from_str::<ComponentConfig>(
            r#"
component_synonyms:
  oil_cooler: ["ölkühler", "oelkuehler"]
  egr: ["agr"]
gasket_seal_indicators: ["JOINT", "DICHTUNG"]
ancillary_keywords: ["schraube", "dichtung"]
"#,
        )
        .unwrap()
        .normalized()
    }

    fn llm_item(description: &str, status: CoverageStatus, category: Option<&str>) -> LineItemCoverage {
        let line = LineItem {
            description: description.to_string(),
            item_type: "parts".to_string(),
            total_price: Decimal::from(300),
            ..LineItem::default()
        };
        LineItemCoverage {
            coverage_status: status,
            match_method: MatchMethod::Llm,
            match_confidence: 0.7,
            coverage_category: category.map(str::to_string),
            ..LineItemCoverage::from_item(0, &line)
        }
    }

    fn covered() -> BTreeMap<String, Vec<String>> {
        BTreeMap::from([(
            "engine".to_string(),
            vec!["Ölkühler".to_string()],
        )])
    }

    #[test]
    fn excluded_item_is_forced_not_covered() {
        let excluded = BTreeMap::from([(
            "body".to_string(),
            vec!["Zierleiste".to_string()],
        )]);
        let mut item = llm_item("Zierleiste chrom", CoverageStatus::Covered, Some("engine"));
        validate_llm_decision(
            &mut item,
            &config(),
            &covered(),
            &excluded,
            &RepairContext::default(),
        );
        assert_eq!(item.coverage_status, CoverageStatus::NotCovered);
        assert_eq!(item.exclusion_reason.as_deref(), Some("component_excluded"));
    }

    #[test]
    fn labor_is_exempt_from_exclusion_override() {
        let excluded = BTreeMap::from([(
            "engine".to_string(),
            vec!["Einbau".to_string()],
        )]);
        let mut item = llm_item("Einbau", CoverageStatus::Covered, Some("engine"));
        item.item_type = "labor".to_string();
        validate_llm_decision(
            &mut item,
            &config(),
            &covered(),
            &excluded,
            &RepairContext::default(),
        );
        assert_eq!(item.coverage_status, CoverageStatus::Covered);
    }

    #[test]
    fn ancillary_under_covered_repair_escapes_exclusion() {
        let excluded = BTreeMap::from([(
            "engine".to_string(),
            vec!["Schraube".to_string()],
        )]);
        let ctx = RepairContext {
            primary_component: Some("oil_cooler".to_string()),
            primary_category: Some("engine".to_string()),
            is_covered: Trilean::Yes,
            source_description: None,
            all_detected_components: vec![],
        };
        let mut item = llm_item("Schraube Satz", CoverageStatus::Covered, Some("engine"));
        validate_llm_decision(&mut item, &config(), &covered(), &excluded, &ctx);
        assert_eq!(item.coverage_status, CoverageStatus::Covered);
        let last = item.decision_trace.last().unwrap();
        assert_eq!(last.action, TraceAction::Validated);
        assert!(last.message.contains("ancillary"));
    }

    #[test]
    fn synonym_override_promotes_missed_component() {
        let mut item = llm_item("Ölkühler defekt", CoverageStatus::NotCovered, Some("engine"));
        validate_llm_decision(
            &mut item,
            &config(),
            &covered(),
            &BTreeMap::new(),
            &RepairContext::default(),
        );
        assert_eq!(item.coverage_status, CoverageStatus::Covered);
        assert_eq!(item.matched_component.as_deref(), Some("oil_cooler"));
        assert!(item.match_confidence >= 0.75);
    }

    #[test]
    fn gasket_indicator_blocks_synonym_override() {
        let mut item = llm_item(
            "Joint de ölkühler",
            CoverageStatus::NotCovered,
            Some("engine"),
        );
        validate_llm_decision(
            &mut item,
            &config(),
            &covered(),
            &BTreeMap::new(),
            &RepairContext::default(),
        );
        assert_eq!(item.coverage_status, CoverageStatus::NotCovered);
    }

    #[test]
    fn short_synonyms_never_override() {
        // "agr" is only 3 chars; even though it appears in the description
        // it must not trigger the override
        let mut item = llm_item("AGR Ventil", CoverageStatus::NotCovered, Some("engine"));
        validate_llm_decision(
            &mut item,
            &config(),
            &covered(),
            &BTreeMap::new(),
            &RepairContext::default(),
        );
        assert_eq!(item.coverage_status, CoverageStatus::NotCovered);
    }

    #[test]
    fn covered_verdict_in_uncovered_category_is_demoted() {
        let mut item = llm_item("Bremsscheibe", CoverageStatus::Covered, Some("brakes"));
        validate_llm_decision(
            &mut item,
            &config(),
            &covered(),
            &BTreeMap::new(),
            &RepairContext::default(),
        );
        assert_eq!(item.coverage_status, CoverageStatus::ReviewNeeded);
        assert_eq!(
            item.exclusion_reason.as_deref(),
            Some("category_not_covered")
        );
        assert!((item.match_confidence - 0.45).abs() < f64::EPSILON);
    }

    #[test]
    fn confirmed_decision_gets_validated_step() {
        let mut item = llm_item("Ölkühler", CoverageStatus::Covered, Some("engine"));
        validate_llm_decision(
            &mut item,
            &config(),
            &covered(),
            &BTreeMap::new(),
            &RepairContext::default(),
        );
        assert_eq!(item.coverage_status, CoverageStatus::Covered);
        let last = item.decision_trace.last().unwrap();
        assert_eq!(last.action, TraceAction::Validated);
        assert_eq!(last.message, "No override needed");
    }

    #[test]
    fn non_llm_items_are_untouched() {
        let mut item = llm_item("Zierleiste", CoverageStatus::Covered, Some("engine"));
        item.match_method = MatchMethod::Keyword;
        let excluded = BTreeMap::from([(
            "body".to_string(),
            vec!["Zierleiste".to_string()],
        )]);
        validate_llm_decision(
            &mut item,
            &config(),
            &covered(),
            &excluded,
            &RepairContext::default(),
        );
        assert_eq!(item.coverage_status, CoverageStatus::Covered);
        assert!(item.decision_trace.is_empty());
    }
}
