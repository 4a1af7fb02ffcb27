//! Cross-item reconciliation passes (pipeline stage 7).
//!
//! Repair invoices are messy: labor lines rarely name the part they serve,
//! gaskets and screws ride along with the component they seal, and generic
//! "Arbeit" lines carry the whole job's labor cost. These passes run after
//! per-item classification, in a fixed order, each mutating the item list
//! in place:
//!
//! 7a. labor-follows-parts (three linking strategies)
//! 7b. ancillary promotion under a covered repair context
//! 7c. parts promotion when covered labor exists for the same repair
//! 7d. orphan-labor demotion when zero parts are covered
//! 7e. nominal-price labor flagging

use rust_decimal::Decimal;

use super::context::RepairContext;
use crate::config::ComponentConfig;
use crate::normalize::{clean_item_code, is_generic_labor_description, is_labor_type, is_parts_type};
use crate::trace::TraceBuilder;
use crate::types::{CoverageStatus, LineItemCoverage, MatchMethod, TraceAction, TraceStep};

fn append_step(item: &mut LineItemCoverage, step: TraceStep) {
    let mut tb = TraceBuilder::new();
    tb.extend(&item.decision_trace);
    tb.add(step);
    item.decision_trace = tb.build();
}

#[derive(Debug, Clone)]
struct CoveredPartSnapshot {
    category: Option<String>,
    component: Option<String>,
    description: String,
    price: Decimal,
    clean_code: Option<String>,
}

fn covered_parts_snapshot(items: &[LineItemCoverage]) -> Vec<CoveredPartSnapshot> {
    items
        .iter()
        .filter(|i| i.coverage_status == CoverageStatus::Covered && is_parts_type(&i.item_type))
        .map(|i| CoveredPartSnapshot {
            category: i.coverage_category.clone(),
            component: i.matched_component.clone(),
            description: i.description.clone(),
            price: i.total_price,
            clean_code: i
                .item_code
                .as_deref()
                .map(clean_item_code)
                .filter(|c| c.len() >= 4),
        })
        .collect()
}

/// 7a. Promote labor items to COVERED when they reference covered parts.
///
/// Strategies, in order:
/// 1. part-number-in-description: a covered part's cleaned code appears in
///    the labor description
/// 2. simple-invoice rule: generic labor ("Arbeit", "Main d'œuvre") linked
///    to the first covered part -- only the single highest-priced generic
///    labor line, and only when labor is not disproportionate (> 2x the
///    covered parts value)
/// 3. repair-context keyword: the labor names a component with covered
///    parts in the same category, unless an excluded-part guard blocks it
pub(crate) fn apply_labor_follows_parts(items: &mut [LineItemCoverage], config: &ComponentConfig) {
    let covered_parts = covered_parts_snapshot(items);

    // Strategy 1: part-number matching
    let parts_by_code: Vec<&CoveredPartSnapshot> = covered_parts
        .iter()
        .filter(|p| p.clean_code.is_some())
        .collect();
    if !parts_by_code.is_empty() {
        for item in items.iter_mut() {
            if !is_labor_type(&item.item_type)
                || item.coverage_status == CoverageStatus::Covered
            {
                continue;
            }
            let desc_alphanum: String = item
                .description
                .to_uppercase()
                .chars()
                .filter(|c| c.is_alphanumeric() || c.is_whitespace())
                .collect();
            for part in &parts_by_code {
                let code = part.clean_code.as_deref().unwrap_or_default();
                if desc_alphanum.contains(code) {
                    item.coverage_status = CoverageStatus::Covered;
                    item.coverage_category = part.category.clone();
                    item.matched_component = part.component.clone();
                    item.match_confidence = 0.85;
                    item.match_reasoning = format!(
                        "Labor for covered part: {} (matched part number: {code})",
                        part.description
                    );
                    append_step(
                        item,
                        TraceStep::new(
                            "labor_follows_parts",
                            TraceAction::Promoted,
                            format!("Labor linked to covered part via part number {code}"),
                        )
                        .with_verdict(CoverageStatus::Covered)
                        .with_confidence(0.85)
                        .with_detail(serde_json::json!({
                            "strategy": "part_number_in_description",
                            "linked_part_code": code,
                        })),
                    );
                    tracing::debug!(
                        description = %item.description,
                        code = code,
                        "Labor promoted via part number in description",
                    );
                    break;
                }
            }
        }
    }

    // Strategy 2: simple-invoice rule. Promote only the single
    // highest-priced generic labor line to avoid over-counting when
    // invoices list several generic "Arbeit" entries.
    if let Some(linked_part) = covered_parts.first().cloned() {
        let total_parts_value: Decimal = covered_parts.iter().map(|p| p.price).sum();
        let target = items
            .iter()
            .enumerate()
            .filter(|(_, i)| {
                is_labor_type(&i.item_type)
                    && i.coverage_status != CoverageStatus::Covered
                    && is_generic_labor_description(&i.description)
            })
            .max_by(|(_, a), (_, b)| a.total_price.cmp(&b.total_price))
            .map(|(idx, _)| idx);

        if let Some(idx) = target {
            let labor_item = &mut items[idx];
            if total_parts_value > Decimal::ZERO
                && labor_item.total_price > Decimal::from(2) * total_parts_value
            {
                tracing::info!(
                    labor = %labor_item.total_price,
                    parts = %total_parts_value,
                    description = %labor_item.description,
                    "Simple invoice rule skipped: labor disproportionate to parts",
                );
                let labor_price = labor_item.total_price;
                append_step(
                    labor_item,
                    TraceStep::new(
                        "labor_follows_parts",
                        TraceAction::Skipped,
                        format!(
                            "Simple invoice rule: labor {labor_price} > 2x parts {total_parts_value} (disproportionate)"
                        ),
                    )
                    .with_detail(serde_json::json!({
                        "strategy": "simple_invoice_rule",
                        "skip_reason": "proportionality_guard",
                        "labor_price": labor_price.to_string(),
                        "covered_parts_value": total_parts_value.to_string(),
                    })),
                );
            } else {
                labor_item.coverage_status = CoverageStatus::Covered;
                labor_item.coverage_category = linked_part.category.clone();
                labor_item.matched_component = linked_part.component.clone();
                labor_item.match_confidence = 0.75;
                labor_item.match_reasoning = format!(
                    "Simple invoice rule: generic labor linked to covered part '{}' ({})",
                    linked_part.description,
                    linked_part.category.as_deref().unwrap_or("")
                );
                append_step(
                    labor_item,
                    TraceStep::new(
                        "labor_follows_parts",
                        TraceAction::Promoted,
                        format!("Simple invoice rule: linked to '{}'", linked_part.description),
                    )
                    .with_verdict(CoverageStatus::Covered)
                    .with_confidence(0.75)
                    .with_detail(serde_json::json!({
                        "strategy": "simple_invoice_rule",
                        "linked_to": linked_part.description,
                    })),
                );
                tracing::debug!(
                    description = %items[idx].description,
                    "Labor promoted via simple invoice rule",
                );
            }
        }
    }

    // Strategy 3: repair-context keyword matching, with excluded-part guards.
    if !covered_parts.is_empty() {
        let excluded_codes: Vec<String> = items
            .iter()
            .filter(|i| {
                i.coverage_status == CoverageStatus::NotCovered && is_parts_type(&i.item_type)
            })
            .filter_map(|i| i.item_code.as_deref().map(clean_item_code))
            .filter(|c| c.len() >= 4)
            .collect();
        let excluded_components: Vec<String> = items
            .iter()
            .filter(|i| {
                i.coverage_status == CoverageStatus::NotCovered && is_parts_type(&i.item_type)
            })
            .filter_map(|i| i.matched_component.as_ref().map(|c| c.to_lowercase()))
            .collect();

        for item in items.iter_mut() {
            if !is_labor_type(&item.item_type)
                || item.coverage_status == CoverageStatus::Covered
            {
                continue;
            }
            let desc_lower = item.description.to_lowercase();
            for (keyword, target) in &config.repair_context_keywords {
                if !desc_lower.contains(keyword.as_str()) {
                    continue;
                }

                if let Some(labor_code) = item.item_code.as_deref().map(clean_item_code) {
                    if excluded_codes.contains(&labor_code) {
                        tracing::debug!(
                            description = %item.description,
                            code = %labor_code,
                            "Labor promotion blocked: item code matches excluded part",
                        );
                        append_step(
                            item,
                            TraceStep::new(
                                "labor_follows_parts",
                                TraceAction::Skipped,
                                format!(
                                    "Excluded-part guard: item_code {labor_code} matches a NOT_COVERED part"
                                ),
                            )
                            .with_detail(serde_json::json!({
                                "reason": "excluded_part_guard",
                                "strategy": "repair_context_keyword",
                                "blocked_by": "item_code_match",
                            })),
                        );
                        continue;
                    }
                }

                if excluded_components.contains(&target.component.to_lowercase()) {
                    tracing::debug!(
                        description = %item.description,
                        component = %target.component,
                        "Labor promotion blocked: component matches excluded part",
                    );
                    append_step(
                        item,
                        TraceStep::new(
                            "labor_follows_parts",
                            TraceAction::Skipped,
                            format!(
                                "Excluded-part guard: component '{}' matches a NOT_COVERED part's component",
                                target.component
                            ),
                        )
                        .with_detail(serde_json::json!({
                            "reason": "excluded_part_guard",
                            "strategy": "repair_context_keyword",
                            "blocked_by": "component_match",
                        })),
                    );
                    continue;
                }

                let matching_covered = covered_parts
                    .iter()
                    .filter(|p| {
                        p.category
                            .as_deref()
                            .is_some_and(|c| c.eq_ignore_ascii_case(&target.category))
                    })
                    .count();
                if matching_covered > 0 {
                    item.coverage_status = CoverageStatus::Covered;
                    item.coverage_category = Some(target.category.clone());
                    item.matched_component = Some(target.component.clone());
                    item.match_confidence = 0.80;
                    item.match_reasoning = format!(
                        "Labor for covered repair: '{keyword}' matches {matching_covered} covered {} parts",
                        target.category
                    );
                    append_step(
                        item,
                        TraceStep::new(
                            "labor_follows_parts",
                            TraceAction::Promoted,
                            format!(
                                "Repair context keyword '{keyword}' linked to {}",
                                target.category
                            ),
                        )
                        .with_verdict(CoverageStatus::Covered)
                        .with_confidence(0.80)
                        .with_detail(serde_json::json!({
                            "strategy": "repair_context_keyword",
                            "keyword": keyword,
                            "linked_to": target.category,
                        })),
                    );
                    tracing::debug!(
                        description = %item.description,
                        keyword = %keyword,
                        "Labor promoted via repair context keyword",
                    );
                    break;
                }
            }
        }
    }
}

/// 7b. Promote ancillary parts (gaskets, screws, seals) to COVERED when a
/// covered repair context is active and at least one part is COVERED.
/// Repairs are grouped jobs: ancillaries used alongside covered parts are
/// included in coverage.
pub(crate) fn promote_ancillary_parts(
    items: &mut [LineItemCoverage],
    repair_context: &RepairContext,
    config: &ComponentConfig,
) {
    if !repair_context.is_covered.is_yes() {
        return;
    }
    let has_covered_parts = items
        .iter()
        .any(|i| i.coverage_status == CoverageStatus::Covered && is_parts_type(&i.item_type));
    if !has_covered_parts {
        return;
    }

    for item in items.iter_mut() {
        if item.coverage_status == CoverageStatus::Covered || !is_parts_type(&item.item_type) {
            continue;
        }
        let desc_lower = item.description.to_lowercase();
        let hit = config
            .ancillary_keywords
            .iter()
            .find(|kw| desc_lower.contains(kw.as_str()));
        if let Some(pattern) = hit {
            item.coverage_status = CoverageStatus::Covered;
            item.coverage_category = repair_context.primary_category.clone();
            item.matched_component = repair_context.primary_component.clone();
            item.match_confidence = 0.70;
            item.match_reasoning = format!(
                "Ancillary part for covered repair: '{pattern}' linked to {}",
                repair_context.primary_component.as_deref().unwrap_or("")
            );
            append_step(
                item,
                TraceStep::new(
                    "ancillary_promotion",
                    TraceAction::Promoted,
                    format!(
                        "Ancillary part '{pattern}' linked to {}",
                        repair_context.primary_component.as_deref().unwrap_or("")
                    ),
                )
                .with_verdict(CoverageStatus::Covered)
                .with_confidence(0.70)
                .with_detail(serde_json::json!({
                    "pattern": pattern,
                    "repair_component": repair_context.primary_component,
                })),
            );
            tracing::debug!(
                description = %item.description,
                pattern = %pattern,
                "Ancillary part promoted",
            );
        }
    }
}

/// 7c. Promote LLM-classified parts to COVERED when the repair context
/// identifies a covered component and covered labor exists in the same
/// category. Overrides the LLM's miss on the policy list -- if the labor
/// for the repair is covered, the replacement part is too.
pub(crate) fn promote_parts_for_covered_repair(
    items: &mut [LineItemCoverage],
    repair_context: &RepairContext,
) {
    if !repair_context.is_covered.is_yes() {
        return;
    }
    let (Some(component), Some(category)) = (
        repair_context.primary_component.as_ref(),
        repair_context.primary_category.as_ref(),
    ) else {
        return;
    };

    let has_covered_labor = items.iter().any(|i| {
        i.coverage_status == CoverageStatus::Covered
            && is_labor_type(&i.item_type)
            && i.coverage_category
                .as_deref()
                .is_some_and(|c| c.eq_ignore_ascii_case(category))
    });
    if !has_covered_labor {
        return;
    }

    for item in items.iter_mut() {
        if item.coverage_status == CoverageStatus::Covered || !is_parts_type(&item.item_type) {
            continue;
        }
        // Only override LLM decisions, not deterministic rule exclusions
        if item.match_method != MatchMethod::Llm {
            continue;
        }
        if !item
            .coverage_category
            .as_deref()
            .is_some_and(|c| c.eq_ignore_ascii_case(category))
        {
            continue;
        }

        item.coverage_status = CoverageStatus::Covered;
        item.coverage_category = Some(category.clone());
        item.matched_component = Some(component.clone());
        item.match_confidence = 0.85;
        item.match_reasoning = format!(
            "Part promoted: covered labor for '{component}' exists in '{category}'; LLM classification overridden by repair context"
        );
        item.covered_amount = item.total_price;
        item.not_covered_amount = Decimal::ZERO;
        append_step(
            item,
            TraceStep::new(
                "parts_for_repair",
                TraceAction::Promoted,
                format!("Covered labor exists for '{component}'"),
            )
            .with_verdict(CoverageStatus::Covered)
            .with_confidence(0.85)
            .with_detail(serde_json::json!({
                "repair_component": component,
                "repair_category": category,
            })),
        );
        tracing::info!(
            description = %item.description,
            component = %component,
            "Part promoted for covered repair",
        );
    }
}

/// 7d. Demote COVERED labor to NOT_COVERED when zero parts are covered in
/// the whole claim. Labor without an anchoring part is access work,
/// regardless of how it was matched.
pub(crate) fn demote_labor_without_covered_parts(items: &mut [LineItemCoverage]) {
    let has_covered_parts = items
        .iter()
        .any(|i| i.coverage_status == CoverageStatus::Covered && is_parts_type(&i.item_type));
    if has_covered_parts {
        return;
    }

    for item in items.iter_mut() {
        if !is_labor_type(&item.item_type) || item.coverage_status != CoverageStatus::Covered {
            continue;
        }
        let original_category = item.coverage_category.clone();
        item.coverage_status = CoverageStatus::NotCovered;
        item.exclusion_reason = Some("demoted_no_anchor".to_string());
        item.covered_amount = Decimal::ZERO;
        item.not_covered_amount = item.total_price;
        item.match_reasoning.push_str(
            " [DEMOTED: no covered parts in claim - labor cannot be covered without an anchoring part]",
        );
        append_step(
            item,
            TraceStep::new(
                "labor_demotion",
                TraceAction::Demoted,
                "No covered parts in claim - labor has no anchor",
            )
            .with_verdict(CoverageStatus::NotCovered)
            .with_detail(serde_json::json!({"reason": "no_covered_parts_anchor"})),
        );
        tracing::info!(
            description = %item.description,
            category = original_category.as_deref().unwrap_or(""),
            "Labor demoted: no covered parts to anchor it",
        );
    }
}

/// 7e. Flag nominal-price labor as REVIEW_NEEDED.
///
/// Some invoice formats list labor operations at a nominal price per
/// operation code where the real cost is hours x hourly rate. Until
/// labor-hours parsing is supported, such items must not silently enter
/// the payout. Component identification is preserved for reviewers.
pub(crate) fn flag_nominal_price_labor(items: &mut [LineItemCoverage], threshold: Decimal) {
    let mut flagged = 0usize;
    for item in items.iter_mut() {
        if !is_labor_type(&item.item_type) || item.coverage_status != CoverageStatus::Covered {
            continue;
        }
        if item
            .item_code
            .as_deref()
            .map_or(true, |c| c.trim().is_empty())
        {
            continue;
        }
        if item.total_price <= Decimal::ZERO || item.total_price > threshold {
            continue;
        }

        item.coverage_status = CoverageStatus::ReviewNeeded;
        item.match_confidence = 0.30;
        item.exclusion_reason = Some("nominal_price_labor".to_string());
        item.covered_amount = Decimal::ZERO;
        item.not_covered_amount = item.total_price;
        let price = item.total_price;
        append_step(
            item,
            TraceStep::new(
                "nominal_price_audit",
                TraceAction::Demoted,
                format!(
                    "Labor item has nominal price ({price}) with operation code - likely missing hourly rate; flagged for review"
                ),
            )
            .with_verdict(CoverageStatus::ReviewNeeded)
            .with_confidence(0.30),
        );
        flagged += 1;
    }
    if flagged > 0 {
        tracing::info!(
            count = flagged,
            threshold = %threshold,
            "Flagged nominal-price labor items for review",
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{LineItem, Trilean};

    fn item(
        item_type: &str,
        description: &str,
        code: Option<&str>,
        price: i64,
        status: CoverageStatus,
        method: MatchMethod,
    ) -> LineItemCoverage {
        let line = LineItem {
            item_code: code.map(str::to_string),
            description: description.to_string(),
            item_type: item_type.to_string(),
            total_price: Decimal::from(price),
            repair_description: None,
        };
        LineItemCoverage {
            coverage_status: status,
            match_method: method,
            ..LineItemCoverage::from_item(0, &line)
        }
    }

    fn covered_part(description: &str, code: Option<&str>, price: i64) -> LineItemCoverage {
        let mut i = item(
            "parts",
            description,
            code,
            price,
            CoverageStatus::Covered,
            MatchMethod::Keyword,
        );
        i.coverage_category = Some("engine".to_string());
        i.matched_component = Some("oil_cooler".to_string());
        i
    }

    fn config() -> ComponentConfig {
        serde_yaml::from_str::<ComponentConfig>(
            r#"
repair_context_keywords:
  "ölkühler": [oil_cooler, engine]
ancillary_keywords: ["dichtung", "schraube", "joint"]
"#,
        )
        .unwrap()
        .normalized()
    }

    fn covered_context() -> RepairContext {
        RepairContext {
            primary_component: Some("oil_cooler".to_string()),
            primary_category: Some("engine".to_string()),
            is_covered: Trilean::Yes,
            source_description: Some("Ölkühler ersetzen".to_string()),
            all_detected_components: vec!["oil_cooler".to_string()],
        }
    }

    #[test]
    fn part_number_in_description_links_labor() {
        let mut items = vec![
            covered_part("Ölkühler", Some("A 606 188 01 01"), 800),
            item(
                "labor",
                "AUS-/EINBAU A6061880101",
                None,
                300,
                CoverageStatus::NotCovered,
                MatchMethod::Llm,
            ),
        ];
        apply_labor_follows_parts(&mut items, &config());
        assert_eq!(items[1].coverage_status, CoverageStatus::Covered);
        assert!((items[1].match_confidence - 0.85).abs() < f64::EPSILON);
        assert_eq!(items[1].coverage_category.as_deref(), Some("engine"));
    }

    #[test]
    fn simple_invoice_rule_promotes_highest_priced_generic_labor_only() {
        let mut items = vec![
            covered_part("Ölkühler", None, 800),
            item(
                "labor",
                "Arbeit",
                None,
                200,
                CoverageStatus::ReviewNeeded,
                MatchMethod::Llm,
            ),
            item(
                "labor",
                "ARBEIT:",
                None,
                400,
                CoverageStatus::NotCovered,
                MatchMethod::Llm,
            ),
        ];
        apply_labor_follows_parts(&mut items, &config());
        assert_eq!(items[1].coverage_status, CoverageStatus::ReviewNeeded);
        assert_eq!(items[2].coverage_status, CoverageStatus::Covered);
        assert!((items[2].match_confidence - 0.75).abs() < f64::EPSILON);
    }

    #[test]
    fn proportionality_guard_blocks_disproportionate_labor() {
        let mut items = vec![
            covered_part("Kleinteil", None, 100),
            item(
                "labor",
                "Main d'oeuvre",
                None,
                500,
                CoverageStatus::NotCovered,
                MatchMethod::Llm,
            ),
        ];
        apply_labor_follows_parts(&mut items, &config());
        assert_eq!(items[1].coverage_status, CoverageStatus::NotCovered);
        let last = items[1].decision_trace.last().unwrap();
        assert_eq!(last.action, TraceAction::Skipped);
        assert!(last.message.contains("disproportionate"));
    }

    #[test]
    fn repair_context_keyword_links_labor_to_category() {
        let mut items = vec![
            covered_part("Ölkühler", None, 800),
            item(
                "labor",
                "Ölkühler aus- und einbauen",
                None,
                350,
                CoverageStatus::NotCovered,
                MatchMethod::Llm,
            ),
        ];
        apply_labor_follows_parts(&mut items, &config());
        assert_eq!(items[1].coverage_status, CoverageStatus::Covered);
        assert!((items[1].match_confidence - 0.80).abs() < f64::EPSILON);
        assert_eq!(items[1].matched_component.as_deref(), Some("oil_cooler"));
    }

    #[test]
    fn excluded_component_guard_blocks_keyword_promotion() {
        let mut excluded_part = item(
            "parts",
            "Ölkühler alt",
            None,
            500,
            CoverageStatus::NotCovered,
            MatchMethod::Llm,
        );
        excluded_part.matched_component = Some("oil_cooler".to_string());
        let mut items = vec![
            covered_part("Turbolader", None, 900),
            excluded_part,
            item(
                "labor",
                "Ölkühler ausbauen",
                None,
                300,
                CoverageStatus::NotCovered,
                MatchMethod::Llm,
            ),
        ];
        apply_labor_follows_parts(&mut items, &config());
        assert_eq!(items[2].coverage_status, CoverageStatus::NotCovered);
        let last = items[2].decision_trace.last().unwrap();
        assert!(last.message.contains("Excluded-part guard"));
    }

    #[test]
    fn ancillary_parts_promoted_under_covered_context() {
        let mut items = vec![
            covered_part("Ölkühler", None, 800),
            item(
                "parts",
                "Dichtung Satz",
                None,
                40,
                CoverageStatus::NotCovered,
                MatchMethod::Llm,
            ),
        ];
        promote_ancillary_parts(&mut items, &covered_context(), &config());
        assert_eq!(items[1].coverage_status, CoverageStatus::Covered);
        assert!((items[1].match_confidence - 0.70).abs() < f64::EPSILON);
        assert_eq!(items[1].matched_component.as_deref(), Some("oil_cooler"));
    }

    #[test]
    fn ancillary_promotion_requires_covered_parts() {
        let mut items = vec![item(
            "parts",
            "Dichtung Satz",
            None,
            40,
            CoverageStatus::NotCovered,
            MatchMethod::Llm,
        )];
        promote_ancillary_parts(&mut items, &covered_context(), &config());
        assert_eq!(items[0].coverage_status, CoverageStatus::NotCovered);
    }

    #[test]
    fn parts_promoted_when_covered_labor_exists_in_category() {
        let mut labor = item(
            "labor",
            "Ölkühler ersetzen",
            None,
            300,
            CoverageStatus::Covered,
            MatchMethod::Keyword,
        );
        labor.coverage_category = Some("engine".to_string());
        let mut part = item(
            "parts",
            "Gehäuse, Ölfilter",
            None,
            250,
            CoverageStatus::NotCovered,
            MatchMethod::Llm,
        );
        part.coverage_category = Some("engine".to_string());
        let mut items = vec![labor, part];
        promote_parts_for_covered_repair(&mut items, &covered_context());
        assert_eq!(items[1].coverage_status, CoverageStatus::Covered);
        assert!((items[1].match_confidence - 0.85).abs() < f64::EPSILON);
    }

    #[test]
    fn rule_denied_parts_are_not_promoted_for_covered_repair() {
        let mut labor = item(
            "labor",
            "Ölkühler ersetzen",
            None,
            300,
            CoverageStatus::Covered,
            MatchMethod::Keyword,
        );
        labor.coverage_category = Some("engine".to_string());
        let mut part = item(
            "parts",
            "Ölfilter",
            None,
            30,
            CoverageStatus::NotCovered,
            MatchMethod::Rule,
        );
        part.coverage_category = Some("engine".to_string());
        let mut items = vec![labor, part];
        promote_parts_for_covered_repair(&mut items, &covered_context());
        assert_eq!(items[1].coverage_status, CoverageStatus::NotCovered);
    }

    #[test]
    fn orphan_labor_demoted_when_no_parts_covered() {
        let mut labor = item(
            "labor",
            "Arbeit",
            None,
            300,
            CoverageStatus::Covered,
            MatchMethod::Llm,
        );
        labor.coverage_category = Some("engine".to_string());
        let mut items = vec![
            item(
                "parts",
                "Accessoire décoratif",
                None,
                200,
                CoverageStatus::NotCovered,
                MatchMethod::Llm,
            ),
            labor,
        ];
        demote_labor_without_covered_parts(&mut items);
        assert_eq!(items[1].coverage_status, CoverageStatus::NotCovered);
        assert_eq!(
            items[1].exclusion_reason.as_deref(),
            Some("demoted_no_anchor")
        );
    }

    #[test]
    fn demotion_applies_regardless_of_match_method() {
        let mut items = vec![item(
            "labor",
            "Einbau",
            None,
            150,
            CoverageStatus::Covered,
            MatchMethod::Keyword,
        )];
        demote_labor_without_covered_parts(&mut items);
        assert_eq!(items[0].coverage_status, CoverageStatus::NotCovered);
    }

    #[test]
    fn covered_part_prevents_labor_demotion() {
        let mut items = vec![
            covered_part("Ölkühler", None, 800),
            item(
                "labor",
                "Arbeit",
                None,
                300,
                CoverageStatus::Covered,
                MatchMethod::Llm,
            ),
        ];
        demote_labor_without_covered_parts(&mut items);
        assert_eq!(items[1].coverage_status, CoverageStatus::Covered);
    }

    #[test]
    fn nominal_price_labor_flagged_for_review() {
        let mut labor = item(
            "labor",
            "OP-Code 123",
            Some("OP123"),
            1,
            CoverageStatus::Covered,
            MatchMethod::Keyword,
        );
        labor.coverage_category = Some("engine".to_string());
        labor.matched_component = Some("oil_cooler".to_string());
        let mut items = vec![labor];
        flag_nominal_price_labor(&mut items, Decimal::new(2, 0));
        assert_eq!(items[0].coverage_status, CoverageStatus::ReviewNeeded);
        assert_eq!(
            items[0].exclusion_reason.as_deref(),
            Some("nominal_price_labor")
        );
        // Component identification preserved for reviewers
        assert_eq!(items[0].matched_component.as_deref(), Some("oil_cooler"));
    }

    #[test]
    fn nominal_price_flag_requires_item_code() {
        let mut items = vec![item(
            "labor",
            "Kleinarbeit",
            None,
            1,
            CoverageStatus::Covered,
            MatchMethod::Keyword,
        )];
        flag_nominal_price_labor(&mut items, Decimal::new(2, 0));
        assert_eq!(items[0].coverage_status, CoverageStatus::Covered);
    }

    #[test]
    fn normally_priced_labor_is_not_flagged() {
        let mut items = vec![item(
            "labor",
            "Einbau",
            Some("OP1"),
            300,
            CoverageStatus::Covered,
            MatchMethod::Keyword,
        )];
        flag_nominal_price_labor(&mut items, Decimal::new(2, 0));
        assert_eq!(items[0].coverage_status, CoverageStatus::Covered);
    }
}
