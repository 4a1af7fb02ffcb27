//! Primary-repair determination (stage 8) and boost (stage 9).
//!
//! The primary repair is the single failure mode the claim is about. A
//! tier cascade picks it; the first tier that fires wins:
//!
//! - tier 0 (optional): one LLM call over the full item list
//! - tier 1a: highest-priced COVERED parts item
//! - tier 1b: highest-priced COVERED item of any type
//! - tier 2: repair context, with a sanity override
//! - tier 1c: highest-priced uncovered item with an identified component
//! - tier 3: none -- the screener refers the claim to a human
//!
//! The boost stage then reverses demotion cascades: when the primary
//! repair is confirmed covered it can rescue a zero-payout claim (mode 1)
//! or ask the LLM which denied labor lines are mechanically necessary for
//! the repair (mode 2).

use std::collections::BTreeMap;

use rust_decimal::Decimal;

use super::context::RepairContext;
use crate::llm::matcher::{CoveredPartContext, LaborCandidate, LlmMatcher, PrimaryRepairItem};
use crate::normalize::{is_labor_type, is_parts_type};
use crate::trace::TraceBuilder;
use crate::types::{
    CoverageStatus, DeterminationMethod, LineItemCoverage, MatchMethod, PrimaryRepairResult,
    TraceAction, TraceStep,
};

fn append_step(item: &mut LineItemCoverage, step: TraceStep) {
    let mut tb = TraceBuilder::new();
    tb.extend(&item.decision_trace);
    tb.add(step);
    item.decision_trace = tb.build();
}

fn confidence_or(confidence: f64, fallback: f64) -> f64 {
    if confidence > 0.0 {
        confidence
    } else {
        fallback
    }
}

/// Tier 0: one LLM call selecting the primary repair item.
///
/// The LLM picks the item; coverage is re-derived from our own per-item
/// verdict -- the LLM's coverage opinion is not trusted.
async fn llm_determine_primary(
    items: &[LineItemCoverage],
    covered_components: &BTreeMap<String, Vec<String>>,
    llm: &LlmMatcher,
    claim_id: &str,
    repair_description: Option<&str>,
) -> Option<PrimaryRepairResult> {
    let formatted: Vec<PrimaryRepairItem> = items
        .iter()
        .enumerate()
        .map(|(idx, item)| PrimaryRepairItem {
            index: idx,
            description: item.description.clone(),
            item_type: item.item_type.clone(),
            total_price: item.total_price,
            coverage_status: serde_json::to_value(item.coverage_status)
                .ok()
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_default(),
            coverage_category: item.coverage_category.clone(),
        })
        .collect();

    let selection = llm
        .determine_primary_repair(&formatted, covered_components, claim_id, repair_description)
        .await?;

    let source_item = &items[selection.primary_item_index];
    let is_covered = source_item.coverage_status == CoverageStatus::Covered;

    tracing::info!(
        claim_id = claim_id,
        description = %source_item.description,
        component = selection.component.as_deref().unwrap_or(""),
        covered = is_covered,
        "Primary repair (tier 0 LLM)",
    );

    Some(PrimaryRepairResult {
        component: selection
            .component
            .clone()
            .or_else(|| source_item.matched_component.clone()),
        category: selection
            .category
            .clone()
            .or_else(|| source_item.coverage_category.clone()),
        description: Some(source_item.description.clone()),
        is_covered: Some(is_covered),
        confidence: selection.confidence,
        determination_method: DeterminationMethod::Llm,
        source_item_index: Some(selection.primary_item_index),
    })
}

/// Stage 8: determine the primary repair via the tier cascade.
pub(crate) async fn determine_primary_repair(
    items: &[LineItemCoverage],
    covered_components: &BTreeMap<String, Vec<String>>,
    repair_context: &RepairContext,
    claim_id: &str,
    repair_description: Option<&str>,
    use_llm_primary_repair: bool,
    llm: Option<&LlmMatcher>,
) -> PrimaryRepairResult {
    // Tier 0: LLM-based determination
    if use_llm_primary_repair {
        if let Some(llm) = llm {
            if let Some(result) =
                llm_determine_primary(items, covered_components, llm, claim_id, repair_description)
                    .await
            {
                return result;
            }
        }
    }

    // Tier 1a: highest-priced COVERED parts item
    let best_covered_part = items
        .iter()
        .enumerate()
        .filter(|(_, i)| i.coverage_status == CoverageStatus::Covered && is_parts_type(&i.item_type))
        .max_by(|(_, a), (_, b)| a.total_price.cmp(&b.total_price));
    if let Some((idx, item)) = best_covered_part {
        tracing::info!(
            claim_id = claim_id,
            description = %item.description,
            category = item.coverage_category.as_deref().unwrap_or(""),
            price = %item.total_price,
            "Primary repair (tier 1a)",
        );
        return PrimaryRepairResult {
            component: item.matched_component.clone(),
            category: item.coverage_category.clone(),
            description: Some(item.description.clone()),
            is_covered: Some(true),
            confidence: confidence_or(item.match_confidence, 0.90),
            determination_method: DeterminationMethod::Deterministic,
            source_item_index: Some(idx),
        };
    }

    // Tier 1b: highest-priced COVERED item of any type
    let best_covered_any = items
        .iter()
        .enumerate()
        .filter(|(_, i)| {
            i.coverage_status == CoverageStatus::Covered && i.matched_component.is_some()
        })
        .max_by(|(_, a), (_, b)| a.total_price.cmp(&b.total_price));
    if let Some((idx, item)) = best_covered_any {
        tracing::info!(
            claim_id = claim_id,
            description = %item.description,
            category = item.coverage_category.as_deref().unwrap_or(""),
            price = %item.total_price,
            "Primary repair (tier 1b)",
        );
        return PrimaryRepairResult {
            component: item.matched_component.clone(),
            category: item.coverage_category.clone(),
            description: Some(item.description.clone()),
            is_covered: Some(true),
            confidence: confidence_or(item.match_confidence, 0.85),
            determination_method: DeterminationMethod::Deterministic,
            source_item_index: Some(idx),
        };
    }

    // Tier 2: repair context (works even when the component is not covered)
    if let Some(component) = &repair_context.primary_component {
        // Sanity override: a covered context with zero covered line items
        // means the context keyword was a false positive.
        let mut effective_covered = repair_context.is_covered.is_yes();
        if effective_covered {
            let any_covered = items
                .iter()
                .any(|i| i.coverage_status == CoverageStatus::Covered);
            if !any_covered {
                tracing::warn!(
                    claim_id = claim_id,
                    "Primary repair (tier 2): overriding is_covered true -> false, no covered line items",
                );
                effective_covered = false;
            }
        }
        tracing::info!(
            claim_id = claim_id,
            component = %component,
            category = repair_context.primary_category.as_deref().unwrap_or(""),
            covered = effective_covered,
            "Primary repair (tier 2)",
        );
        return PrimaryRepairResult {
            component: Some(component.clone()),
            category: repair_context.primary_category.clone(),
            description: repair_context.source_description.clone(),
            is_covered: Some(effective_covered),
            confidence: 0.80,
            determination_method: DeterminationMethod::RepairContext,
            source_item_index: None,
        };
    }

    // Tier 1c: highest-priced uncovered item with an identified component,
    // so the screener can still reach a verdict.
    let best_uncovered = items
        .iter()
        .enumerate()
        .filter(|(_, i)| {
            matches!(
                i.coverage_status,
                CoverageStatus::NotCovered | CoverageStatus::ReviewNeeded
            ) && i.matched_component.is_some()
        })
        .max_by(|(_, a), (_, b)| a.total_price.cmp(&b.total_price));
    if let Some((idx, item)) = best_uncovered {
        tracing::info!(
            claim_id = claim_id,
            description = %item.description,
            category = item.coverage_category.as_deref().unwrap_or(""),
            price = %item.total_price,
            "Primary repair (tier 1c)",
        );
        return PrimaryRepairResult {
            component: item.matched_component.clone(),
            category: item.coverage_category.clone(),
            description: Some(item.description.clone()),
            is_covered: Some(false),
            confidence: confidence_or(item.match_confidence, 0.70),
            determination_method: DeterminationMethod::Deterministic,
            source_item_index: Some(idx),
        };
    }

    // Tier 3: nothing to anchor on -- the screener refers
    tracing::info!(claim_id = claim_id, "Primary repair: could not determine - will refer");
    PrimaryRepairResult::none()
}

/// Stage 9: promote items when the primary repair is confirmed covered.
///
/// Mode 1 (zero-payout rescue): when no item is COVERED at a non-trivial
/// price, promote NOT_COVERED LLM-classified items without an exclusion
/// reason whose category matches the primary repair (or is unset).
///
/// Mode 2 (LLM labor relevance): when parts are covered but labor lines
/// were denied by the LLM, one batch call asks which of them are
/// mechanically necessary for the primary repair; only confirmed items are
/// promoted. An LLM failure leaves every candidate untouched.
pub(crate) async fn promote_items_for_covered_primary_repair(
    items: &mut [LineItemCoverage],
    primary_repair: &PrimaryRepairResult,
    claim_id: &str,
    llm: Option<&LlmMatcher>,
) {
    if primary_repair.is_covered != Some(true) {
        return;
    }
    let Some(category) = primary_repair.category.clone() else {
        return;
    };
    let category_lower = category.to_lowercase();

    let has_covered = items.iter().any(|i| {
        i.coverage_status == CoverageStatus::Covered && i.total_price > Decimal::ZERO
    });

    if !has_covered {
        // Mode 1: zero-payout rescue
        for item in items.iter_mut() {
            if item.coverage_status != CoverageStatus::NotCovered
                || item.match_method != MatchMethod::Llm
            {
                continue;
            }
            if let Some(reason) = item.exclusion_reason.clone() {
                append_step(
                    item,
                    TraceStep::new(
                        "primary_repair_boost",
                        TraceAction::Skipped,
                        format!("Zero-payout rescue skipped: item has exclusion_reason='{reason}'"),
                    )
                    .with_detail(serde_json::json!({
                        "mode": "zero_payout_rescue",
                        "skip_reason": "exclusion_reason",
                        "exclusion_reason": reason,
                    })),
                );
                tracing::info!(
                    description = %item.description,
                    exclusion_reason = %reason,
                    "Zero-payout rescue: skipping excluded item",
                );
                continue;
            }
            let item_category = item.coverage_category.clone().unwrap_or_default();
            if !item_category.is_empty() && item_category.to_lowercase() != category_lower {
                append_step(
                    item,
                    TraceStep::new(
                        "primary_repair_boost",
                        TraceAction::Skipped,
                        format!(
                            "Zero-payout rescue skipped: item category '{item_category}' does not match primary repair category '{category}'"
                        ),
                    )
                    .with_detail(serde_json::json!({
                        "mode": "zero_payout_rescue",
                        "skip_reason": "category_mismatch",
                        "item_category": item_category,
                        "primary_category": category,
                    })),
                );
                tracing::info!(
                    description = %item.description,
                    item_category = %item_category,
                    primary_category = %category,
                    "Zero-payout rescue: skipping category mismatch",
                );
                continue;
            }

            item.coverage_status = CoverageStatus::Covered;
            item.coverage_category = Some(category.clone());
            if item.matched_component.is_none() {
                item.matched_component = primary_repair.component.clone();
            }
            item.covered_amount = item.total_price;
            item.not_covered_amount = Decimal::ZERO;
            item.match_reasoning.push_str(&format!(
                " [PROMOTED: primary repair '{}' in '{category}' is covered by policy]",
                primary_repair.component.as_deref().unwrap_or("")
            ));
            append_step(
                item,
                TraceStep::new(
                    "primary_repair_boost",
                    TraceAction::Promoted,
                    format!(
                        "Zero-payout rescue: primary repair '{}' is covered",
                        primary_repair.component.as_deref().unwrap_or("")
                    ),
                )
                .with_verdict(CoverageStatus::Covered)
                .with_detail(serde_json::json!({
                    "mode": "zero_payout_rescue",
                    "primary_component": primary_repair.component,
                })),
            );
            tracing::info!(
                description = %item.description,
                component = primary_repair.component.as_deref().unwrap_or(""),
                category = %category,
                "Item promoted via primary repair anchor",
            );
        }
        return;
    }

    // Mode 2: LLM labor relevance
    let has_covered_parts = items
        .iter()
        .any(|i| i.coverage_status == CoverageStatus::Covered && is_parts_type(&i.item_type));
    if !has_covered_parts {
        return;
    }

    let candidate_indices: Vec<usize> = items
        .iter()
        .enumerate()
        .filter(|(_, i)| {
            is_labor_type(&i.item_type)
                && i.coverage_status == CoverageStatus::NotCovered
                && i.match_method == MatchMethod::Llm
                && i.exclusion_reason.is_none()
        })
        .map(|(idx, _)| idx)
        .collect();

    let Some(llm) = llm else {
        return;
    };
    if candidate_indices.is_empty() {
        return;
    }

    let covered_parts_context: Vec<CoveredPartContext> = items
        .iter()
        .filter(|i| i.coverage_status == CoverageStatus::Covered && is_parts_type(&i.item_type))
        .map(|i| CoveredPartContext {
            item_code: i.item_code.clone().unwrap_or_default(),
            description: i.description.clone(),
            matched_component: i.matched_component.clone().unwrap_or_default(),
        })
        .collect();

    let labor_payload: Vec<LaborCandidate> = candidate_indices
        .iter()
        .map(|&idx| LaborCandidate {
            index: idx,
            description: items[idx].description.clone(),
            item_code: items[idx].item_code.clone(),
            total_price: items[idx].total_price,
        })
        .collect();

    let primary_component = primary_repair.component.clone().unwrap_or_default();
    let verdicts = match llm
        .classify_labor_for_primary_repair(
            &labor_payload,
            &primary_component,
            &category,
            &covered_parts_context,
            claim_id,
        )
        .await
    {
        Ok(verdicts) => verdicts,
        Err(e) => {
            tracing::warn!(
                claim_id = claim_id,
                error = %e,
                "LLM labor relevance call failed; leaving all candidates NOT_COVERED",
            );
            let message = e.to_string();
            for &idx in &candidate_indices {
                append_step(
                    &mut items[idx],
                    TraceStep::new(
                        "primary_repair_boost_llm",
                        TraceAction::Skipped,
                        format!("LLM labor relevance failed: {message}"),
                    )
                    .with_detail(serde_json::json!({
                        "mode": "llm_labor_relevance",
                        "error": message,
                    })),
                );
            }
            return;
        }
    };

    let verdict_by_index: BTreeMap<usize, _> =
        verdicts.into_iter().map(|v| (v.index, v)).collect();

    for &idx in &candidate_indices {
        let verdict = verdict_by_index.get(&idx);
        let item = &mut items[idx];
        match verdict {
            Some(v) if v.is_relevant => {
                item.coverage_status = CoverageStatus::Covered;
                item.coverage_category = Some(category.clone());
                if item.matched_component.is_none() {
                    item.matched_component = primary_repair.component.clone();
                }
                item.covered_amount = item.total_price;
                item.not_covered_amount = Decimal::ZERO;
                item.match_reasoning.push_str(&format!(
                    " [PROMOTED: LLM confirmed labor is necessary for primary repair '{primary_component}' in '{category}': {}]",
                    v.reasoning
                ));
                append_step(
                    item,
                    TraceStep::new(
                        "primary_repair_boost_llm",
                        TraceAction::Promoted,
                        format!("LLM labor relevance: necessary for '{primary_component}'"),
                    )
                    .with_verdict(CoverageStatus::Covered)
                    .with_detail(serde_json::json!({
                        "mode": "llm_labor_relevance",
                        "primary_component": primary_component,
                        "llm_confidence": v.confidence,
                        "llm_reasoning": v.reasoning,
                    })),
                );
                tracing::info!(
                    description = %item.description,
                    component = %primary_component,
                    "Labor promoted via LLM relevance",
                );
            }
            other => {
                let (reasoning, confidence) = match other {
                    Some(v) => (v.reasoning.clone(), v.confidence),
                    None => ("Missing from LLM response".to_string(), 0.0),
                };
                append_step(
                    item,
                    TraceStep::new(
                        "primary_repair_boost_llm",
                        TraceAction::Skipped,
                        format!(
                            "LLM labor relevance: not necessary for '{primary_component}': {reasoning}"
                        ),
                    )
                    .with_detail(serde_json::json!({
                        "mode": "llm_labor_relevance",
                        "primary_component": primary_component,
                        "llm_confidence": confidence,
                        "llm_reasoning": reasoning,
                    })),
                );
                tracing::debug!(
                    description = %item.description,
                    component = %primary_component,
                    "Labor not promoted - LLM says not relevant",
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{LineItem, Trilean};

    fn item(
        item_type: &str,
        description: &str,
        price: i64,
        status: CoverageStatus,
        method: MatchMethod,
        component: Option<&str>,
        category: Option<&str>,
    ) -> LineItemCoverage {
        let line = LineItem {
            description: description.to_string(),
            item_type: item_type.to_string(),
            total_price: Decimal::from(price),
            ..LineItem::default()
        };
        LineItemCoverage {
            coverage_status: status,
            match_method: method,
            match_confidence: 0.8,
            matched_component: component.map(str::to_string),
            coverage_category: category.map(str::to_string),
            ..LineItemCoverage::from_item(0, &line)
        }
    }

    fn empty_context() -> RepairContext {
        RepairContext::default()
    }

    #[tokio::test]
    async fn tier_1a_prefers_highest_priced_covered_part() {
        let items = vec![
            item(
                "parts",
                "Dichtung",
                40,
                CoverageStatus::Covered,
                MatchMethod::Keyword,
                Some("gasket"),
                Some("engine"),
            ),
            item(
                "parts",
                "Turbolader",
                1200,
                CoverageStatus::Covered,
                MatchMethod::Keyword,
                Some("turbocharger"),
                Some("engine"),
            ),
            item(
                "labor",
                "Arbeit",
                2000,
                CoverageStatus::Covered,
                MatchMethod::Keyword,
                Some("turbocharger"),
                Some("engine"),
            ),
        ];
        let primary = determine_primary_repair(
            &items,
            &BTreeMap::new(),
            &empty_context(),
            "C1",
            None,
            false,
            None,
        )
        .await;
        assert_eq!(primary.component.as_deref(), Some("turbocharger"));
        assert_eq!(primary.description.as_deref(), Some("Turbolader"));
        assert_eq!(primary.is_covered, Some(true));
        assert_eq!(primary.source_item_index, Some(1));
        assert_eq!(primary.determination_method, DeterminationMethod::Deterministic);
    }

    #[tokio::test]
    async fn tier_1b_falls_back_to_covered_labor() {
        let items = vec![item(
            "labor",
            "Ölkühler ersetzen",
            500,
            CoverageStatus::Covered,
            MatchMethod::Keyword,
            Some("oil_cooler"),
            Some("engine"),
        )];
        let primary = determine_primary_repair(
            &items,
            &BTreeMap::new(),
            &empty_context(),
            "C1",
            None,
            false,
            None,
        )
        .await;
        assert_eq!(primary.component.as_deref(), Some("oil_cooler"));
        assert_eq!(primary.is_covered, Some(true));
    }

    #[tokio::test]
    async fn tier_2_sanity_override_forces_not_covered() {
        let ctx = RepairContext {
            primary_component: Some("oil_cooler".to_string()),
            primary_category: Some("engine".to_string()),
            is_covered: Trilean::Yes,
            source_description: Some("Ölkühler".to_string()),
            all_detected_components: vec![],
        };
        let items = vec![item(
            "parts",
            "Zierleiste",
            100,
            CoverageStatus::NotCovered,
            MatchMethod::Llm,
            None,
            None,
        )];
        let primary = determine_primary_repair(
            &items,
            &BTreeMap::new(),
            &ctx,
            "C1",
            None,
            false,
            None,
        )
        .await;
        assert_eq!(primary.determination_method, DeterminationMethod::RepairContext);
        assert_eq!(primary.is_covered, Some(false));
    }

    #[tokio::test]
    async fn tier_1c_uses_uncovered_item_with_component() {
        let items = vec![item(
            "parts",
            "Hochdruckpumpe",
            11_500,
            CoverageStatus::NotCovered,
            MatchMethod::Llm,
            Some("high_pressure_pump"),
            Some("fuel_system"),
        )];
        let primary = determine_primary_repair(
            &items,
            &BTreeMap::new(),
            &empty_context(),
            "C1",
            None,
            false,
            None,
        )
        .await;
        assert_eq!(primary.component.as_deref(), Some("high_pressure_pump"));
        assert_eq!(primary.is_covered, Some(false));
        assert_eq!(primary.source_item_index, Some(0));
    }

    #[tokio::test]
    async fn tier_3_signals_refer() {
        let items = vec![item(
            "fee",
            "Entsorgung",
            20,
            CoverageStatus::NotCovered,
            MatchMethod::Llm,
            None,
            None,
        )];
        let primary = determine_primary_repair(
            &items,
            &BTreeMap::new(),
            &empty_context(),
            "C1",
            None,
            false,
            None,
        )
        .await;
        assert_eq!(primary.determination_method, DeterminationMethod::None);
        assert_eq!(primary.is_covered, None);
    }

    fn covered_primary() -> PrimaryRepairResult {
        PrimaryRepairResult {
            component: Some("oil_cooler".to_string()),
            category: Some("engine".to_string()),
            description: Some("Ölkühler".to_string()),
            is_covered: Some(true),
            confidence: 0.9,
            determination_method: DeterminationMethod::Deterministic,
            source_item_index: Some(0),
        }
    }

    #[tokio::test]
    async fn zero_payout_rescue_promotes_matching_llm_items() {
        let mut items = vec![
            item(
                "parts",
                "Ölkühlergehäuse",
                400,
                CoverageStatus::NotCovered,
                MatchMethod::Llm,
                None,
                Some("engine"),
            ),
            item(
                "labor",
                "Kleinteile montieren",
                100,
                CoverageStatus::NotCovered,
                MatchMethod::Llm,
                None,
                None,
            ),
        ];
        promote_items_for_covered_primary_repair(&mut items, &covered_primary(), "C1", None).await;
        assert_eq!(items[0].coverage_status, CoverageStatus::Covered);
        assert_eq!(items[0].matched_component.as_deref(), Some("oil_cooler"));
        // Unset category gets the benefit of the doubt
        assert_eq!(items[1].coverage_status, CoverageStatus::Covered);
    }

    #[tokio::test]
    async fn zero_payout_rescue_skips_excluded_and_mismatched_items() {
        let mut excluded = item(
            "parts",
            "Zierleiste",
            100,
            CoverageStatus::NotCovered,
            MatchMethod::Llm,
            None,
            Some("engine"),
        );
        excluded.exclusion_reason = Some("component_excluded".to_string());
        let mut items = vec![
            excluded,
            item(
                "parts",
                "Bremsscheibe",
                200,
                CoverageStatus::NotCovered,
                MatchMethod::Llm,
                None,
                Some("brakes"),
            ),
        ];
        promote_items_for_covered_primary_repair(&mut items, &covered_primary(), "C1", None).await;
        assert_eq!(items[0].coverage_status, CoverageStatus::NotCovered);
        assert_eq!(items[1].coverage_status, CoverageStatus::NotCovered);
        assert_eq!(
            items[0].decision_trace.last().unwrap().action,
            TraceAction::Skipped
        );
    }

    #[tokio::test]
    async fn rescue_does_not_run_when_primary_not_covered() {
        let mut primary = covered_primary();
        primary.is_covered = Some(false);
        let mut items = vec![item(
            "parts",
            "Ölkühlergehäuse",
            400,
            CoverageStatus::NotCovered,
            MatchMethod::Llm,
            None,
            Some("engine"),
        )];
        promote_items_for_covered_primary_repair(&mut items, &primary, "C1", None).await;
        assert_eq!(items[0].coverage_status, CoverageStatus::NotCovered);
    }

    #[tokio::test]
    async fn rule_denied_items_are_never_rescued() {
        let mut items = vec![item(
            "parts",
            "Ölfilter",
            30,
            CoverageStatus::NotCovered,
            MatchMethod::Rule,
            None,
            Some("engine"),
        )];
        promote_items_for_covered_primary_repair(&mut items, &covered_primary(), "C1", None).await;
        assert_eq!(items[0].coverage_status, CoverageStatus::NotCovered);
    }
}
