//! Part-number lookup stage (pipeline stage 2).
//!
//! Exact catalog lookup on `item_code` only; keyword identification lives
//! in the keyword matcher so that every keyword match flows through the
//! policy-list guard. A catalog hit still has to survive the decision
//! matrix below -- the catalog knows what a part *is*, the policy decides
//! whether it is covered:
//!
//! - gasket/seal guard: keyword-sourced hits on sealing parts defer to the
//!   LLM (the item seals a component, it is not the component)
//! - category covered + confirmed in the policy list -> COVERED
//! - category covered + confirmed absent -> cross-category search, then
//!   defer (lists are representative, variants exist)
//! - category covered + inconclusive -> exclusion check, then defer
//! - category not covered -> defer for ancillary/context/alias cases,
//!   otherwise NOT_COVERED

use std::collections::BTreeMap;

use rust_decimal::Decimal;

use super::policy;
use crate::config::ComponentConfig;
use crate::normalize::is_labor_type;
use crate::parts::PartCatalog;
use crate::rules::RuleEngine;
use crate::trace::TraceBuilder;
use crate::types::{
    CoverageStatus, LineItemCoverage, MatchMethod, PendingItem, TraceAction, TraceStep, Trilean,
};

fn defer(
    pending: &mut PendingItem,
    system: Option<&str>,
    component: Option<&str>,
    step: TraceStep,
) {
    pending.lookup_system = system.map(str::to_string);
    pending.lookup_component = component.map(str::to_string);
    pending.deferred_trace.push(step);
}

/// Match items by exact part-number lookup. Returns `(matched, unmatched)`;
/// deferred items carry their lookup hints and trace steps forward.
#[allow(clippy::too_many_lines)]
pub(crate) fn match_by_part_number(
    items: Vec<PendingItem>,
    catalog: &dyn PartCatalog,
    config: &ComponentConfig,
    rules: &RuleEngine,
    covered_categories: &[String],
    covered_components: &BTreeMap<String, Vec<String>>,
    excluded_components: &BTreeMap<String, Vec<String>>,
) -> (Vec<LineItemCoverage>, Vec<PendingItem>) {
    let mut matched = Vec::new();
    let mut unmatched = Vec::new();

    for mut pending in items {
        let description = pending.item.description.clone();
        let result = pending
            .item
            .item_code
            .as_deref()
            .and_then(|code| catalog.lookup(code));

        let Some(result) = result else {
            pending.deferred_trace.push(
                TraceStep::new("part_number", TraceAction::Skipped, "No part number match found")
                    .with_detail(serde_json::json!({"part": pending.item.item_code})),
            );
            unmatched.push(pending);
            continue;
        };

        let part_ref = pending
            .item
            .item_code
            .clone()
            .unwrap_or_else(|| result.part_number.clone());

        // Gasket/seal guard: a keyword-identified hit whose description
        // carries a sealing-part token is a gasket FOR the component, not
        // the component. The LLM decides with the repair context in hand.
        if result.is_keyword_sourced() {
            let desc_upper = description.to_uppercase();
            let gasket_indicator = config
                .gasket_seal_indicators
                .iter()
                .find(|ind| desc_upper.contains(ind.to_uppercase().as_str()));
            if let Some(indicator) = gasket_indicator {
                tracing::info!(
                    indicator = %indicator,
                    description = %description,
                    system = result.system.as_deref().unwrap_or(""),
                    "Gasket/seal indicator - deferring keyword match to LLM",
                );
                let step = TraceStep::new(
                    "part_number",
                    TraceAction::Deferred,
                    format!("Gasket/seal indicator '{indicator}' - deferred to LLM"),
                )
                .with_detail(serde_json::json!({
                    "part": pending.item.item_code,
                    "lookup_source": result.lookup_source,
                    "reason": "gasket_seal_deferral",
                    "system": result.system,
                    "component": result.component,
                }));
                defer(
                    &mut pending,
                    result.system.as_deref(),
                    result.display_component(),
                    step,
                );
                unmatched.push(pending);
                continue;
            }
        }

        let is_category_covered =
            policy::is_system_covered(config, result.system.as_deref(), covered_categories);
        let (is_in_policy_list, policy_check_reason) = policy::is_component_in_policy_list(
            config,
            result.component.as_deref(),
            result.system.as_deref(),
            covered_components,
            &description,
            false,
        );

        let mut final_category = result.system.clone();
        let mut exclusion_reason: Option<String> = None;

        let (status, reasoning) = if result.covered.is_no() {
            // The catalog itself knows the part is excluded (accessory etc.)
            exclusion_reason = Some("component_excluded".to_string());
            (
                CoverageStatus::NotCovered,
                format!(
                    "Part {part_ref} is excluded: {}",
                    result
                        .note
                        .as_deref()
                        .or(result.component.as_deref())
                        .unwrap_or("")
                ),
            )
        } else if is_category_covered && is_in_policy_list.is_yes() {
            (
                CoverageStatus::Covered,
                format!(
                    "Part {part_ref} identified as '{}' in category '{}' (lookup: {}). Policy check: {policy_check_reason}",
                    result.display_component().unwrap_or(""),
                    result.system.as_deref().unwrap_or(""),
                    result.lookup_source
                ),
            )
        } else if is_category_covered && is_in_policy_list.is_no() {
            // Confirmed absent from this category's list. Check the other
            // covered categories before giving up on a deterministic verdict.
            let cross = policy::find_component_across_categories(
                config,
                result.component.as_deref(),
                result.system.as_deref(),
                covered_components,
                excluded_components,
                &description,
            );
            match cross {
                Some((cross_category, cross_reason)) => {
                    let reasoning = format!(
                        "Part {part_ref} identified as '{}' in category '{}' (lookup: {}). {cross_reason}",
                        result.display_component().unwrap_or(""),
                        result.system.as_deref().unwrap_or(""),
                        result.lookup_source
                    );
                    final_category = Some(cross_category);
                    (CoverageStatus::Covered, reasoning)
                }
                None => {
                    tracing::info!(
                        part = %part_ref,
                        system = result.system.as_deref().unwrap_or(""),
                        reason = %policy_check_reason,
                        "Deferring to LLM: category covered but component not in policy list",
                    );
                    let step = TraceStep::new(
                        "part_number",
                        TraceAction::Deferred,
                        format!("Component not in policy list - deferred to LLM. {policy_check_reason}"),
                    )
                    .with_detail(serde_json::json!({
                        "part": pending.item.item_code,
                        "system": result.system,
                        "component": result.component,
                        "policy_check": false,
                    }));
                    defer(
                        &mut pending,
                        result.system.as_deref(),
                        result.display_component(),
                        step,
                    );
                    unmatched.push(pending);
                    continue;
                }
            }
        } else if is_category_covered {
            // Policy list inconclusive (synonym gap). Exact part-number
            // hits at least get the exclusion check; everything else goes
            // to the LLM.
            let is_exact = !result.is_keyword_sourced();
            if is_exact
                && policy::is_component_excluded_by_policy(
                    config,
                    result.component.as_deref().unwrap_or(""),
                    result.system.as_deref().unwrap_or(""),
                    &description,
                    excluded_components,
                )
            {
                exclusion_reason = Some("component_excluded".to_string());
                (
                    CoverageStatus::NotCovered,
                    format!(
                        "Part {part_ref} identified as '{}' in category '{}' (exact part number) but explicitly excluded by policy",
                        result.display_component().unwrap_or(""),
                        result.system.as_deref().unwrap_or("")
                    ),
                )
            } else {
                tracing::info!(
                    part = %part_ref,
                    system = result.system.as_deref().unwrap_or(""),
                    exact = is_exact,
                    reason = %policy_check_reason,
                    "Deferring to LLM: policy list inconclusive",
                );
                let step = TraceStep::new(
                    "part_number",
                    TraceAction::Deferred,
                    format!("Policy list inconclusive - deferred to LLM. {policy_check_reason}"),
                )
                .with_detail(serde_json::json!({
                    "part": pending.item.item_code,
                    "system": result.system,
                    "component": result.component,
                    "policy_check": null,
                }));
                defer(
                    &mut pending,
                    result.system.as_deref(),
                    result.display_component(),
                    step,
                );
                unmatched.push(pending);
                continue;
            }
        } else {
            // Category not covered. Defer when coverage could still follow
            // from context: ancillary categories, repair context, or
            // configured aliases.
            let system_lower = result
                .system
                .as_deref()
                .unwrap_or("")
                .to_lowercase();
            let is_ancillary = matches!(system_lower.as_str(), "labor" | "consumables" | "parts");
            let has_repair_ctx = pending.item.repair_description.is_some()
                || pending.repair_context_description.is_some();
            let has_aliases = config.category_aliases.contains_key(&system_lower);
            if is_ancillary || has_repair_ctx || has_aliases {
                tracing::info!(
                    part = %part_ref,
                    system = %system_lower,
                    ancillary = is_ancillary,
                    repair_ctx = has_repair_ctx,
                    aliases = has_aliases,
                    "Deferring to LLM: uncovered category with contextual signals",
                );
                let step = TraceStep::new(
                    "part_number",
                    TraceAction::Deferred,
                    "Uncovered category with contextual signals - deferred to LLM",
                )
                .with_detail(serde_json::json!({
                    "part": pending.item.item_code,
                    "system": result.system,
                    "ancillary": is_ancillary,
                    "repair_ctx": has_repair_ctx,
                    "aliases": has_aliases,
                }));
                defer(
                    &mut pending,
                    result.system.as_deref(),
                    result.display_component(),
                    step,
                );
                unmatched.push(pending);
                continue;
            }

            exclusion_reason = Some("category_not_covered".to_string());
            (
                CoverageStatus::NotCovered,
                format!(
                    "Part {part_ref} is '{}' in category '{}' which is not covered by this policy",
                    result.component.as_deref().unwrap_or(""),
                    result.system.as_deref().unwrap_or("")
                ),
            )
        };

        // Keyword-sourced COVERED labor gets one more look: it must not
        // match a non-covered labor pattern (diagnostic, towing).
        let (status, reasoning) = if status == CoverageStatus::Covered
            && is_labor_type(&pending.item.item_type)
        {
            match rules.check_non_covered_labor(&description) {
                Some(labor_check) => {
                    exclusion_reason = Some("non_covered_labor".to_string());
                    (
                        CoverageStatus::NotCovered,
                        format!(
                            "Part {part_ref} keyword-matched as '{}' but labor matches non-covered pattern. {}",
                            result.display_component().unwrap_or(""),
                            labor_check.match_reasoning
                        ),
                    )
                }
                None => (status, reasoning),
            }
        } else {
            (status, reasoning)
        };

        let action = if status == CoverageStatus::Covered {
            TraceAction::Matched
        } else {
            TraceAction::Excluded
        };
        let mut detail = serde_json::json!({
            "part": part_ref,
            "lookup_source": result.lookup_source,
            "system": result.system,
            "component": result.component,
        });
        if let Some(check) = is_in_policy_list.as_bool() {
            detail["policy_check"] = serde_json::json!(check);
            detail["policy_check_reason"] = serde_json::json!(policy_check_reason);
        }
        let mut tb = TraceBuilder::new();
        tb.extend(&pending.deferred_trace);
        tb.add(
            TraceStep::new("part_number", action, reasoning.clone())
                .with_verdict(status)
                .with_confidence(0.95)
                .with_detail(detail),
        );

        tracing::debug!(
            part = %part_ref,
            system = final_category.as_deref().unwrap_or(""),
            status = ?status,
            source = %result.lookup_source,
            "Part lookup verdict",
        );

        let covered = status == CoverageStatus::Covered;
        matched.push(LineItemCoverage {
            coverage_status: status,
            coverage_category: final_category,
            matched_component: result.display_component().map(str::to_string),
            match_method: MatchMethod::PartNumber,
            match_confidence: 0.95,
            match_reasoning: reasoning,
            exclusion_reason,
            policy_list_confirmed: is_in_policy_list,
            covered_amount: if covered {
                pending.item.total_price
            } else {
                Decimal::ZERO
            },
            not_covered_amount: if covered {
                Decimal::ZERO
            } else {
                pending.item.total_price
            },
            decision_trace: tb.build(),
            ..LineItemCoverage::from_item(pending.index, &pending.item)
        });
    }

    (matched, unmatched)
}
