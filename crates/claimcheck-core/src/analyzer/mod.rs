//! The coverage analyzer: a six-stage matching pipeline bracketed by a
//! repair-context pre-pass and several reconciliation post-passes.
//!
//! Stages run in strict order; each consumes the items unmatched by prior
//! stages and either classifies them or defers them with a trace fragment:
//!
//! 0. repair-context extraction from labor descriptions
//! 1. rule engine (deterministic patterns, confidence 1.0)
//! 2. part-number catalog lookup (exact match, decision matrix)
//! 3. keyword matching (language-specific taxonomy)
//! 4. labor component extraction (repair keywords in labor text)
//! 5. policy-list verification (may demote keyword matches to the LLM)
//! 6. LLM fallback (bounded, retried, parallel) + validation
//! 7. reconciliation passes (labor-follows-parts, ancillary promotion,
//!    parts-for-covered-repair, orphan-labor demotion, nominal-price flag)
//! 8. primary-repair determination (tier cascade)
//! 9. primary-repair boost (zero-payout rescue, LLM labor relevance)
//! 10. summary & payout
//!
//! `analyze()` never fails on malformed line items: every item traverses
//! the pipeline and receives a final status.

mod context;
mod part_number;
mod policy;
mod primary;
mod reconcile;
mod summary;
mod validate;

#[cfg(test)]
mod e2e_tests;

pub use context::RepairContext;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use rust_decimal::Decimal;
use tokio_util::sync::CancellationToken;

use crate::config::{
    load_coverage_config, AnalyzerConfig, ComponentConfig, LoadedCoverageConfig,
};
use crate::error::ConfigError;
use crate::keywords::KeywordMatcher;
use crate::llm::matcher::{CoveredPartContext, LlmBatchContext, LlmMatcher};
use crate::llm::{AuditedChatClient, ChatClientFactory, ProgressCallback};
use crate::normalize::{is_labor_type, is_parts_type};
use crate::parts::PartCatalog;
use crate::rules::RuleEngine;
use crate::trace::TraceBuilder;
use crate::types::{
    CoverageAnalysisResult, CoverageInputs, CoverageMetadata, CoverageScale, CoverageStatus,
    DeterminationMethod, LineItem, LineItemCoverage, MatchMethod, PendingItem,
    PrimaryRepairResult, TraceAction, TraceStep, Trilean,
};

/// Everything the analyzer needs from a claim, besides configuration.
#[derive(Debug, Clone, Default)]
pub struct AnalyzeRequest {
    /// Claim identifier.
    pub claim_id: String,
    /// Extracted invoice line items.
    pub line_items: Vec<LineItem>,
    /// Policy covered-parts lists by category.
    pub covered_components: BTreeMap<String, Vec<String>>,
    /// Policy excluded-parts lists by category (authoritative).
    pub excluded_components: BTreeMap<String, Vec<String>>,
    /// Odometer reading at claim time.
    pub vehicle_km: Option<u64>,
    /// Mileage-based coverage scale from the policy.
    pub coverage_scale: Option<CoverageScale>,
    /// Excess percentage, recorded for the downstream screener.
    pub excess_percent: Option<Decimal>,
    /// Minimum excess amount, recorded for the downstream screener.
    pub excess_minimum: Option<Decimal>,
    /// Vehicle age in years.
    pub vehicle_age_years: Option<Decimal>,
    /// Age threshold for reduced coverage; falls back to the scale's own.
    pub age_threshold_years: Option<u32>,
    /// Processing-run identifier.
    pub claim_run_id: Option<String>,
    /// Damage / diagnostic narrative from the claim documents.
    pub repair_description: Option<String>,
}

impl AnalyzeRequest {
    /// Build a request for a claim's line items.
    pub fn new(claim_id: impl Into<String>, line_items: Vec<LineItem>) -> Self {
        Self {
            claim_id: claim_id.into(),
            line_items,
            ..Self::default()
        }
    }
}

/// Observation and cancellation hooks for one `analyze()` call.
#[derive(Clone, Default)]
pub struct AnalyzeHooks {
    /// Fired once when LLM matching starts, with the item count.
    pub on_llm_start: Option<ProgressCallback>,
    /// Fired once per LLM-processed item, always with the value 1.
    pub on_llm_progress: Option<ProgressCallback>,
    /// Cooperative cancellation of the LLM stage: in-flight calls finish,
    /// pending items short-circuit to REVIEW_NEEDED.
    pub cancel: Option<CancellationToken>,
}

/// External collaborators injected at analyzer construction.
#[derive(Default)]
pub struct AnalyzerDeps {
    /// Part-number catalog.
    pub catalog: Option<Arc<dyn PartCatalog>>,
    /// Audited LLM client for sequential calls.
    pub llm_client: Option<Arc<dyn AuditedChatClient>>,
    /// Per-worker client factory for the parallel LLM pool.
    pub llm_client_factory: Option<Arc<dyn ChatClientFactory>>,
}

/// Orchestrates the coverage analysis pipeline.
pub struct CoverageAnalyzer {
    config: AnalyzerConfig,
    component_config: ComponentConfig,
    rule_engine: RuleEngine,
    keyword_matcher: KeywordMatcher,
    llm_matcher: Option<LlmMatcher>,
    catalog: Option<Arc<dyn PartCatalog>>,
}

impl CoverageAnalyzer {
    /// Create an analyzer from pre-built components.
    pub fn new(
        config: AnalyzerConfig,
        component_config: ComponentConfig,
        rule_engine: RuleEngine,
        keyword_matcher: KeywordMatcher,
        llm_matcher: Option<LlmMatcher>,
        catalog: Option<Arc<dyn PartCatalog>>,
    ) -> Self {
        Self {
            config,
            component_config,
            rule_engine,
            keyword_matcher,
            llm_matcher,
            catalog,
        }
    }

    /// Create an analyzer from a YAML configuration file and injected
    /// collaborators. A missing config file logs a warning and proceeds
    /// with defaults; a present-but-invalid file is an error.
    pub fn from_config_path(config_path: &Path, deps: AnalyzerDeps) -> Result<Self, ConfigError> {
        let LoadedCoverageConfig {
            analyzer,
            rules,
            keywords,
            llm,
            component,
        } = load_coverage_config(config_path)?;

        let rule_engine = RuleEngine::new(&rules)?;
        let keyword_matcher = KeywordMatcher::new(keywords);
        let llm_matcher = if deps.llm_client.is_some() || deps.llm_client_factory.is_some() {
            let mut matcher = LlmMatcher::new(llm, deps.llm_client);
            if let Some(factory) = deps.llm_client_factory {
                matcher = matcher.with_factory(factory);
            }
            Some(matcher)
        } else {
            None
        };

        Ok(Self::new(
            analyzer,
            component,
            rule_engine,
            keyword_matcher,
            llm_matcher,
            deps.catalog,
        ))
    }

    /// The analyzer's configuration.
    pub fn config(&self) -> &AnalyzerConfig {
        &self.config
    }

    /// Analyze coverage for all line items of a claim.
    pub async fn analyze(&self, request: AnalyzeRequest) -> CoverageAnalysisResult {
        self.analyze_with_hooks(request, AnalyzeHooks::default())
            .await
    }

    /// Analyze with progress and cancellation hooks.
    #[allow(clippy::too_many_lines)]
    pub async fn analyze_with_hooks(
        &self,
        request: AnalyzeRequest,
        hooks: AnalyzeHooks,
    ) -> CoverageAnalysisResult {
        let started = Instant::now();
        let AnalyzeRequest {
            claim_id,
            line_items,
            covered_components,
            excluded_components,
            vehicle_km,
            coverage_scale,
            excess_percent,
            excess_minimum,
            vehicle_age_years,
            age_threshold_years,
            claim_run_id,
            repair_description,
        } = request;

        // Coverage percentage: mileage tier walk, per-tier age adjustment,
        // config default as last resort.
        let (scale_age_threshold, tiers) = coverage_scale
            .as_ref()
            .map_or((None, Vec::new()), CoverageScale::normalize);
        let age_threshold = age_threshold_years.or(scale_age_threshold);
        let (mut mileage_percent, mut effective_percent) = summary::determine_coverage_percent(
            vehicle_km,
            &tiers,
            vehicle_age_years,
            age_threshold,
        );
        if effective_percent.is_none() {
            if let Some(default_percent) = self.config.default_coverage_percent {
                tracing::info!(
                    claim_id = %claim_id,
                    default = %default_percent,
                    "No coverage scale - using config default percent",
                );
                mileage_percent = Some(default_percent);
                effective_percent = Some(default_percent);
            }
        }

        let covered_categories = context::extract_covered_categories(&covered_components);

        // Stage 0: repair context from labor descriptions
        let repair_context = context::extract_repair_context(
            &line_items,
            &covered_components,
            &excluded_components,
            &self.component_config,
            &self.rule_engine,
        );

        tracing::info!(
            claim_id = %claim_id,
            items = line_items.len(),
            coverage = ?effective_percent,
            km = ?vehicle_km,
            "Analyzing claim",
        );

        let pending: Vec<PendingItem> = line_items
            .iter()
            .enumerate()
            .map(|(index, item)| PendingItem::new(index, item.clone()))
            .collect();

        // Stage 1: rule engine. Consumable rules are suspended when the
        // repair context indicates a covered primary component.
        let skip_consumable =
            repair_context.is_covered.is_yes() && repair_context.primary_component.is_some();
        let (rule_matched, mut remaining) = self.rule_engine.batch_match(
            pending,
            skip_consumable,
            repair_context.primary_component.as_deref(),
        );
        tracing::debug!(
            matched = rule_matched.len(),
            total = line_items.len(),
            "Rule stage complete",
        );

        // Stage 2: part-number lookup
        let mut part_matched = Vec::new();
        if let Some(catalog) = &self.catalog {
            if !remaining.is_empty() {
                let (matched, rest) = part_number::match_by_part_number(
                    remaining,
                    catalog.as_ref(),
                    &self.component_config,
                    &self.rule_engine,
                    &covered_categories,
                    &covered_components,
                    &excluded_components,
                );
                part_matched = matched;
                remaining = rest;
                tracing::debug!(matched = part_matched.len(), "Part-number stage complete");
            }
        }

        // Stage 3: keyword matcher
        let (mut keyword_matched, mut remaining) = self.keyword_matcher.batch_match(
            remaining,
            &covered_categories,
            self.config.keyword_min_confidence,
        );
        tracing::debug!(matched = keyword_matched.len(), "Keyword stage complete");

        // Stage 4: labor component extraction
        if !remaining.is_empty() && !self.component_config.repair_context_keywords.is_empty() {
            let (matched, rest) = self.match_labor_by_component_extraction(
                remaining,
                keyword_matched,
                &covered_categories,
                &covered_components,
            );
            keyword_matched = matched;
            remaining = rest;
        }

        // Stage 5: policy-list verification. Keyword matches confirmed
        // absent or uncertain are demoted back to the LLM.
        if !covered_components.is_empty() && !keyword_matched.is_empty() {
            keyword_matched =
                self.verify_keyword_matches(keyword_matched, &mut remaining, &covered_components);
        }

        let rules_applied = rule_matched.len();
        let part_numbers_applied = part_matched.len();
        let keywords_applied = keyword_matched.len();

        // Stage 6: LLM fallback
        let llm_calls_before = self
            .llm_matcher
            .as_ref()
            .map_or(0, LlmMatcher::llm_call_count);
        let mut llm_matched: Vec<LineItemCoverage> = Vec::new();
        if !remaining.is_empty() {
            match &self.llm_matcher {
                Some(matcher) if self.config.use_llm_fallback => {
                    let mut items_for_llm = std::mem::take(&mut remaining);
                    let overflow = if items_for_llm.len() > self.config.llm_max_items {
                        items_for_llm.split_off(self.config.llm_max_items)
                    } else {
                        Vec::new()
                    };
                    if !overflow.is_empty() {
                        tracing::warn!(
                            claim_id = %claim_id,
                            needed = items_for_llm.len() + overflow.len(),
                            limit = self.config.llm_max_items,
                            skipped = overflow.len(),
                            "LLM item limit exceeded; overflow marked review_needed. Consider adding keyword rules for frequently skipped item types.",
                        );
                    }

                    // Enrich with repair context and part-lookup hints
                    let labor_context = repair_context.source_description.clone();
                    for pending in &mut items_for_llm {
                        if pending.repair_context_description.is_none() {
                            pending.repair_context_description = pending
                                .item
                                .repair_description
                                .clone()
                                .or_else(|| labor_context.clone());
                        }
                        if let Some(system) = pending.lookup_system.take() {
                            let component =
                                pending.lookup_component.take().unwrap_or_default();
                            let hint =
                                format!("Pre-identified as '{component}' in category '{system}'.");
                            let existing =
                                pending.repair_context_description.take().unwrap_or_default();
                            pending.repair_context_description =
                                Some(format!("{hint} {existing}").trim().to_string());
                        }
                    }

                    // Covered parts from prior stages give the LLM claim
                    // context for nuanced labor decisions.
                    let covered_parts_in_claim: Vec<CoveredPartContext> = rule_matched
                        .iter()
                        .chain(&part_matched)
                        .chain(&keyword_matched)
                        .filter(|i| {
                            i.coverage_status == CoverageStatus::Covered
                                && is_parts_type(&i.item_type)
                        })
                        .map(|i| CoveredPartContext {
                            item_code: i.item_code.clone().unwrap_or_default(),
                            description: i.description.clone(),
                            matched_component: i.matched_component.clone().unwrap_or_default(),
                        })
                        .collect();

                    if let Some(on_start) = &hooks.on_llm_start {
                        on_start(items_for_llm.len());
                    }

                    let batch_context = LlmBatchContext {
                        claim_id: claim_id.clone(),
                        covered_categories: covered_categories.clone(),
                        covered_components: covered_components.clone(),
                        excluded_components: excluded_components.clone(),
                        covered_parts_in_claim,
                    };
                    llm_matched = matcher
                        .batch_match(
                            items_for_llm,
                            &batch_context,
                            hooks.on_llm_progress.clone(),
                            hooks.cancel.clone(),
                        )
                        .await;

                    for item in &mut llm_matched {
                        validate::validate_llm_decision(
                            item,
                            &self.component_config,
                            &covered_components,
                            &excluded_components,
                            &repair_context,
                        );
                    }

                    for pending in overflow {
                        llm_matched.push(llm_limit_item(
                            &pending,
                            self.config.llm_max_items,
                        ));
                    }
                }
                _ => {
                    // LLM disabled or no client injected: everything left
                    // needs human review.
                    for pending in remaining.drain(..) {
                        llm_matched.push(llm_disabled_item(&pending));
                    }
                }
            }
        }

        // Combine and restore input order; every later pass and the output
        // itself see items exactly as the claim listed them.
        let mut all_items: Vec<LineItemCoverage> = rule_matched
            .into_iter()
            .chain(part_matched)
            .chain(keyword_matched)
            .chain(llm_matched)
            .collect();
        all_items.sort_by_key(|i| i.source_index);

        // Stage 7: reconciliation passes
        reconcile::apply_labor_follows_parts(&mut all_items, &self.component_config);
        reconcile::promote_ancillary_parts(&mut all_items, &repair_context, &self.component_config);
        reconcile::promote_parts_for_covered_repair(&mut all_items, &repair_context);
        reconcile::demote_labor_without_covered_parts(&mut all_items);
        reconcile::flag_nominal_price_labor(&mut all_items, self.config.nominal_price_threshold);

        // Stage 8: primary repair
        let primary_repair = primary::determine_primary_repair(
            &all_items,
            &covered_components,
            &repair_context,
            &claim_id,
            repair_description.as_deref(),
            self.config.use_llm_primary_repair,
            self.llm_matcher.as_ref(),
        )
        .await;

        // Stage 9: boost
        primary::promote_items_for_covered_primary_repair(
            &mut all_items,
            &primary_repair,
            &claim_id,
            self.llm_matcher.as_ref(),
        )
        .await;

        // Stage 10: summary & payout
        let summary = summary::calculate_summary(&mut all_items, effective_percent);

        let llm_calls = self
            .llm_matcher
            .as_ref()
            .map_or(0, LlmMatcher::llm_call_count)
            - llm_calls_before;
        let processing_time_ms =
            u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        let metadata = CoverageMetadata {
            rules_applied,
            part_numbers_applied,
            keywords_applied,
            llm_calls,
            processing_time_ms,
            config_version: self.config.config_version.clone(),
        };

        let inputs = CoverageInputs {
            vehicle_km,
            vehicle_age_years,
            coverage_percent: mileage_percent,
            coverage_percent_effective: effective_percent,
            age_threshold_years: age_threshold,
            excess_percent,
            excess_minimum,
            covered_categories,
        };

        tracing::info!(
            claim_id = %claim_id,
            covered = summary.items_covered,
            not_covered = summary.items_not_covered,
            review_needed = summary.items_review_needed,
            ms = processing_time_ms,
            "Coverage analysis complete",
        );

        let repair_context_result =
            repair_context
                .primary_component
                .as_ref()
                .map(|component| PrimaryRepairResult {
                    component: Some(component.clone()),
                    category: repair_context.primary_category.clone(),
                    description: repair_context.source_description.clone(),
                    is_covered: repair_context.is_covered.as_bool(),
                    confidence: 0.80,
                    determination_method: DeterminationMethod::RepairContext,
                    source_item_index: None,
                });

        CoverageAnalysisResult {
            claim_id,
            claim_run_id,
            generated_at: chrono::Utc::now(),
            inputs,
            line_items: all_items,
            summary,
            primary_repair,
            repair_context: repair_context_result,
            metadata,
        }
    }

    /// Stage 4: extract component nouns from remaining labor descriptions
    /// and match them against the repair keyword taxonomy. Labor like
    /// "AUS-/EINBAUEN OELKUEHLER" names its component and needs no LLM.
    fn match_labor_by_component_extraction(
        &self,
        remaining: Vec<PendingItem>,
        mut keyword_matched: Vec<LineItemCoverage>,
        covered_categories: &[String],
        covered_components: &BTreeMap<String, Vec<String>>,
    ) -> (Vec<LineItemCoverage>, Vec<PendingItem>) {
        let covered_lower: Vec<String> = covered_categories
            .iter()
            .map(|c| c.to_lowercase())
            .collect();
        let mut new_remaining = Vec::new();

        for pending in remaining {
            if !is_labor_type(&pending.item.item_type) {
                new_remaining.push(pending);
                continue;
            }
            let desc_lower = pending.item.description.to_lowercase();
            if desc_lower.is_empty() {
                new_remaining.push(pending);
                continue;
            }

            let best = self
                .component_config
                .repair_context_keywords
                .iter()
                .filter(|(keyword, _)| desc_lower.contains(keyword.as_str()))
                .max_by_key(|(keyword, _)| keyword.len());
            let Some((keyword, target)) = best else {
                new_remaining.push(pending);
                continue;
            };

            if !covered_lower.contains(&target.category.to_lowercase()) {
                new_remaining.push(pending);
                continue;
            }

            if !covered_components.is_empty() {
                let (is_in_list, _) = policy::is_component_in_policy_list(
                    &self.component_config,
                    Some(&target.component),
                    Some(&target.category),
                    covered_components,
                    &pending.item.description,
                    false,
                );
                if !is_in_list.is_yes() {
                    // Confirmed absent or uncertain: leave for the LLM
                    new_remaining.push(pending);
                    continue;
                }
            }

            let reasoning = format!(
                "Labor component extraction: '{keyword}' in description -> {} ({})",
                target.component, target.category
            );
            let mut tb = TraceBuilder::new();
            tb.extend(&pending.deferred_trace);
            tb.add(
                TraceStep::new(
                    "labor_component_extraction",
                    TraceAction::Matched,
                    format!(
                        "Labor description contains component keyword '{keyword}' -> {} in {}",
                        target.component, target.category
                    ),
                )
                .with_verdict(CoverageStatus::Covered)
                .with_confidence(0.80)
                .with_detail(serde_json::json!({
                    "keyword": keyword,
                    "component": target.component,
                    "category": target.category,
                })),
            );
            tracing::debug!(
                description = %pending.item.description,
                component = %target.component,
                "Labor component extraction match",
            );
            keyword_matched.push(LineItemCoverage {
                coverage_status: CoverageStatus::Covered,
                coverage_category: Some(target.category.clone()),
                matched_component: Some(target.component.clone()),
                match_method: MatchMethod::Keyword,
                match_confidence: 0.80,
                match_reasoning: reasoning,
                covered_amount: pending.item.total_price,
                not_covered_amount: Decimal::ZERO,
                decision_trace: tb.build(),
                ..LineItemCoverage::from_item(pending.index, &pending.item)
            });
        }

        (keyword_matched, new_remaining)
    }

    /// Stage 5: verify keyword-matched items against the policy's explicit
    /// parts lists. Items confirmed absent (`No`) or uncertain (`Unknown`)
    /// are demoted into `remaining` for the LLM; confirmed items get a
    /// validation step.
    fn verify_keyword_matches(
        &self,
        keyword_matched: Vec<LineItemCoverage>,
        remaining: &mut Vec<PendingItem>,
        covered_components: &BTreeMap<String, Vec<String>>,
    ) -> Vec<LineItemCoverage> {
        let mut verified = Vec::new();
        let total = keyword_matched.len();

        for mut item in keyword_matched {
            if item.coverage_status != CoverageStatus::Covered {
                verified.push(item);
                continue;
            }

            let (is_in_list, reason) = policy::is_component_in_policy_list(
                &self.component_config,
                item.matched_component.as_deref(),
                item.coverage_category.as_deref(),
                covered_components,
                &item.description,
                false,
            );

            match is_in_list {
                Trilean::Yes => {
                    item.match_reasoning
                        .push_str(&format!(". Policy check: {reason}"));
                    item.policy_list_confirmed = Trilean::Yes;
                    let mut tb = TraceBuilder::new();
                    tb.extend(&item.decision_trace);
                    tb.add(
                        TraceStep::new(
                            "policy_list_check",
                            TraceAction::Validated,
                            format!("Confirmed in policy list: {reason}"),
                        )
                        .with_detail(serde_json::json!({"result": true, "reason": reason})),
                    );
                    item.decision_trace = tb.build();
                    verified.push(item);
                }
                Trilean::No => {
                    tracing::info!(
                        description = %item.description,
                        component = item.matched_component.as_deref().unwrap_or(""),
                        reason = %reason,
                        "Keyword match demoted to LLM",
                    );
                    remaining.push(demote_to_pending(
                        &item,
                        TraceStep::new(
                            "policy_list_check",
                            TraceAction::Deferred,
                            format!("Demoted to LLM: {reason}"),
                        )
                        .with_detail(serde_json::json!({"result": false, "reason": reason})),
                    ));
                }
                Trilean::Unknown => {
                    tracing::info!(
                        description = %item.description,
                        component = item.matched_component.as_deref().unwrap_or("no component"),
                        reason = %reason,
                        "Keyword match demoted to LLM (uncertain)",
                    );
                    remaining.push(demote_to_pending(
                        &item,
                        TraceStep::new(
                            "policy_list_check",
                            TraceAction::Deferred,
                            format!("Uncertain (synonym gap), demoted to LLM: {reason}"),
                        )
                        .with_detail(serde_json::json!({
                            "result": null,
                            "reason": reason,
                            "matched_component": item.matched_component,
                        })),
                    ));
                }
            }
        }

        let demoted = total - verified.len();
        if demoted > 0 {
            tracing::info!(
                demoted = demoted,
                total = total,
                "Policy list verification demoted keyword matches to LLM",
            );
        }
        verified
    }
}

/// Turn a keyword match back into a pending item for the LLM, carrying its
/// trace forward.
fn demote_to_pending(item: &LineItemCoverage, step: TraceStep) -> PendingItem {
    let mut deferred_trace = item.decision_trace.clone();
    deferred_trace.push(step);
    PendingItem {
        index: item.source_index,
        item: LineItem {
            item_code: item.item_code.clone(),
            description: item.description.clone(),
            item_type: item.item_type.clone(),
            total_price: item.total_price,
            repair_description: None,
        },
        deferred_trace,
        lookup_system: None,
        lookup_component: None,
        repair_context_description: None,
    }
}

fn llm_limit_item(pending: &PendingItem, limit: usize) -> LineItemCoverage {
    let mut tb = TraceBuilder::new();
    tb.extend(&pending.deferred_trace);
    tb.add(
        TraceStep::new("llm", TraceAction::Skipped, "Skipped due to LLM item limit")
            .with_verdict(CoverageStatus::ReviewNeeded)
            .with_confidence(0.0)
            .with_detail(serde_json::json!({"reason": "llm_item_limit", "limit": limit})),
    );
    LineItemCoverage {
        coverage_status: CoverageStatus::ReviewNeeded,
        match_method: MatchMethod::Llm,
        match_confidence: 0.0,
        match_reasoning: "Skipped due to LLM item limit".to_string(),
        decision_trace: tb.build(),
        ..LineItemCoverage::from_item(pending.index, &pending.item)
    }
}

fn llm_disabled_item(pending: &PendingItem) -> LineItemCoverage {
    let mut tb = TraceBuilder::new();
    tb.extend(&pending.deferred_trace);
    tb.add(
        TraceStep::new("llm", TraceAction::Skipped, "LLM fallback disabled")
            .with_verdict(CoverageStatus::ReviewNeeded)
            .with_confidence(0.0)
            .with_detail(serde_json::json!({"reason": "llm_disabled"})),
    );
    LineItemCoverage {
        coverage_status: CoverageStatus::ReviewNeeded,
        match_method: MatchMethod::Keyword,
        match_confidence: 0.0,
        match_reasoning: "No rule or keyword match; LLM fallback disabled".to_string(),
        decision_trace: tb.build(),
        ..LineItemCoverage::from_item(pending.index, &pending.item)
    }
}
