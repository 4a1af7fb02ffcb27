//! Coverage-percent determination and payout summary (pipeline stage 10).
//!
//! Downstream payout math (VAT, deductible, coverage caps) belongs to the
//! screener; this stage only applies the effective coverage percentage and
//! aggregates totals. For every item `covered_amount + not_covered_amount
//! == total_price` holds exactly.

use rust_decimal::Decimal;

use crate::normalize::{is_labor_type, is_parts_type};
use crate::types::{CoverageStatus, CoverageSummary, CoverageTier, LineItemCoverage};

/// Determine the coverage percentage from the mileage scale.
///
/// Tiers carry "from X km onwards" semantics: below the smallest threshold
/// coverage is 100% (and no tier age rate applies); at or above a
/// threshold, the highest applicable tier wins. When the vehicle's age
/// reaches the policy's age threshold and the applicable tier defines an
/// age rate, that rate supersedes the mileage rate.
///
/// Returns `(mileage_percent, effective_percent)`.
pub(crate) fn determine_coverage_percent(
    vehicle_km: Option<u64>,
    tiers: &[CoverageTier],
    vehicle_age_years: Option<Decimal>,
    age_threshold_years: Option<u32>,
) -> (Option<Decimal>, Option<Decimal>) {
    let Some(km) = vehicle_km.filter(|km| *km > 0) else {
        return (None, None);
    };
    if tiers.is_empty() {
        return (None, None);
    }

    // Callers pass tiers sorted ascending (CoverageScale::normalize).
    let first_threshold = tiers[0].km_threshold;
    let (mileage_percent, tier_age_percent) = if km < first_threshold {
        (Decimal::ONE_HUNDRED, None)
    } else {
        let mut applicable = &tiers[0];
        for tier in tiers {
            if km >= tier.km_threshold {
                applicable = tier;
            } else {
                break;
            }
        }
        (applicable.coverage_percent, applicable.age_coverage_percent)
    };

    let mut effective_percent = mileage_percent;
    if let (Some(age), Some(threshold), Some(age_rate)) =
        (vehicle_age_years, age_threshold_years, tier_age_percent)
    {
        if age >= Decimal::from(threshold) {
            effective_percent = age_rate;
            tracing::info!(
                age = %age,
                threshold = threshold,
                age_rate = %age_rate,
                mileage_rate = %mileage_percent,
                "Age-based coverage reduction applied",
            );
        }
    }

    (Some(mileage_percent), Some(effective_percent))
}

/// Apply the effective coverage percentage to every item and aggregate the
/// claim totals. Mutates the per-item amounts in place.
pub(crate) fn calculate_summary(
    line_items: &mut [LineItemCoverage],
    coverage_percent: Option<Decimal>,
) -> CoverageSummary {
    let mut summary = CoverageSummary {
        coverage_percent,
        coverage_percent_missing: coverage_percent.is_none(),
        ..CoverageSummary::default()
    };

    for item in line_items.iter_mut() {
        summary.total_claimed += item.total_price;

        match item.coverage_status {
            CoverageStatus::Covered => {
                summary.total_covered_gross += item.total_price;
                if is_parts_type(&item.item_type) {
                    summary.parts_covered_gross += item.total_price;
                } else if is_labor_type(&item.item_type) {
                    summary.labor_covered_gross += item.total_price;
                }
                let covered_amount = match coverage_percent {
                    Some(percent) => item.total_price * percent / Decimal::ONE_HUNDRED,
                    None => {
                        // Unknown rate: don't silently pay 100%. Track the
                        // gross for audit but pay nothing until reviewed.
                        tracing::warn!(
                            description = %item.description,
                            price = %item.total_price,
                            "coverage_percent missing - covered amount set to 0",
                        );
                        Decimal::ZERO
                    }
                };
                item.covered_amount = covered_amount;
                item.not_covered_amount = item.total_price - covered_amount;
                summary.total_covered_before_excess += covered_amount;
                summary.items_covered += 1;
            }
            CoverageStatus::NotCovered => {
                item.covered_amount = Decimal::ZERO;
                item.not_covered_amount = item.total_price;
                summary.total_not_covered += item.total_price;
                summary.items_not_covered += 1;
            }
            CoverageStatus::ReviewNeeded => {
                // Conservatively not covered until reviewed
                item.covered_amount = Decimal::ZERO;
                item.not_covered_amount = item.total_price;
                summary.total_not_covered += item.total_price;
                summary.items_review_needed += 1;
            }
        }
    }

    summary.total_payable = summary.total_covered_before_excess;
    summary
}
