//! Core data model for coverage analysis.
//!
//! All wire-facing enums serialize as their lower-cased snake_case names.
//! Money fields use `rust_decimal::Decimal` so that per-item amounts stay
//! exact: `covered_amount + not_covered_amount == total_price` always holds
//! to stored precision.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Three-valued logic for coverage checks.
///
/// Used where "we could not determine" is a distinct, meaningful outcome:
/// policy-list confirmation, repair-context coverage, and catalog lookup
/// coverage. Serializes as `true` / `false` / `null` so the JSON boundary
/// stays deliberate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Trilean {
    /// Confirmed positive.
    Yes,
    /// Confirmed negative.
    No,
    /// Could not be determined.
    #[default]
    Unknown,
}

impl Trilean {
    /// `true` only for `Yes`.
    pub fn is_yes(self) -> bool {
        self == Trilean::Yes
    }

    /// `true` only for `No`.
    pub fn is_no(self) -> bool {
        self == Trilean::No
    }

    /// Convert to the nullable-boolean wire form.
    pub fn as_bool(self) -> Option<bool> {
        match self {
            Trilean::Yes => Some(true),
            Trilean::No => Some(false),
            Trilean::Unknown => None,
        }
    }
}

impl From<bool> for Trilean {
    fn from(value: bool) -> Self {
        if value {
            Trilean::Yes
        } else {
            Trilean::No
        }
    }
}

impl From<Option<bool>> for Trilean {
    fn from(value: Option<bool>) -> Self {
        match value {
            Some(true) => Trilean::Yes,
            Some(false) => Trilean::No,
            None => Trilean::Unknown,
        }
    }
}

impl Serialize for Trilean {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self.as_bool() {
            Some(b) => serializer.serialize_bool(b),
            None => serializer.serialize_none(),
        }
    }
}

impl<'de> Deserialize<'de> for Trilean {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(Trilean::from(Option::<bool>::deserialize(deserializer)?))
    }
}

/// Final coverage verdict for a line item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoverageStatus {
    /// The item is paid out (subject to the coverage percentage).
    Covered,
    /// The item is not paid out.
    NotCovered,
    /// A human must decide; treated as not covered for the payout base.
    ReviewNeeded,
}

/// Which matching stage produced the final classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMethod {
    /// Deterministic rule engine pattern.
    Rule,
    /// Exact part-number catalog lookup.
    PartNumber,
    /// Keyword / taxonomy match.
    Keyword,
    /// LLM fallback classification.
    Llm,
}

/// What a pipeline stage did to an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceAction {
    Matched,
    Excluded,
    Deferred,
    Skipped,
    Validated,
    Overridden,
    Promoted,
    Demoted,
}

/// One entry in an item's append-only decision trace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceStep {
    /// Pipeline stage name (e.g. "rules", "part_number", "llm").
    pub stage: String,
    /// What the stage did.
    pub action: TraceAction,
    /// Human-readable explanation.
    pub message: String,
    /// Verdict carried by this step, if it set one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verdict: Option<CoverageStatus>,
    /// Confidence attached to the verdict, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    /// Structured details for audit tooling.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<serde_json::Value>,
}

impl TraceStep {
    /// Create a step with no verdict, confidence, or detail.
    pub fn new(stage: &str, action: TraceAction, message: impl Into<String>) -> Self {
        Self {
            stage: stage.to_string(),
            action,
            message: message.into(),
            verdict: None,
            confidence: None,
            detail: None,
        }
    }

    /// Attach a verdict.
    pub fn with_verdict(mut self, verdict: CoverageStatus) -> Self {
        self.verdict = Some(verdict);
        self
    }

    /// Attach a confidence.
    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = Some(confidence);
        self
    }

    /// Attach structured detail.
    pub fn with_detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = Some(detail);
        self
    }
}

/// An extracted invoice line item, as handed over by document extraction.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LineItem {
    /// Part or operation code, when the invoice lists one.
    #[serde(default)]
    pub item_code: Option<String>,
    /// Free-form, possibly multilingual description.
    #[serde(default)]
    pub description: String,
    /// "parts", "labor", "fee", or another extractor-assigned type.
    #[serde(default)]
    pub item_type: String,
    /// Total price of the line.
    #[serde(default)]
    pub total_price: Decimal,
    /// Damage/diagnostic context attached to this item, if extracted.
    #[serde(default)]
    pub repair_description: Option<String>,
}

/// A line item flowing between matcher stages before classification.
///
/// Carries the original input index (identity within a claim), trace steps
/// accumulated by stages that deferred the item, and part-lookup hints for
/// the LLM stage.
#[derive(Debug, Clone)]
pub struct PendingItem {
    /// Index of the item in the claim's input array.
    pub index: usize,
    /// The original line item.
    pub item: LineItem,
    /// Trace steps from stages that touched but did not classify the item.
    pub deferred_trace: Vec<TraceStep>,
    /// Category identified by a deferred part lookup.
    pub lookup_system: Option<String>,
    /// Component identified by a deferred part lookup.
    pub lookup_component: Option<String>,
    /// Repair context narrative passed to the LLM prompt.
    pub repair_context_description: Option<String>,
}

impl PendingItem {
    /// Wrap an input item with no accumulated state.
    pub fn new(index: usize, item: LineItem) -> Self {
        Self {
            index,
            item,
            deferred_trace: Vec::new(),
            lookup_system: None,
            lookup_component: None,
            repair_context_description: None,
        }
    }
}

/// Per-item coverage decision, the unit of the analysis output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineItemCoverage {
    /// Echoed from the input item.
    pub item_code: Option<String>,
    /// Echoed from the input item.
    pub description: String,
    /// Echoed from the input item.
    pub item_type: String,
    /// Echoed from the input item.
    pub total_price: Decimal,
    /// Final verdict.
    pub coverage_status: CoverageStatus,
    /// Policy category the item was matched into.
    pub coverage_category: Option<String>,
    /// Component the item was identified as.
    pub matched_component: Option<String>,
    /// Which stage classified the item.
    pub match_method: MatchMethod,
    /// Classification confidence in `[0.0, 1.0]`.
    pub match_confidence: f64,
    /// Human-readable reasoning, extended by later overrides.
    pub match_reasoning: String,
    /// Machine-readable reason for a negative verdict.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exclusion_reason: Option<String>,
    /// Amount paid out for this item (set by the summary stage).
    pub covered_amount: Decimal,
    /// Amount not paid out for this item (set by the summary stage).
    pub not_covered_amount: Decimal,
    /// Whether the matched component was confirmed against the policy's
    /// explicit parts list.
    #[serde(default)]
    pub policy_list_confirmed: Trilean,
    /// Append-only record of every stage that touched this item.
    pub decision_trace: Vec<TraceStep>,
    /// Input-array index, used to restore input order across the
    /// stage-partitioned pipeline. Not serialized.
    #[serde(skip)]
    pub source_index: usize,
}

impl LineItemCoverage {
    /// Echo input fields into a coverage record with neutral decision
    /// fields; stages override via struct-update syntax.
    pub fn from_item(index: usize, item: &LineItem) -> Self {
        Self {
            item_code: item.item_code.clone(),
            description: item.description.clone(),
            item_type: item.item_type.clone(),
            total_price: item.total_price,
            coverage_status: CoverageStatus::ReviewNeeded,
            coverage_category: None,
            matched_component: None,
            match_method: MatchMethod::Keyword,
            match_confidence: 0.0,
            match_reasoning: String::new(),
            exclusion_reason: None,
            covered_amount: Decimal::ZERO,
            not_covered_amount: item.total_price,
            policy_list_confirmed: Trilean::Unknown,
            decision_trace: Vec::new(),
            source_index: index,
        }
    }
}

/// One tier of a mileage-based coverage scale.
///
/// Tiers carry "from X km onwards" semantics: below the smallest threshold
/// coverage is 100%; at or above a threshold that tier's percent applies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoverageTier {
    /// Odometer reading from which this tier applies.
    pub km_threshold: u64,
    /// Coverage percentage for this tier.
    pub coverage_percent: Decimal,
    /// Reduced rate applied instead when the vehicle exceeds the policy's
    /// age threshold.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub age_coverage_percent: Option<Decimal>,
}

/// Coverage scale as extracted from the policy: either a bare tier list or
/// a wrapper carrying the age threshold alongside the tiers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CoverageScale {
    /// Bare tier list (no age rule in the policy).
    Tiers(Vec<CoverageTier>),
    /// Wrapper with a policy-level age threshold.
    Banded {
        /// Vehicle age from which the reduced age rates apply.
        #[serde(default)]
        age_threshold_years: Option<u32>,
        /// The mileage tiers.
        #[serde(default)]
        tiers: Vec<CoverageTier>,
    },
}

impl CoverageScale {
    /// Normalize both formats into `(age_threshold_years, tiers sorted by
    /// ascending km_threshold)`.
    pub fn normalize(&self) -> (Option<u32>, Vec<CoverageTier>) {
        let (age, mut tiers) = match self {
            CoverageScale::Tiers(tiers) => (None, tiers.clone()),
            CoverageScale::Banded {
                age_threshold_years,
                tiers,
            } => (*age_threshold_years, tiers.clone()),
        };
        tiers.sort_by_key(|t| t.km_threshold);
        (age, tiers)
    }
}

/// Immutable record of what drove the payout math for a claim.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoverageInputs {
    /// Odometer reading at claim time.
    pub vehicle_km: Option<u64>,
    /// Vehicle age in years.
    pub vehicle_age_years: Option<Decimal>,
    /// Mileage-based coverage percentage before age adjustment.
    pub coverage_percent: Option<Decimal>,
    /// Effective coverage percentage after age adjustment.
    pub coverage_percent_effective: Option<Decimal>,
    /// Age threshold from the policy, when one applies.
    pub age_threshold_years: Option<u32>,
    /// Excess percentage, recorded for the downstream screener.
    pub excess_percent: Option<Decimal>,
    /// Minimum excess amount, recorded for the downstream screener.
    pub excess_minimum: Option<Decimal>,
    /// Categories with a non-empty covered-parts list.
    pub covered_categories: Vec<String>,
}

/// Claim-level aggregates over the analyzed line items.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoverageSummary {
    /// Sum of all line item prices.
    pub total_claimed: Decimal,
    /// Payout base: covered amounts after the coverage percentage.
    pub total_covered_before_excess: Decimal,
    /// Covered amounts at 100%, tracked for audit.
    pub total_covered_gross: Decimal,
    /// Gross covered value of parts items.
    pub parts_covered_gross: Decimal,
    /// Gross covered value of labor items.
    pub labor_covered_gross: Decimal,
    /// Sum of not-covered amounts.
    pub total_not_covered: Decimal,
    /// Equal to the payout base; VAT and deductible are the screener's job.
    pub total_payable: Decimal,
    /// Count of COVERED items.
    pub items_covered: usize,
    /// Count of NOT_COVERED items.
    pub items_not_covered: usize,
    /// Count of REVIEW_NEEDED items.
    pub items_review_needed: usize,
    /// Effective (age-adjusted) coverage percentage applied.
    pub coverage_percent: Option<Decimal>,
    /// True when no coverage percentage could be determined; covered items
    /// then carry a zero covered amount.
    pub coverage_percent_missing: bool,
}

/// How the primary repair was determined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeterminationMethod {
    /// Tier 0: single LLM call over the full item list.
    Llm,
    /// Tier 1: value-based heuristic over classified items.
    Deterministic,
    /// Tier 2: repair context extracted from labor descriptions.
    RepairContext,
    /// No primary repair could be determined; the screener should refer.
    None,
}

/// The single failure mode the claim is about.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrimaryRepairResult {
    /// Identified component.
    pub component: Option<String>,
    /// Identified category.
    pub category: Option<String>,
    /// Description of the item or labor that anchored the determination.
    pub description: Option<String>,
    /// Whether the primary repair is covered, when determinable.
    pub is_covered: Option<bool>,
    /// Confidence in the determination.
    pub confidence: f64,
    /// Which tier fired.
    pub determination_method: DeterminationMethod,
    /// Input index of the anchoring line item, when one exists.
    pub source_item_index: Option<usize>,
}

impl PrimaryRepairResult {
    /// The tier-3 fallback: nothing could be determined.
    pub fn none() -> Self {
        Self {
            component: None,
            category: None,
            description: None,
            is_covered: None,
            confidence: 0.0,
            determination_method: DeterminationMethod::None,
            source_item_index: None,
        }
    }
}

/// Counters describing how the pipeline processed a claim.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoverageMetadata {
    /// Items classified by the rule engine.
    pub rules_applied: usize,
    /// Items classified by part-number lookup.
    pub part_numbers_applied: usize,
    /// Items classified by keyword matching (incl. labor extraction).
    pub keywords_applied: usize,
    /// LLM classification calls made (one per classified item).
    pub llm_calls: usize,
    /// Wall-clock processing time.
    pub processing_time_ms: u64,
    /// Configuration version, for regression tracking.
    pub config_version: String,
}

/// Complete result of one `analyze()` call. Immutable once returned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoverageAnalysisResult {
    /// Claim identifier.
    pub claim_id: String,
    /// Processing-run identifier, when the caller tracks runs.
    pub claim_run_id: Option<String>,
    /// When the analysis completed.
    pub generated_at: DateTime<Utc>,
    /// What drove the payout math.
    pub inputs: CoverageInputs,
    /// Per-item decisions, in input order.
    pub line_items: Vec<LineItemCoverage>,
    /// Claim-level aggregates.
    pub summary: CoverageSummary,
    /// The identified primary repair.
    pub primary_repair: PrimaryRepairResult,
    /// The repair context that informed the pipeline, when one was found.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repair_context: Option<PrimaryRepairResult>,
    /// Pipeline counters.
    pub metadata: CoverageMetadata,
}
