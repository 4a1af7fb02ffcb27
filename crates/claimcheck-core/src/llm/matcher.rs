//! LLM fallback matcher (pipeline stage 6).
//!
//! Classifies residual line items that no deterministic stage could place,
//! through a bounded, retried, parallel worker pool:
//!
//! - at most `max_concurrent` calls in flight, each worker holding its own
//!   client handle (from the injected factory, or the shared primary client)
//! - results reassembled by input index; completion order is not observable
//! - the progress callback fires exactly once per input item
//! - retries use exponential backoff with full jitter and are linked on the
//!   audited client via `mark_retry`
//! - cancellation is cooperative: in-flight calls run to completion,
//!   never-dispatched items short-circuit to REVIEW_NEEDED
//!
//! The matcher also owns the two claim-level LLM calls: the labor-relevance
//! batch check and the primary-repair selection.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::{
    AuditedChatClient, CallContext, ChatClientFactory, ChatMessage, ChatRequest, DefaultPrompts,
    ProgressCallback, PromptMessages, PromptProvider,
};
use crate::error::LlmError;
use crate::trace::TraceBuilder;
use crate::types::{
    CoverageStatus, LineItemCoverage, MatchMethod, PendingItem, TraceAction, TraceStep,
};

fn default_max_concurrent() -> usize {
    3
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_base_delay() -> f64 {
    1.0
}

fn default_retry_max_delay() -> f64 {
    15.0
}

fn default_max_items() -> usize {
    35
}

fn default_temperature() -> f32 {
    0.1
}

fn default_prompt_name() -> String {
    DefaultPrompts::COVERAGE_MATCH.to_string()
}

fn default_labor_relevance_prompt_name() -> String {
    DefaultPrompts::LABOR_RELEVANCE.to_string()
}

fn default_primary_repair_prompt_name() -> String {
    DefaultPrompts::PRIMARY_REPAIR.to_string()
}

/// Tuning for the LLM matcher, loaded from the `llm` config section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmMatcherConfig {
    /// Max concurrent LLM calls (1 = sequential).
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Total attempts per item, including the first.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base backoff delay in seconds.
    #[serde(default = "default_retry_base_delay")]
    pub retry_base_delay: f64,

    /// Backoff delay cap in seconds.
    #[serde(default = "default_retry_max_delay")]
    pub retry_max_delay: f64,

    /// Maximum items classified per claim (cost control).
    #[serde(default = "default_max_items")]
    pub max_items: usize,

    /// Model override passed to the client.
    #[serde(default)]
    pub model: Option<String>,

    /// Sampling temperature.
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Prompt name for per-item classification.
    #[serde(default = "default_prompt_name")]
    pub prompt_name: String,

    /// Prompt name for the labor-relevance batch call.
    #[serde(default = "default_labor_relevance_prompt_name")]
    pub labor_relevance_prompt_name: String,

    /// Prompt name for primary-repair selection.
    #[serde(default = "default_primary_repair_prompt_name")]
    pub primary_repair_prompt_name: String,
}

impl Default for LlmMatcherConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            max_retries: default_max_retries(),
            retry_base_delay: default_retry_base_delay(),
            retry_max_delay: default_retry_max_delay(),
            max_items: default_max_items(),
            model: None,
            temperature: default_temperature(),
            prompt_name: default_prompt_name(),
            labor_relevance_prompt_name: default_labor_relevance_prompt_name(),
            primary_repair_prompt_name: default_primary_repair_prompt_name(),
        }
    }
}

/// A covered part from earlier stages, given to the LLM as claim context.
#[derive(Debug, Clone, Serialize)]
pub struct CoveredPartContext {
    /// The part's item code ("" when absent).
    pub item_code: String,
    /// The part's description.
    pub description: String,
    /// The component it was matched to ("" when absent).
    pub matched_component: String,
}

/// Claim-level context shared by every per-item classification call.
#[derive(Debug, Clone, Default)]
pub struct LlmBatchContext {
    /// Claim identifier for the audit trail.
    pub claim_id: String,
    /// Categories covered by the policy.
    pub covered_categories: Vec<String>,
    /// Policy covered-parts lists by category.
    pub covered_components: BTreeMap<String, Vec<String>>,
    /// Policy excluded-parts lists by category.
    pub excluded_components: BTreeMap<String, Vec<String>>,
    /// Parts already covered by prior stages.
    pub covered_parts_in_claim: Vec<CoveredPartContext>,
}

/// A labor item submitted to the labor-relevance call.
#[derive(Debug, Clone, Serialize)]
pub struct LaborCandidate {
    /// Input-array index of the item.
    pub index: usize,
    /// Labor description.
    pub description: String,
    /// Operation code, when present.
    pub item_code: Option<String>,
    /// Price of the labor line.
    pub total_price: Decimal,
}

/// The LLM's verdict on one labor candidate.
#[derive(Debug, Clone, Deserialize)]
pub struct LaborRelevanceVerdict {
    /// Echoed candidate index.
    pub index: usize,
    /// Whether the labor is mechanically necessary for the primary repair.
    #[serde(default)]
    pub is_relevant: bool,
    /// The LLM's confidence.
    #[serde(default)]
    pub confidence: f64,
    /// The LLM's reasoning.
    #[serde(default)]
    pub reasoning: String,
}

/// A line item formatted for the primary-repair selection call.
#[derive(Debug, Clone, Serialize)]
pub struct PrimaryRepairItem {
    /// Input-array index of the item.
    pub index: usize,
    /// Item description.
    pub description: String,
    /// Item type.
    pub item_type: String,
    /// Item price.
    pub total_price: Decimal,
    /// Our per-item verdict, for the LLM's context.
    pub coverage_status: String,
    /// Our per-item category, when one was assigned.
    pub coverage_category: Option<String>,
}

fn default_selection_confidence() -> f64 {
    0.80
}

/// The LLM's primary-repair selection.
#[derive(Debug, Clone, Deserialize)]
pub struct PrimarySelection {
    /// Index of the primary-repair line item.
    pub primary_item_index: usize,
    /// Component named by the LLM.
    #[serde(default)]
    pub component: Option<String>,
    /// Category named by the LLM.
    #[serde(default)]
    pub category: Option<String>,
    /// The LLM's confidence.
    #[serde(default = "default_selection_confidence")]
    pub confidence: f64,
    /// The LLM's reasoning.
    #[serde(default)]
    pub reasoning: String,
}

#[derive(Debug, Deserialize)]
struct CoverageVerdict {
    is_covered: bool,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    matched_component: Option<String>,
    #[serde(default)]
    confidence: f64,
    #[serde(default)]
    reasoning: String,
}

#[derive(Debug, Deserialize)]
struct LaborRelevanceResponse {
    #[serde(default)]
    labor_items: Vec<LaborRelevanceVerdict>,
}

/// Strip markdown code fences from an LLM response body.
fn strip_markdown_fences(content: &str) -> String {
    let trimmed = content.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed.to_string();
    };
    // Drop the info string ("json") up to the first newline.
    let body = rest.split_once('\n').map_or("", |(_, body)| body);
    let body = body.trim_end();
    let body = body.strip_suffix("```").unwrap_or(body);
    body.trim().to_string()
}

/// Upper bound for the jittered delay before attempt `prior_attempts + 1`.
fn backoff_cap(base: f64, max: f64, prior_attempts: u32) -> f64 {
    (base * 2f64.powi(prior_attempts as i32)).min(max)
}

fn jittered_delay(base: f64, max: f64, prior_attempts: u32) -> f64 {
    let cap = backoff_cap(base, max, prior_attempts);
    if cap > 0.0 {
        rand::thread_rng().gen_range(0.0..cap)
    } else {
        0.0
    }
}

/// LLM fallback matcher. All state except the call counter is read-only
/// across pool workers.
pub struct LlmMatcher {
    config: LlmMatcherConfig,
    client: Option<Arc<dyn AuditedChatClient>>,
    factory: Option<Arc<dyn ChatClientFactory>>,
    prompts: Arc<dyn PromptProvider>,
    call_count: Arc<AtomicUsize>,
}

impl LlmMatcher {
    /// Create a matcher over an injected audited client.
    pub fn new(config: LlmMatcherConfig, client: Option<Arc<dyn AuditedChatClient>>) -> Self {
        Self {
            config,
            client,
            factory: None,
            prompts: Arc::new(DefaultPrompts),
            call_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Use a factory so each pool worker gets its own client handle.
    pub fn with_factory(mut self, factory: Arc<dyn ChatClientFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Replace the prompt provider (defaults to the built-in templates).
    pub fn with_prompts(mut self, prompts: Arc<dyn PromptProvider>) -> Self {
        self.prompts = prompts;
        self
    }

    /// The matcher's tuning.
    pub fn config(&self) -> &LlmMatcherConfig {
        &self.config
    }

    /// Number of per-item classification calls made so far.
    pub fn llm_call_count(&self) -> usize {
        self.call_count.load(Ordering::SeqCst)
    }

    fn worker_client(&self) -> Option<Arc<dyn AuditedChatClient>> {
        match &self.factory {
            Some(factory) => Some(factory.create()),
            None => self.client.clone(),
        }
    }

    /// Classify a single residual item.
    pub async fn match_item(
        &self,
        pending: &PendingItem,
        ctx: &LlmBatchContext,
    ) -> LineItemCoverage {
        match self.worker_client() {
            Some(client) => {
                classify_item(
                    &client,
                    &self.prompts,
                    &self.config,
                    ctx,
                    pending,
                    &self.call_count,
                )
                .await
            }
            None => not_configured_item(pending),
        }
    }

    /// Classify a batch of residual items.
    ///
    /// Output is index-aligned with `items` regardless of completion order.
    pub async fn batch_match(
        &self,
        items: Vec<PendingItem>,
        ctx: &LlmBatchContext,
        on_progress: Option<ProgressCallback>,
        cancel: Option<CancellationToken>,
    ) -> Vec<LineItemCoverage> {
        if items.is_empty() {
            return Vec::new();
        }

        let cancel = cancel.unwrap_or_default();

        let has_client = self.client.is_some() || self.factory.is_some();
        if self.config.max_concurrent <= 1 || items.len() == 1 || !has_client {
            return self
                .batch_match_sequential(items, ctx, on_progress, cancel)
                .await;
        }

        let n = items.len();
        let worker_count = self.config.max_concurrent.min(n);
        let queue: Arc<Mutex<VecDeque<(usize, PendingItem)>>> =
            Arc::new(Mutex::new(items.into_iter().enumerate().collect()));
        let shared_ctx = Arc::new(ctx.clone());
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        let mut handles = Vec::with_capacity(worker_count);
        for _ in 0..worker_count {
            let Some(client) = self.worker_client() else {
                break;
            };
            let queue = Arc::clone(&queue);
            let prompts = Arc::clone(&self.prompts);
            let config = self.config.clone();
            let ctx = Arc::clone(&shared_ctx);
            let counter = Arc::clone(&self.call_count);
            let progress = on_progress.clone();
            let cancel = cancel.clone();
            let tx = tx.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    if cancel.is_cancelled() {
                        break;
                    }
                    let job = queue.lock().expect("llm work queue").pop_front();
                    let Some((pos, pending)) = job else {
                        break;
                    };
                    let result =
                        classify_item(&client, &prompts, &config, &ctx, &pending, &counter).await;
                    if let Some(progress) = &progress {
                        progress(1);
                    }
                    // Receiver lives until all workers finish.
                    let _ = tx.send((pos, result));
                }
            }));
        }
        drop(tx);

        let mut slots: Vec<Option<LineItemCoverage>> = (0..n).map(|_| None).collect();
        while let Some((pos, result)) = rx.recv().await {
            slots[pos] = Some(result);
        }
        for handle in handles {
            let _ = handle.await;
        }

        // Jobs never dispatched (cancellation, or no client at all)
        // short-circuit to REVIEW_NEEDED.
        let leftover: Vec<(usize, PendingItem)> =
            queue.lock().expect("llm work queue").drain(..).collect();
        for (pos, pending) in leftover {
            if let Some(progress) = &on_progress {
                progress(1);
            }
            slots[pos] = Some(cancelled_item(&pending));
        }

        slots
            .into_iter()
            .map(|slot| slot.expect("every LLM batch slot is filled"))
            .collect()
    }

    async fn batch_match_sequential(
        &self,
        items: Vec<PendingItem>,
        ctx: &LlmBatchContext,
        on_progress: Option<ProgressCallback>,
        cancel: CancellationToken,
    ) -> Vec<LineItemCoverage> {
        let mut results = Vec::with_capacity(items.len());
        let client = self.worker_client();
        for pending in &items {
            let result = match &client {
                _ if cancel.is_cancelled() => cancelled_item(pending),
                Some(client) => {
                    classify_item(
                        client,
                        &self.prompts,
                        &self.config,
                        ctx,
                        pending,
                        &self.call_count,
                    )
                    .await
                }
                None => not_configured_item(pending),
            };
            if let Some(progress) = &on_progress {
                progress(1);
            }
            results.push(result);
        }
        results
    }

    /// One batch call asking which labor items are mechanically necessary
    /// for the identified primary repair.
    ///
    /// Transport failures after all retries surface as an error; an
    /// unparseable body resolves every candidate to "not relevant".
    pub async fn classify_labor_for_primary_repair(
        &self,
        labor_items: &[LaborCandidate],
        primary_component: &str,
        primary_category: &str,
        covered_parts_in_claim: &[CoveredPartContext],
        claim_id: &str,
    ) -> Result<Vec<LaborRelevanceVerdict>, LlmError> {
        let client = self.worker_client().ok_or(LlmError::NotConfigured)?;
        client.set_context(CallContext {
            claim_id: claim_id.to_string(),
            purpose: "labor_relevance".to_string(),
        });

        let slots = BTreeMap::from([
            ("primary_component".to_string(), primary_component.to_string()),
            ("primary_category".to_string(), primary_category.to_string()),
            (
                "covered_parts".to_string(),
                serde_json::to_string_pretty(covered_parts_in_claim).unwrap_or_default(),
            ),
            (
                "labor_items".to_string(),
                serde_json::to_string_pretty(labor_items).unwrap_or_default(),
            ),
        ]);
        let prompt = self
            .prompts
            .render(&self.config.labor_relevance_prompt_name, &slots)
            .unwrap_or_else(|| DefaultPrompts::labor_relevance(&slots));

        let content = self.call_with_retries(&client, &prompt).await?;

        let parsed: Result<LaborRelevanceResponse, _> =
            serde_json::from_str(&strip_markdown_fences(&content));
        let verdicts = match parsed {
            Ok(response) => response.labor_items,
            Err(e) => {
                tracing::warn!(
                    claim_id = claim_id,
                    error = %e,
                    "Failed to parse labor relevance response",
                );
                return Ok(labor_items
                    .iter()
                    .map(|item| LaborRelevanceVerdict {
                        index: item.index,
                        is_relevant: false,
                        confidence: 0.0,
                        reasoning: format!("Failed to parse labor relevance response: {e}"),
                    })
                    .collect());
            }
        };

        let by_index: BTreeMap<usize, LaborRelevanceVerdict> =
            verdicts.into_iter().map(|v| (v.index, v)).collect();
        Ok(labor_items
            .iter()
            .map(|item| {
                by_index.get(&item.index).cloned().unwrap_or_else(|| {
                    LaborRelevanceVerdict {
                        index: item.index,
                        is_relevant: false,
                        confidence: 0.0,
                        reasoning: "Missing from LLM response".to_string(),
                    }
                })
            })
            .collect())
    }

    /// One call selecting the claim's primary repair item. `None` when the
    /// call or its parse fails after all retries.
    pub async fn determine_primary_repair(
        &self,
        all_items: &[PrimaryRepairItem],
        covered_components: &BTreeMap<String, Vec<String>>,
        claim_id: &str,
        repair_description: Option<&str>,
    ) -> Option<PrimarySelection> {
        let client = self.worker_client()?;
        client.set_context(CallContext {
            claim_id: claim_id.to_string(),
            purpose: "primary_repair".to_string(),
        });

        let slots = BTreeMap::from([
            (
                "items".to_string(),
                serde_json::to_string_pretty(all_items).unwrap_or_default(),
            ),
            (
                "covered_components".to_string(),
                serde_json::to_string_pretty(covered_components).unwrap_or_default(),
            ),
            (
                "repair_description".to_string(),
                repair_description.unwrap_or("None").to_string(),
            ),
        ]);
        let prompt = self
            .prompts
            .render(&self.config.primary_repair_prompt_name, &slots)
            .unwrap_or_else(|| DefaultPrompts::primary_repair(&slots));

        let mut last_err: Option<LlmError> = None;
        for attempt in 1..=self.config.max_retries.max(1) {
            if attempt > 1 {
                if let Some(id) = client.last_call_id() {
                    client.mark_retry(&id);
                }
                let delay = jittered_delay(
                    self.config.retry_base_delay,
                    self.config.retry_max_delay,
                    attempt - 2,
                );
                if delay > 0.0 {
                    tokio::time::sleep(Duration::from_secs_f64(delay)).await;
                }
            }
            match client.chat(self.build_request(&prompt)).await {
                Ok(response) => {
                    match serde_json::from_str::<PrimarySelection>(&strip_markdown_fences(
                        &response.content,
                    )) {
                        Ok(selection) if selection.primary_item_index < all_items.len() => {
                            return Some(selection);
                        }
                        Ok(selection) => {
                            tracing::warn!(
                                claim_id = claim_id,
                                index = selection.primary_item_index,
                                items = all_items.len(),
                                "Primary repair index out of range",
                            );
                            return None;
                        }
                        Err(e) => last_err = Some(LlmError::Parse(e.to_string())),
                    }
                }
                Err(e) => last_err = Some(e),
            }
        }

        tracing::warn!(
            claim_id = claim_id,
            error = %last_err.map(|e| e.to_string()).unwrap_or_default(),
            "Primary repair determination failed after retries",
        );
        None
    }

    fn build_request(&self, prompt: &PromptMessages) -> ChatRequest {
        ChatRequest {
            messages: vec![
                ChatMessage::system(prompt.system.clone()),
                ChatMessage::user(prompt.user.clone()),
            ],
            model: self.config.model.clone(),
            temperature: self.config.temperature,
            json_response: true,
        }
    }

    async fn call_with_retries(
        &self,
        client: &Arc<dyn AuditedChatClient>,
        prompt: &PromptMessages,
    ) -> Result<String, LlmError> {
        let mut last_err: Option<LlmError> = None;
        for attempt in 1..=self.config.max_retries.max(1) {
            if attempt > 1 {
                if let Some(id) = client.last_call_id() {
                    client.mark_retry(&id);
                }
                let delay = jittered_delay(
                    self.config.retry_base_delay,
                    self.config.retry_max_delay,
                    attempt - 2,
                );
                if delay > 0.0 {
                    tokio::time::sleep(Duration::from_secs_f64(delay)).await;
                }
            }
            match client.chat(self.build_request(prompt)).await {
                Ok(response) => return Ok(response.content),
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or(LlmError::NotConfigured))
    }
}

/// Classify one item, retrying transient failures with jittered backoff.
async fn classify_item(
    client: &Arc<dyn AuditedChatClient>,
    prompts: &Arc<dyn PromptProvider>,
    config: &LlmMatcherConfig,
    ctx: &LlmBatchContext,
    pending: &PendingItem,
    counter: &Arc<AtomicUsize>,
) -> LineItemCoverage {
    counter.fetch_add(1, Ordering::SeqCst);
    client.set_context(CallContext {
        claim_id: ctx.claim_id.clone(),
        purpose: "coverage_match".to_string(),
    });

    let slots = BTreeMap::from([
        ("description".to_string(), pending.item.description.clone()),
        ("item_type".to_string(), pending.item.item_type.clone()),
        (
            "total_price".to_string(),
            pending.item.total_price.to_string(),
        ),
        (
            "covered_categories".to_string(),
            ctx.covered_categories.join(", "),
        ),
        (
            "covered_components".to_string(),
            serde_json::to_string_pretty(&ctx.covered_components).unwrap_or_default(),
        ),
        (
            "excluded_components".to_string(),
            serde_json::to_string_pretty(&ctx.excluded_components).unwrap_or_default(),
        ),
        (
            "covered_parts_in_claim".to_string(),
            serde_json::to_string_pretty(&ctx.covered_parts_in_claim).unwrap_or_default(),
        ),
        (
            "repair_context".to_string(),
            pending
                .repair_context_description
                .clone()
                .unwrap_or_else(|| "None".to_string()),
        ),
    ]);
    let prompt = prompts
        .render(&config.prompt_name, &slots)
        .unwrap_or_else(|| DefaultPrompts::coverage_match(&slots));

    let request = ChatRequest {
        messages: vec![
            ChatMessage::system(prompt.system),
            ChatMessage::user(prompt.user),
        ],
        model: config.model.clone(),
        temperature: config.temperature,
        json_response: true,
    };

    let max_attempts = config.max_retries.max(1);
    let mut last_err: Option<LlmError> = None;
    for attempt in 1..=max_attempts {
        if attempt > 1 {
            if let Some(id) = client.last_call_id() {
                client.mark_retry(&id);
            }
            let delay = jittered_delay(
                config.retry_base_delay,
                config.retry_max_delay,
                attempt - 2,
            );
            if delay > 0.0 {
                tokio::time::sleep(Duration::from_secs_f64(delay)).await;
            }
        }
        match client.chat(request.clone()).await {
            Ok(response) => {
                match serde_json::from_str::<CoverageVerdict>(&strip_markdown_fences(
                    &response.content,
                )) {
                    Ok(verdict) => return verdict_item(pending, &verdict, attempt),
                    Err(e) => {
                        tracing::debug!(
                            description = %pending.item.description,
                            attempt = attempt,
                            error = %e,
                            "LLM response parse failure",
                        );
                        last_err = Some(LlmError::Parse(e.to_string()));
                    }
                }
            }
            Err(e) => {
                tracing::debug!(
                    description = %pending.item.description,
                    attempt = attempt,
                    error = %e,
                    "LLM call failed",
                );
                last_err = Some(e);
            }
        }
    }

    failure_item(pending, max_attempts, last_err)
}

fn verdict_item(pending: &PendingItem, verdict: &CoverageVerdict, attempt: u32) -> LineItemCoverage {
    let status = if verdict.is_covered {
        CoverageStatus::Covered
    } else {
        CoverageStatus::NotCovered
    };
    let mut reasoning = verdict.reasoning.clone();
    if attempt > 1 {
        reasoning.push_str(&format!(" (attempt {attempt})"));
    }
    let confidence = verdict.confidence.clamp(0.0, 1.0);
    let action = if status == CoverageStatus::Covered {
        TraceAction::Matched
    } else {
        TraceAction::Excluded
    };

    let mut tb = TraceBuilder::new();
    tb.extend(&pending.deferred_trace);
    tb.add(
        TraceStep::new("llm", action, reasoning.clone())
            .with_verdict(status)
            .with_confidence(confidence)
            .with_detail(serde_json::json!({
                "category": verdict.category,
                "component": verdict.matched_component,
                "attempt": attempt,
            })),
    );

    let covered = status == CoverageStatus::Covered;
    LineItemCoverage {
        coverage_status: status,
        coverage_category: verdict.category.clone(),
        matched_component: verdict.matched_component.clone(),
        match_method: MatchMethod::Llm,
        match_confidence: confidence,
        match_reasoning: reasoning,
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
    }
}

fn failure_item(
    pending: &PendingItem,
    attempts: u32,
    last_err: Option<LlmError>,
) -> LineItemCoverage {
    let error = last_err.map(|e| e.to_string()).unwrap_or_default();
    let reasoning = format!("LLM matching failed after {attempts} attempts: {error}");
    tracing::warn!(
        description = %pending.item.description,
        attempts = attempts,
        "LLM matching exhausted retries",
    );

    let mut tb = TraceBuilder::new();
    tb.extend(&pending.deferred_trace);
    tb.add(
        TraceStep::new("llm", TraceAction::Deferred, reasoning.clone())
            .with_verdict(CoverageStatus::ReviewNeeded)
            .with_confidence(0.0)
            .with_detail(serde_json::json!({"error": error, "attempts": attempts})),
    );

    LineItemCoverage {
        coverage_status: CoverageStatus::ReviewNeeded,
        match_method: MatchMethod::Llm,
        match_confidence: 0.0,
        match_reasoning: reasoning,
        decision_trace: tb.build(),
        ..LineItemCoverage::from_item(pending.index, &pending.item)
    }
}

fn cancelled_item(pending: &PendingItem) -> LineItemCoverage {
    let mut tb = TraceBuilder::new();
    tb.extend(&pending.deferred_trace);
    tb.add(
        TraceStep::new(
            "llm",
            TraceAction::Skipped,
            "Cancelled before LLM dispatch",
        )
        .with_verdict(CoverageStatus::ReviewNeeded)
        .with_confidence(0.0),
    );
    LineItemCoverage {
        coverage_status: CoverageStatus::ReviewNeeded,
        match_method: MatchMethod::Llm,
        match_confidence: 0.0,
        match_reasoning: "Cancelled before LLM dispatch".to_string(),
        decision_trace: tb.build(),
        ..LineItemCoverage::from_item(pending.index, &pending.item)
    }
}

fn not_configured_item(pending: &PendingItem) -> LineItemCoverage {
    let mut tb = TraceBuilder::new();
    tb.extend(&pending.deferred_trace);
    tb.add(
        TraceStep::new("llm", TraceAction::Skipped, "No LLM client configured")
            .with_verdict(CoverageStatus::ReviewNeeded)
            .with_confidence(0.0),
    );
    LineItemCoverage {
        coverage_status: CoverageStatus::ReviewNeeded,
        match_method: MatchMethod::Llm,
        match_confidence: 0.0,
        match_reasoning: "No LLM client configured".to_string(),
        decision_trace: tb.build(),
        ..LineItemCoverage::from_item(pending.index, &pending.item)
    }
}
