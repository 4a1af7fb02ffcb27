//! LLM client abstraction and prompt provisioning.
//!
//! The analyzer never talks to an LLM endpoint directly: it goes through
//! an audited client trait whose implementation carries the audit trail
//! (call ids, retry linkage, per-claim context). For the parallel matcher,
//! a client factory hands each pool worker its own client handle.

pub mod matcher;
pub mod openai;

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::LlmError;

/// A single chat message.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ChatMessage {
    /// "system" or "user".
    pub role: String,
    /// Message text.
    pub content: String,
}

impl ChatMessage {
    /// Build a system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    /// Build a user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// A chat completion request.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    /// Conversation messages, system first.
    pub messages: Vec<ChatMessage>,
    /// Model override; the client's configured model when `None`.
    pub model: Option<String>,
    /// Sampling temperature.
    pub temperature: f32,
    /// Demand a JSON object response from the endpoint.
    pub json_response: bool,
}

/// A chat completion response.
#[derive(Debug, Clone)]
pub struct ChatResponse {
    /// The generated text content.
    pub content: String,
}

/// Audit context attached to subsequent calls on a client.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    /// Claim the calls belong to.
    pub claim_id: String,
    /// What the calls are for (e.g. "coverage_match").
    pub purpose: String,
}

/// Audited chat client.
///
/// Implementations record every call with an id and link retries to the
/// call they replace, so the audit trail reflects the real call graph.
/// Object-safe for use as `Arc<dyn AuditedChatClient>`.
#[async_trait::async_trait]
pub trait AuditedChatClient: Send + Sync {
    /// Send a chat completion request.
    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, LlmError>;

    /// Attach audit context to subsequent calls.
    fn set_context(&self, context: CallContext);

    /// Mark the next call as a retry of a previous call id.
    fn mark_retry(&self, prev_call_id: &str);

    /// Id of the most recent call made through this client.
    fn last_call_id(&self) -> Option<String>;
}

/// Creates one client per pool worker.
pub trait ChatClientFactory: Send + Sync {
    /// Create a fresh client handle.
    fn create(&self) -> Arc<dyn AuditedChatClient>;
}

/// Callback fired once per LLM-processed item (always with the value 1) or
/// once at batch start (with the total item count).
pub type ProgressCallback = Arc<dyn Fn(usize) + Send + Sync>;

/// A rendered prompt: system and user message bodies.
#[derive(Debug, Clone)]
pub struct PromptMessages {
    /// System message.
    pub system: String,
    /// User message.
    pub user: String,
}

/// Provides prompt templates keyed by name with `{slot}` placeholders.
pub trait PromptProvider: Send + Sync {
    /// Render the named prompt with the given slot values. `None` when the
    /// provider does not know the name.
    fn render(&self, name: &str, slots: &BTreeMap<String, String>) -> Option<PromptMessages>;
}

fn fill(template: &str, slots: &BTreeMap<String, String>) -> String {
    let mut out = template.to_string();
    for (key, value) in slots {
        out = out.replace(&format!("{{{key}}}"), value);
    }
    out
}

/// Built-in prompt templates for the three analyzer call kinds.
#[derive(Debug, Default)]
pub struct DefaultPrompts;

impl DefaultPrompts {
    /// Prompt name for per-item coverage classification.
    pub const COVERAGE_MATCH: &'static str = "coverage_match";
    /// Prompt name for the labor-relevance batch call.
    pub const LABOR_RELEVANCE: &'static str = "labor_relevance";
    /// Prompt name for primary-repair selection.
    pub const PRIMARY_REPAIR: &'static str = "primary_repair";

    /// Render the built-in coverage classification prompt.
    pub fn coverage_match(slots: &BTreeMap<String, String>) -> PromptMessages {
        PromptMessages {
            system: fill(COVERAGE_SYSTEM, slots),
            user: fill(COVERAGE_USER, slots),
        }
    }

    /// Render the built-in labor-relevance prompt.
    pub fn labor_relevance(slots: &BTreeMap<String, String>) -> PromptMessages {
        PromptMessages {
            system: fill(LABOR_RELEVANCE_SYSTEM, slots),
            user: fill(LABOR_RELEVANCE_USER, slots),
        }
    }

    /// Render the built-in primary-repair prompt.
    pub fn primary_repair(slots: &BTreeMap<String, String>) -> PromptMessages {
        PromptMessages {
            system: fill(PRIMARY_REPAIR_SYSTEM, slots),
            user: fill(PRIMARY_REPAIR_USER, slots),
        }
    }
}

const COVERAGE_SYSTEM: &str = "You are a warranty claims adjudicator for vehicle repair \
invoices. Decide whether a single invoice line item is covered by the policy. The policy's \
covered-parts lists are representative, not exhaustive; the excluded-parts lists are \
authoritative. Answer with a single JSON object: {\"is_covered\": bool, \"category\": string, \
\"matched_component\": string, \"confidence\": number, \"reasoning\": string}.";

const COVERAGE_USER: &str = "Line item:\n  description: {description}\n  item_type: \
{item_type}\n  total_price: {total_price}\n\nCovered categories: {covered_categories}\n\
Covered components by category:\n{covered_components}\n\nExcluded components by category:\n\
{excluded_components}\n\nParts already covered in this claim:\n{covered_parts_in_claim}\n\n\
Repair context: {repair_context}";

const LABOR_RELEVANCE_SYSTEM: &str = "You are a warranty claims adjudicator. The primary \
repair of this claim is known. Decide which of the listed labor items are mechanically \
necessary to perform that repair (removal, installation, access work). Answer with a single \
JSON object: {\"labor_items\": [{\"index\": int, \"is_relevant\": bool, \"confidence\": \
number, \"reasoning\": string}]}.";

const LABOR_RELEVANCE_USER: &str = "Primary repair: {primary_component} in category \
{primary_category}\n\nCovered parts in this claim:\n{covered_parts}\n\nLabor items to \
assess:\n{labor_items}";

const PRIMARY_REPAIR_SYSTEM: &str = "You are a warranty claims adjudicator. Given all line \
items of a repair invoice, identify the single primary repair the claim is about. Answer \
with a single JSON object: {\"primary_item_index\": int, \"component\": string, \
\"category\": string, \"confidence\": number, \"reasoning\": string}.";

const PRIMARY_REPAIR_USER: &str = "Line items:\n{items}\n\nCovered components by category:\n\
{covered_components}\n\nDamage / diagnostic context: {repair_description}";

impl PromptProvider for DefaultPrompts {
    fn render(&self, name: &str, slots: &BTreeMap<String, String>) -> Option<PromptMessages> {
        let (system, user) = match name {
            Self::COVERAGE_MATCH => (COVERAGE_SYSTEM, COVERAGE_USER),
            Self::LABOR_RELEVANCE => (LABOR_RELEVANCE_SYSTEM, LABOR_RELEVANCE_USER),
            Self::PRIMARY_REPAIR => (PRIMARY_REPAIR_SYSTEM, PRIMARY_REPAIR_USER),
            _ => return None,
        };
        Some(PromptMessages {
            system: fill(system, slots),
            user: fill(user, slots),
        })
    }
}
