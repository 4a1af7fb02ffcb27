//! OpenAI-compatible audited chat client.
//!
//! Works with OpenAI and any endpoint speaking the chat completions
//! format. Every call is assigned an id; `mark_retry` links the next call
//! to the call it replaces so the audit trail reflects the real call
//! graph. Audit events are emitted as structured tracing records; log
//! persistence is the embedding application's concern.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use super::{AuditedChatClient, CallContext, ChatRequest, ChatResponse};
use crate::error::LlmError;

#[derive(Debug, Default)]
struct AuditState {
    context: CallContext,
    last_call_id: Option<String>,
    retry_of: Option<String>,
}

/// An audited chat client using the OpenAI chat completions API format.
pub struct OpenAiChatClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    call_seq: AtomicU64,
    audit: Mutex<AuditState>,
}

impl OpenAiChatClient {
    /// Create a new client for a chat-completions endpoint.
    pub fn new(base_url: String, api_key: String, model: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url,
            api_key,
            model,
            call_seq: AtomicU64::new(0),
            audit: Mutex::new(AuditState::default()),
        }
    }

    fn next_call_id(&self) -> String {
        let seq = self.call_seq.fetch_add(1, Ordering::SeqCst);
        format!("llm_{seq:08x}")
    }
}

#[async_trait::async_trait]
impl AuditedChatClient for OpenAiChatClient {
    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, LlmError> {
        let call_id = self.next_call_id();
        let (claim_id, purpose, retry_of) = {
            let mut audit = self.audit.lock().expect("audit lock");
            audit.last_call_id = Some(call_id.clone());
            (
                audit.context.claim_id.clone(),
                audit.context.purpose.clone(),
                audit.retry_of.take(),
            )
        };

        tracing::debug!(
            call_id = %call_id,
            claim_id = %claim_id,
            purpose = %purpose,
            retry_of = retry_of.as_deref().unwrap_or(""),
            model = %request.model.as_deref().unwrap_or(&self.model),
            "LLM request",
        );

        let body = ChatCompletionRequest {
            model: request.model.as_deref().unwrap_or(&self.model),
            messages: &request.messages,
            temperature: request.temperature,
            response_format: request
                .json_response
                .then(|| ResponseFormat { kind: "json_object" }),
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();

            if status == 429 {
                let retry_after = response
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok())
                    .unwrap_or(60);
                return Err(LlmError::RateLimited {
                    retry_after_secs: retry_after,
                });
            }

            let message = response.text().await.unwrap_or_default();
            return Err(LlmError::Api { status, message });
        }

        let parsed: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| LlmError::Parse(format!("failed to parse response: {e}")))?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .unwrap_or_default();

        tracing::debug!(call_id = %call_id, chars = content.len(), "LLM response");

        Ok(ChatResponse { content })
    }

    fn set_context(&self, context: CallContext) {
        self.audit.lock().expect("audit lock").context = context;
    }

    fn mark_retry(&self, prev_call_id: &str) {
        let mut audit = self.audit.lock().expect("audit lock");
        audit.retry_of = Some(prev_call_id.to_string());
        tracing::debug!(retry_of = prev_call_id, "Next LLM call marked as retry");
    }

    fn last_call_id(&self) -> Option<String> {
        self.audit.lock().expect("audit lock").last_call_id.clone()
    }
}

// --- Internal Serde types ---

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [super::ChatMessage],
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: String,
}
