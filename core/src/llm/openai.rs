//! OpenAI Responses API provider, background mode.
//!
//! Requests are submitted with `background: true` and polled later by
//! response id. Model, verbosity, reasoning effort, service tier, and
//! the poll timeout all come from the configuration table at call time,
//! so they can be changed mid-run.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use super::retry::{self, RetryConfig};
use super::{InputItem, LlmError, LlmResponse, LlmService, PromptRequest, Result};
use crate::db::Store;
use crate::models::Configuration;
use crate::tools;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Provider error codes that mean "try the whole turn again".
const RETRYABLE_CODES: &[&str] = &["server_error"];

const COMPRESS_METADATA_KEY: &str = "compress";
const COMPRESS_METADATA_VALUE: &str = "true";

pub struct OpenAiService {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    store: Arc<Store>,
    retry: RetryConfig,
}

impl OpenAiService {
    pub fn new(store: Arc<Store>, api_key: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key,
            store,
            retry: RetryConfig::default(),
        }
    }

    /// Point the service at a different endpoint, for tests and proxies.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn build_request(&self, request: &PromptRequest) -> Result<Value> {
        let settings = self.store.with_tx(|tx| {
            Ok(ProviderSettings {
                model: Configuration::openai_model(tx)?.to_string(),
                verbosity: Configuration::openai_verbosity(tx)?.to_string(),
                reasoning_effort: Configuration::openai_reasoning_effort(tx)?.to_string(),
                service_tier: Configuration::openai_service_tier(tx)?.to_string(),
                system_prompt: Configuration::system_prompt(tx)?,
            })
        })?;

        let input: Vec<WireInput> = request
            .input
            .iter()
            .map(|item| match item {
                InputItem::UserText(text) => WireInput::Message {
                    role: "user".to_string(),
                    content: text.clone(),
                },
                InputItem::ToolOutput { call_id, output } => WireInput::FunctionCallOutput {
                    call_id: call_id.clone(),
                    output: output.clone(),
                },
            })
            .collect();

        let tools = if request.compressing {
            None
        } else {
            Some(
                tools::tool_specs()
                    .into_iter()
                    .map(|spec| WireTool {
                        r#type: "function",
                        name: spec.name,
                        description: spec.description,
                        parameters: spec.parameters,
                        strict: true,
                    })
                    .collect::<Vec<_>>(),
            )
        };

        let body = ResponsesRequest {
            model: settings.model,
            input,
            background: true,
            service_tier: settings.service_tier,
            instructions: request
                .system_message
                .clone()
                .unwrap_or(settings.system_prompt),
            tools,
            tool_choice: "auto",
            previous_response_id: request.previously.clone(),
            reasoning: Reasoning {
                effort: settings.reasoning_effort,
            },
            text: TextOptions {
                verbosity: settings.verbosity,
            },
            metadata: BTreeMap::from([(
                COMPRESS_METADATA_KEY.to_string(),
                if request.compressing {
                    COMPRESS_METADATA_VALUE.to_string()
                } else {
                    String::new()
                },
            )]),
        };
        serde_json::to_value(&body)
            .map_err(|e| LlmError::MalformedInput(format!("unserializable request: {e}")))
    }

    async fn post_json(&self, url: &str, body: &Value) -> Result<Value> {
        retry::with_backoff(&self.retry, || async {
            let response = self
                .client
                .post(url)
                .bearer_auth(&self.api_key)
                .json(body)
                .send()
                .await?;
            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(LlmError::Api {
                    status: status.as_u16(),
                    body,
                });
            }
            Ok(response.json::<Value>().await?)
        })
        .await
    }

    async fn get_json(&self, url: &str) -> Result<Value> {
        retry::with_backoff(&self.retry, || async {
            let response = self
                .client
                .get(url)
                .bearer_auth(&self.api_key)
                .send()
                .await?;
            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(LlmError::Api {
                    status: status.as_u16(),
                    body,
                });
            }
            Ok(response.json::<Value>().await?)
        })
        .await
    }

    async fn cancel(&self, response_id: &str) {
        // Best effort. A response that cannot be cancelled will finish
        // on its own and be superseded by the resubmission.
        let url = format!("{}/responses/{response_id}/cancel", self.base_url);
        if let Err(e) = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .send()
            .await
        {
            warn!(response = response_id, error = %e, "cancel request failed");
        }
    }
}

#[async_trait::async_trait]
impl LlmService for OpenAiService {
    async fn prompt(&self, request: PromptRequest) -> Result<String> {
        let body = self.build_request(&request)?;
        let url = format!("{}/responses", self.base_url);
        let raw = self.post_json(&url, &body).await?;
        let envelope: ResponseEnvelope = serde_json::from_value(raw)
            .map_err(|e| LlmError::NonRetryable(format!("unparseable submit response: {e}")))?;
        info!(response = %envelope.id, compressing = request.compressing, "submitted background request");
        Ok(envelope.id)
    }

    async fn try_fetch(&self, response_id: &str) -> Result<Option<LlmResponse>> {
        let timeout_minutes = self
            .store
            .with_tx(Configuration::openai_timeout_minutes)?;
        let url = format!("{}/responses/{response_id}", self.base_url);
        let raw = self.get_json(&url).await?;
        let envelope: ResponseEnvelope = serde_json::from_value(raw)
            .map_err(|e| LlmError::NonRetryable(format!("unparseable response: {e}")))?;

        match evaluate(envelope, timeout_minutes, Utc::now().timestamp())? {
            FetchState::Running => {
                debug!(response = response_id, "response still running");
                Ok(None)
            }
            FetchState::TimedOut => {
                warn!(response = response_id, timeout_minutes, "response timed out, cancelling");
                self.cancel(response_id).await;
                Err(LlmError::Retryable(format!(
                    "response {response_id} exceeded {timeout_minutes} minute timeout"
                )))
            }
            FetchState::Done(response) => Ok(Some(response)),
        }
    }
}

struct ProviderSettings {
    model: String,
    verbosity: String,
    reasoning_effort: String,
    service_tier: String,
    system_prompt: String,
}

#[derive(Serialize)]
struct ResponsesRequest {
    model: String,
    input: Vec<WireInput>,
    background: bool,
    service_tier: String,
    instructions: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<WireTool>>,
    tool_choice: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    previous_response_id: Option<String>,
    reasoning: Reasoning,
    text: TextOptions,
    metadata: BTreeMap<String, String>,
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireInput {
    Message { role: String, content: String },
    FunctionCallOutput { call_id: String, output: String },
}

#[derive(Serialize)]
struct WireTool {
    r#type: &'static str,
    name: &'static str,
    description: &'static str,
    parameters: Value,
    strict: bool,
}

#[derive(Serialize)]
struct Reasoning {
    effort: String,
}

#[derive(Serialize)]
struct TextOptions {
    verbosity: String,
}

#[derive(Debug, Deserialize)]
struct ResponseEnvelope {
    id: String,
    status: String,
    #[serde(default)]
    created_at: Option<i64>,
    #[serde(default)]
    error: Option<ApiErrorBody>,
    #[serde(default)]
    output: Vec<OutputItem>,
    #[serde(default)]
    usage: Option<Usage>,
    #[serde(default)]
    metadata: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    #[serde(default)]
    input_tokens: i64,
    #[serde(default)]
    output_tokens: i64,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum OutputItem {
    Message {
        #[serde(default)]
        content: Vec<ContentItem>,
    },
    FunctionCall {
        call_id: String,
        name: String,
        arguments: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentItem {
    OutputText { text: String },
    Refusal { refusal: String },
    #[serde(other)]
    Other,
}

enum FetchState {
    Running,
    TimedOut,
    Done(LlmResponse),
}

/// Decide what a polled envelope means, without side effects.
fn evaluate(envelope: ResponseEnvelope, timeout_minutes: i64, now_ts: i64) -> Result<FetchState> {
    match envelope.status.as_str() {
        "queued" | "in_progress" => {
            if let Some(created_at) = envelope.created_at {
                if now_ts - created_at > timeout_minutes * 60 {
                    return Ok(FetchState::TimedOut);
                }
            }
            Ok(FetchState::Running)
        }
        "failed" => {
            let (code, message) = envelope
                .error
                .map(|e| (e.code.unwrap_or_default(), e.message.unwrap_or_default()))
                .unwrap_or_default();
            if RETRYABLE_CODES.contains(&code.as_str()) {
                Err(LlmError::Retryable(format!("{code}: {message}")))
            } else {
                Err(LlmError::NonRetryable(format!("{code}: {message}")))
            }
        }
        "cancelled" => Err(LlmError::Retryable("response was cancelled".to_string())),
        "completed" => Ok(FetchState::Done(parse_completed(envelope)?)),
        other => Err(LlmError::NonRetryable(format!(
            "unexpected response status '{other}'"
        ))),
    }
}

fn parse_completed(envelope: ResponseEnvelope) -> Result<LlmResponse> {
    let mut texts = Vec::new();
    let mut tool_uses = Vec::new();
    for item in envelope.output {
        match item {
            OutputItem::Message { content } => {
                for part in content {
                    match part {
                        ContentItem::OutputText { text } => texts.push(text),
                        ContentItem::Refusal { refusal } => {
                            return Err(LlmError::NonRetryable(format!(
                                "model refused: {refusal}"
                            )));
                        }
                        ContentItem::Other => {
                            return Err(LlmError::NonRetryable(
                                "unsupported content type in response".to_string(),
                            ));
                        }
                    }
                }
            }
            OutputItem::FunctionCall {
                call_id,
                name,
                arguments,
            } => {
                let parsed = tools::parse_tool_use(&name, &call_id, &arguments)
                    .map_err(|e| LlmError::Retryable(e.to_string()))?;
                tool_uses.push(parsed);
            }
            OutputItem::Other => {}
        }
    }
    let usage = envelope.usage.unwrap_or(Usage {
        input_tokens: 0,
        output_tokens: 0,
    });
    let compressing = envelope
        .metadata
        .get(COMPRESS_METADATA_KEY)
        .is_some_and(|v| v == COMPRESS_METADATA_VALUE);
    Ok(LlmResponse {
        texts,
        tool_uses,
        input_tokens: usage.input_tokens,
        output_tokens: usage.output_tokens,
        compressing,
        updated_previously: envelope.id,
    })
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::tools::ToolCall;

    fn envelope(json: serde_json::Value) -> ResponseEnvelope {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn completed_response_parses_texts_and_tools() {
        let state = evaluate(
            envelope(serde_json::json!({
                "id": "resp_1",
                "status": "completed",
                "created_at": 1000,
                "output": [
                    {"type": "reasoning", "summary": []},
                    {"type": "message", "content": [
                        {"type": "output_text", "text": "Reading the chapter now."}
                    ]},
                    {"type": "function_call", "call_id": "call_1",
                     "name": "ReadChapter", "arguments": "{\"chapter_offset\": null}"}
                ],
                "usage": {"input_tokens": 120, "output_tokens": 40},
                "metadata": {"compress": ""}
            })),
            60,
            2000,
        )
        .unwrap();
        let FetchState::Done(response) = state else {
            panic!("expected completed response");
        };
        assert_eq!(response.texts, vec!["Reading the chapter now."]);
        assert_eq!(response.tool_uses.len(), 1);
        assert!(matches!(response.tool_uses[0].call, ToolCall::ReadChapter(_)));
        assert_eq!(response.input_tokens, 120);
        assert_eq!(response.output_tokens, 40);
        assert!(!response.compressing);
        assert_eq!(response.updated_previously, "resp_1");
    }

    #[test]
    fn compression_flag_comes_from_metadata() {
        let state = evaluate(
            envelope(serde_json::json!({
                "id": "resp_2",
                "status": "completed",
                "output": [],
                "metadata": {"compress": "true"}
            })),
            60,
            0,
        )
        .unwrap();
        let FetchState::Done(response) = state else {
            panic!("expected completed response");
        };
        assert!(response.compressing);
    }

    #[test]
    fn in_progress_is_running_until_timeout() {
        let fresh = evaluate(
            envelope(serde_json::json!({
                "id": "resp_3", "status": "in_progress", "created_at": 1000
            })),
            60,
            1000 + 59 * 60,
        )
        .unwrap();
        assert!(matches!(fresh, FetchState::Running));

        let stale = evaluate(
            envelope(serde_json::json!({
                "id": "resp_3", "status": "queued", "created_at": 1000
            })),
            60,
            1000 + 61 * 60,
        )
        .unwrap();
        assert!(matches!(stale, FetchState::TimedOut));
    }

    #[test]
    fn failure_codes_split_retryable_from_fatal() {
        let retryable = evaluate(
            envelope(serde_json::json!({
                "id": "r", "status": "failed",
                "error": {"code": "server_error", "message": "upstream blew up"}
            })),
            60,
            0,
        );
        assert!(matches!(retryable, Err(LlmError::Retryable(_))));

        let fatal = evaluate(
            envelope(serde_json::json!({
                "id": "r", "status": "failed",
                "error": {"code": "invalid_prompt", "message": "rejected"}
            })),
            60,
            0,
        );
        assert!(matches!(fatal, Err(LlmError::NonRetryable(_))));

        let cancelled = evaluate(
            envelope(serde_json::json!({"id": "r", "status": "cancelled"})),
            60,
            0,
        );
        assert!(matches!(cancelled, Err(LlmError::Retryable(_))));
    }

    #[test]
    fn refusals_and_unknown_content_are_fatal() {
        let refused = evaluate(
            envelope(serde_json::json!({
                "id": "r", "status": "completed",
                "output": [{"type": "message", "content": [
                    {"type": "refusal", "refusal": "cannot comply"}
                ]}]
            })),
            60,
            0,
        );
        assert!(matches!(refused, Err(LlmError::NonRetryable(_))));

        let unknown = evaluate(
            envelope(serde_json::json!({
                "id": "r", "status": "completed",
                "output": [{"type": "message", "content": [
                    {"type": "output_audio", "data": ""}
                ]}]
            })),
            60,
            0,
        );
        assert!(matches!(unknown, Err(LlmError::NonRetryable(_))));
    }

    #[test]
    fn unparseable_tool_arguments_are_retryable() {
        let result = evaluate(
            envelope(serde_json::json!({
                "id": "r", "status": "completed",
                "output": [{"type": "function_call", "call_id": "c",
                            "name": "ReadWikiPage", "arguments": "{not json"}]
            })),
            60,
            0,
        );
        assert!(matches!(result, Err(LlmError::Retryable(_))));
    }
}
