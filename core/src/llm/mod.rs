//! LLM provider abstraction.
//!
//! Providers work in background mode: `prompt` submits a request and
//! returns an opaque response id, and `try_fetch` polls it later. The
//! two calls may land in different process lifetimes, so nothing about
//! an in-flight request lives in memory.

pub mod openai;
pub mod retry;

use async_trait::async_trait;

use crate::tools::ToolUse;

pub type Result<T> = std::result::Result<T, LlmError>;

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    /// Transient provider failure. The caller clears the waiting marker
    /// and resubmits the conversation later.
    #[error("retryable provider failure: {0}")]
    Retryable(String),

    /// The provider rejected the request for good; retrying the same
    /// input will not help.
    #[error("provider failure: {0}")]
    NonRetryable(String),

    /// A snapshot block could not be converted into provider input.
    #[error("malformed input: {0}")]
    MalformedInput(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("api error (status {status}): {body}")]
    Api { status: u16, body: String },

    #[error(transparent)]
    Db(#[from] crate::db::DbError),
}

impl LlmError {
    /// Failures worth an immediate in-process retry with backoff:
    /// connection problems, timeouts, rate limits, and server errors.
    pub fn is_transient(&self) -> bool {
        match self {
            LlmError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            LlmError::Api { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

/// One item of conversation input, already flattened from blocks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputItem {
    UserText(String),
    ToolOutput { call_id: String, output: String },
}

/// Everything needed to submit one conversation turn.
#[derive(Debug, Clone)]
pub struct PromptRequest {
    /// Provider continuation handle from the previous turn.
    pub previously: Option<String>,
    pub input: Vec<InputItem>,
    /// Overrides the configured system prompt when set.
    pub system_message: Option<String>,
    /// Compression turns carry no tools and are tagged in metadata.
    pub compressing: bool,
}

/// A completed background response.
#[derive(Debug)]
pub struct LlmResponse {
    pub texts: Vec<String>,
    pub tool_uses: Vec<ToolUse>,
    pub input_tokens: i64,
    pub output_tokens: i64,
    /// True when this response answers a compression turn.
    pub compressing: bool,
    /// Continuation handle for the next turn.
    pub updated_previously: String,
}

#[async_trait]
pub trait LlmService: Send + Sync {
    /// Submit a background request; returns the provider's response id.
    async fn prompt(&self, request: PromptRequest) -> Result<String>;

    /// Poll a background response. `Ok(None)` means still running.
    async fn try_fetch(&self, response_id: &str) -> Result<Option<LlmResponse>>;
}
