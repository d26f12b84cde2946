//! The agent's tool surface.
//!
//! Every tool is a parameter struct that derives both `Deserialize` and
//! `JsonSchema`, so the wire schema and the parser cannot drift apart.
//! Parsing a function call yields a [`ToolCall`]; applying it runs the
//! tool against the database and records the response on the tool-use
//! block. A [`ToolError::Solvable`] becomes an errored response the
//! agent can read and correct; anything else aborts the transaction.

pub mod chapter;
pub mod prompt;
pub mod system;
pub mod wiki;

use rusqlite::Transaction;
use schemars::r#gen::SchemaGenerator;
use schemars::JsonSchema;
use serde_json::Value;
use tracing::warn;

pub use chapter::ReadChapterParams;
pub use prompt::{ListPromptsParams, ShowPromptParams, WritePromptParams};
pub use system::{RequestExpertFeedbackParams, SpawnAgentParams};
pub use wiki::{ReadWikiPageParams, SearchWikiByNameParams, WriteWikiPageParams};

use crate::db::DbError;
use crate::models::Block;

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    /// A mistake the agent can fix; recorded as an errored tool response.
    #[error("{0}")]
    Solvable(String),

    #[error(transparent)]
    Db(#[from] DbError),
}

#[derive(Debug, thiserror::Error)]
pub enum ToolParseError {
    #[error("unknown tool '{0}'")]
    UnknownTool(String),

    #[error("invalid arguments for '{name}': {source}")]
    InvalidArguments {
        name: String,
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone)]
pub enum ToolCall {
    ReadChapter(ReadChapterParams),
    ReadWikiPage(ReadWikiPageParams),
    WriteWikiPage(WriteWikiPageParams),
    SearchWikiByName(SearchWikiByNameParams),
    ListPrompts(ListPromptsParams),
    ShowPrompt(ShowPromptParams),
    WritePrompt(WritePromptParams),
    SpawnAgent(SpawnAgentParams),
    RequestExpertFeedback(RequestExpertFeedbackParams),
}

/// One function call as received from the provider.
#[derive(Debug, Clone)]
pub struct ToolUse {
    pub id: String,
    pub name: String,
    pub arguments: String,
    pub call: ToolCall,
}

/// Parse a provider function call into a typed tool use.
pub fn parse_tool_use(name: &str, call_id: &str, arguments: &str) -> Result<ToolUse, ToolParseError> {
    let invalid = |source| ToolParseError::InvalidArguments {
        name: name.to_string(),
        source,
    };
    let call = match name {
        "ReadChapter" => ToolCall::ReadChapter(serde_json::from_str(arguments).map_err(invalid)?),
        "ReadWikiPage" => ToolCall::ReadWikiPage(serde_json::from_str(arguments).map_err(invalid)?),
        "WriteWikiPage" => {
            ToolCall::WriteWikiPage(serde_json::from_str(arguments).map_err(invalid)?)
        }
        "SearchWikiByName" => {
            ToolCall::SearchWikiByName(serde_json::from_str(arguments).map_err(invalid)?)
        }
        "ListPrompts" => ToolCall::ListPrompts(serde_json::from_str(arguments).map_err(invalid)?),
        "ShowPrompt" => ToolCall::ShowPrompt(serde_json::from_str(arguments).map_err(invalid)?),
        "WritePrompt" => ToolCall::WritePrompt(serde_json::from_str(arguments).map_err(invalid)?),
        "SpawnAgent" => ToolCall::SpawnAgent(serde_json::from_str(arguments).map_err(invalid)?),
        "RequestExpertFeedback" => {
            ToolCall::RequestExpertFeedback(serde_json::from_str(arguments).map_err(invalid)?)
        }
        other => return Err(ToolParseError::UnknownTool(other.to_string())),
    };
    Ok(ToolUse {
        id: call_id.to_string(),
        name: name.to_string(),
        arguments: arguments.to_string(),
        call,
    })
}

/// Run a tool call against the database and record its response on
/// `block`. Solvable failures become errored responses instead of
/// aborting the transaction.
pub fn apply(tx: &Transaction, block: &Block, call: &ToolCall) -> crate::db::Result<()> {
    let result = match call {
        ToolCall::ReadChapter(params) => params.apply(tx, block),
        ToolCall::ReadWikiPage(params) => params.apply(tx, block),
        ToolCall::WriteWikiPage(params) => params.apply(tx, block),
        ToolCall::SearchWikiByName(params) => params.apply(tx, block),
        ToolCall::ListPrompts(params) => params.apply(tx, block),
        ToolCall::ShowPrompt(params) => params.apply(tx, block),
        ToolCall::WritePrompt(params) => params.apply(tx, block),
        ToolCall::SpawnAgent(params) => params.apply(tx, block),
        ToolCall::RequestExpertFeedback(params) => params.apply(tx, block),
    };
    match result {
        Ok(()) => Ok(()),
        Err(ToolError::Solvable(message)) => {
            warn!(block = block.id, tool = ?block.tool_name, %message, "solvable tool error");
            block.respond_error(tx, &message)
        }
        Err(ToolError::Db(e)) => Err(e),
    }
}

/// A tool as advertised to the provider.
#[derive(Debug, Clone)]
pub struct ToolSpec {
    pub name: &'static str,
    pub description: &'static str,
    pub parameters: Value,
}

/// Every tool the agent can call, in a stable order.
pub fn tool_specs() -> Vec<ToolSpec> {
    vec![
        spec::<ReadChapterParams>(
            "ReadChapter",
            "Read the current chapter, or an earlier one via a negative chapter_offset.",
        ),
        spec::<ReadWikiPageParams>(
            "ReadWikiPage",
            "Read the wiki page with the given slug as it stands right now.",
        ),
        spec::<WriteWikiPageParams>(
            "WriteWikiPage",
            "Create, update, or delete a wiki page. Set create=true for a new page; \
             set delete_and_redirect_to to delete the page and rewrite links to it.",
        ),
        spec::<SearchWikiByNameParams>(
            "SearchWikiByName",
            "Fuzzy-search wiki pages by one or more names or aliases.",
        ),
        spec::<ListPromptsParams>(
            "ListPrompts",
            "List the latest version of every stored prompt.",
        ),
        spec::<ShowPromptParams>(
            "ShowPrompt",
            "Show the full template of a stored prompt.",
        ),
        spec::<WritePromptParams>(
            "WritePrompt",
            "Store a new version of a prompt template. Placeholders use $name or ${name}.",
        ),
        spec::<SpawnAgentParams>(
            "SpawnAgent",
            "Run a stored prompt as a sub-agent. The tool responds with the sub-agent's \
             final answer when it finishes.",
        ),
        spec::<RequestExpertFeedbackParams>(
            "RequestExpertFeedback",
            "Ask a human expert for guidance. The response arrives when the expert answers.",
        ),
    ]
}

fn spec<T: JsonSchema>(name: &'static str, description: &'static str) -> ToolSpec {
    let schema = SchemaGenerator::default().into_root_schema_for::<T>();
    let mut parameters = serde_json::to_value(schema).unwrap_or_else(|_| Value::Null);
    strictify(&mut parameters);
    ToolSpec {
        name,
        description,
        parameters,
    }
}

/// Rewrite a generated schema into the strict form the provider wants:
/// no titles or formats, every property required, no extra properties.
fn strictify(value: &mut Value) {
    let Value::Object(map) = value else {
        return;
    };
    map.remove("title");
    map.remove("format");
    if let Some(Value::Object(properties)) = map.get("properties") {
        let keys: Vec<Value> = properties.keys().cloned().map(Value::String).collect();
        map.insert("required".to_string(), Value::Array(keys));
        map.insert("additionalProperties".to_string(), Value::Bool(false));
    }
    for key in ["properties", "definitions", "$defs"] {
        if let Some(Value::Object(children)) = map.get_mut(key) {
            for child in children.values_mut() {
                strictify(child);
            }
        }
    }
    if let Some(items) = map.get_mut("items") {
        strictify(items);
    }
    for key in ["anyOf", "allOf", "oneOf"] {
        if let Some(Value::Array(variants)) = map.get_mut(key) {
            for variant in variants {
                strictify(variant);
            }
        }
    }
}
