//! Stored prompt management.

use rusqlite::Transaction;
use schemars::JsonSchema;
use serde::Deserialize;

use super::ToolError;
use crate::models::{Block, Prompt};

fn variables_line(prompt: &Prompt) -> String {
    let identifiers = prompt.template().identifiers();
    if identifiers.is_empty() {
        "none".to_string()
    } else {
        identifiers.join(", ")
    }
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ListPromptsParams {}

impl ListPromptsParams {
    pub(super) fn apply(&self, tx: &Transaction, block: &Block) -> Result<(), ToolError> {
        let prompts = Prompt::list_latest(tx)?;
        if prompts.is_empty() {
            block.respond(tx, "There are no stored prompts.")?;
            return Ok(());
        }
        let entries: Vec<String> = prompts
            .iter()
            .map(|prompt| {
                format!(
                    "Key: {}\nSummary: {}\nVariables: {}",
                    prompt.key,
                    prompt.summary,
                    variables_line(prompt)
                )
            })
            .collect();
        block.respond(tx, &entries.join("\n\n"))?;
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ShowPromptParams {
    /// Key of the prompt to show.
    pub key: String,
}

impl ShowPromptParams {
    pub(super) fn apply(&self, tx: &Transaction, block: &Block) -> Result<(), ToolError> {
        let Some(prompt) = Prompt::get_latest(tx, &self.key)? else {
            return Err(ToolError::Solvable(format!(
                "Key {} does not exist.",
                self.key
            )));
        };
        let response = format!(
            "Summary: {}\nVariables: {}\nTemplate: {}",
            prompt.summary,
            variables_line(&prompt),
            prompt.template
        );
        block.respond(tx, &response)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct WritePromptParams {
    /// Key to store the prompt under. Writing an existing key appends a
    /// new version.
    pub key: String,
    /// One-line description of what the prompt does.
    pub summary: String,
    /// Template text. Placeholders use $name or ${name}; $$ is a
    /// literal dollar sign.
    pub template: String,
}

impl WritePromptParams {
    pub(super) fn apply(&self, tx: &Transaction, block: &Block) -> Result<(), ToolError> {
        if !crate::template::Template::new(self.template.clone()).is_valid() {
            return Err(ToolError::Solvable(
                "Template is not valid, prompt rejected.".to_string(),
            ));
        }
        Prompt::create(tx, block.id, &self.key, &self.summary, &self.template)?;
        block.respond(tx, "Prompt stored.")?;
        Ok(())
    }
}
