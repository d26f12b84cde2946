//! Sub-agents and out-of-band feedback.

use std::collections::BTreeMap;

use rusqlite::Transaction;
use schemars::JsonSchema;
use serde::Deserialize;
use tracing::info;

use super::ToolError;
use crate::models::{Block, Prompt};

#[derive(Debug, Clone, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct SpawnAgentParams {
    /// Key of the stored prompt to run.
    pub prompt_key: String,
    /// Template variable names, matching the prompt's placeholders.
    pub template_names: Vec<String>,
    /// Values for the variables, in the same order as template_names.
    pub template_values: Vec<String>,
}

impl SpawnAgentParams {
    /// Start a child conversation seeded with the substituted prompt.
    ///
    /// Deliberately leaves this block unresponded: the response arrives
    /// when the child conversation finishes.
    pub(super) fn apply(&self, tx: &Transaction, block: &Block) -> Result<(), ToolError> {
        if self.template_names.len() != self.template_values.len() {
            return Err(ToolError::Solvable(
                "template_names and template_values must have the same length.".to_string(),
            ));
        }
        if self.template_names.iter().any(|name| name.contains('$')) {
            return Err(ToolError::Solvable(
                "Template names must not contain $.".to_string(),
            ));
        }
        let Some(prompt) = Prompt::get_latest(tx, &self.prompt_key)? else {
            return Err(ToolError::Solvable(format!(
                "Key {} does not exist.",
                self.prompt_key
            )));
        };

        let expected = prompt.template().identifiers();
        let mut actual = self.template_names.clone();
        actual.sort();
        actual.dedup();
        if expected != actual {
            return Err(ToolError::Solvable(format!(
                "Failed to substitute vars!\nExpected keys: {}\nActual keys: {}",
                expected.join(", "),
                actual.join(", ")
            )));
        }

        let vars: BTreeMap<String, String> = self
            .template_names
            .iter()
            .cloned()
            .zip(self.template_values.iter().cloned())
            .collect();
        let text = prompt
            .template()
            .substitute(&vars)
            .map_err(|e| ToolError::Solvable(e.to_string()))?;

        let child = block.start_conversation(tx)?;
        child.add_user_text(tx, &text)?;
        info!(parent_block = block.id, child = child.id, prompt = %self.prompt_key, "spawned sub-agent");
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct RequestExpertFeedbackParams {
    /// The question or situation to put to the expert.
    pub request: String,
}

impl RequestExpertFeedbackParams {
    /// Nothing to do here. The block stays unresponded until an expert
    /// answers it out of band, which parks the conversation.
    pub(super) fn apply(&self, _tx: &Transaction, block: &Block) -> Result<(), ToolError> {
        info!(block = block.id, request = %self.request, "expert feedback requested");
        Ok(())
    }
}
