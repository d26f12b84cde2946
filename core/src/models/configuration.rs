//! Key-value configuration with typed accessors and defaults.
//!
//! Settings live in the `configuration` table. Every accessor falls back
//! to a default when the key is absent or unparseable, so a fresh
//! database works without any setup. The three built-in prompts fall
//! back to embedded copies.

use std::str::FromStr;

use rusqlite::{OptionalExtension, Transaction};
use tracing::warn;

use crate::config_types::{OpenAiModel, OpenAiReasoningEffort, OpenAiServiceTier, OpenAiVerbosity};
use crate::db::{DbError, Result};

const DEFAULT_TIMEOUT_MINUTES: i64 = 60;
const TIMEOUT_MINUTES_RANGE: (i64, i64) = (5, 1440);

const DEFAULT_COMPRESSION_THRESHOLD: i64 = 320_000;
const COMPRESSION_THRESHOLD_RANGE: (i64, i64) = (1_000, 1_000_000);

const DEFAULT_SYSTEM_PROMPT: &str = include_str!("../prompts/system_prompt.txt");
const DEFAULT_CHAPTER_PROMPT: &str = include_str!("../prompts/chapter_prompt.txt");
const DEFAULT_COMPRESS_PROMPT: &str = include_str!("../prompts/compress_prompt.txt");

pub struct Configuration;

impl Configuration {
    pub fn get(tx: &Transaction, key: &str) -> Result<Option<String>> {
        tx.query_row(
            "SELECT value FROM configuration WHERE key = ?1",
            [key],
            |row| row.get(0),
        )
        .optional()
        .map_err(DbError::from)
    }

    pub fn set(tx: &Transaction, key: &str, value: &str) -> Result<()> {
        tx.execute(
            "INSERT OR REPLACE INTO configuration (key, value) VALUES (?1, ?2)",
            [key, value],
        )?;
        Ok(())
    }

    pub fn openai_model(tx: &Transaction) -> Result<OpenAiModel> {
        Ok(Self::parsed(tx, "openai_model")?.unwrap_or(OpenAiModel::Gpt5))
    }

    pub fn openai_verbosity(tx: &Transaction) -> Result<OpenAiVerbosity> {
        Ok(Self::parsed(tx, "openai_verbosity")?.unwrap_or(OpenAiVerbosity::Medium))
    }

    pub fn openai_reasoning_effort(tx: &Transaction) -> Result<OpenAiReasoningEffort> {
        Ok(Self::parsed(tx, "openai_reasoning_effort")?.unwrap_or(OpenAiReasoningEffort::Medium))
    }

    pub fn openai_service_tier(tx: &Transaction) -> Result<OpenAiServiceTier> {
        Ok(Self::parsed(tx, "openai_service_tier")?.unwrap_or(OpenAiServiceTier::Default))
    }

    /// How long a background response may stay queued or in progress
    /// before it is cancelled and resubmitted.
    pub fn openai_timeout_minutes(tx: &Transaction) -> Result<i64> {
        Self::bounded(tx, "openai_timeout_minutes", DEFAULT_TIMEOUT_MINUTES, TIMEOUT_MINUTES_RANGE)
    }

    /// Token count at which a conversation gets compressed instead of
    /// continued.
    pub fn openai_compression_threshold(tx: &Transaction) -> Result<i64> {
        Self::bounded(
            tx,
            "openai_compression_threshold",
            DEFAULT_COMPRESSION_THRESHOLD,
            COMPRESSION_THRESHOLD_RANGE,
        )
    }

    pub fn system_prompt(tx: &Transaction) -> Result<String> {
        Ok(Self::get(tx, "system_prompt")?.unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()))
    }

    pub fn chapter_prompt(tx: &Transaction) -> Result<String> {
        Ok(Self::get(tx, "chapter_prompt")?.unwrap_or_else(|| DEFAULT_CHAPTER_PROMPT.to_string()))
    }

    pub fn compress_prompt(tx: &Transaction) -> Result<String> {
        Ok(Self::get(tx, "compress_prompt")?.unwrap_or_else(|| DEFAULT_COMPRESS_PROMPT.to_string()))
    }

    fn parsed<T: FromStr>(tx: &Transaction, key: &str) -> Result<Option<T>> {
        let Some(raw) = Self::get(tx, key)? else {
            return Ok(None);
        };
        match raw.parse() {
            Ok(value) => Ok(Some(value)),
            Err(_) => {
                warn!(key, value = raw, "unrecognized configuration value, using default");
                Ok(None)
            }
        }
    }

    fn bounded(tx: &Transaction, key: &str, default: i64, (lo, hi): (i64, i64)) -> Result<i64> {
        let Some(raw) = Self::get(tx, key)? else {
            return Ok(default);
        };
        match raw.parse::<i64>() {
            Ok(value) if (lo..=hi).contains(&value) => Ok(value),
            _ => {
                warn!(key, value = raw, "configuration value out of range, using default");
                Ok(default)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::db::Store;

    #[test]
    fn defaults_apply_when_unset() {
        let store = Store::open_in_memory().unwrap();
        store
            .with_tx(|tx| {
                assert_eq!(Configuration::openai_model(tx)?, OpenAiModel::Gpt5);
                assert_eq!(Configuration::openai_verbosity(tx)?, OpenAiVerbosity::Medium);
                assert_eq!(
                    Configuration::openai_reasoning_effort(tx)?,
                    OpenAiReasoningEffort::Medium
                );
                assert_eq!(
                    Configuration::openai_service_tier(tx)?,
                    OpenAiServiceTier::Default
                );
                assert_eq!(Configuration::openai_timeout_minutes(tx)?, 60);
                assert_eq!(Configuration::openai_compression_threshold(tx)?, 320_000);
                assert!(!Configuration::system_prompt(tx)?.is_empty());
                assert!(!Configuration::chapter_prompt(tx)?.is_empty());
                assert!(!Configuration::compress_prompt(tx)?.is_empty());
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn set_overrides_and_replaces() {
        let store = Store::open_in_memory().unwrap();
        store
            .with_tx(|tx| {
                Configuration::set(tx, "openai_model", "gpt-5-mini")?;
                Configuration::set(tx, "openai_model", "gpt-5-nano")?;
                assert_eq!(Configuration::openai_model(tx)?, OpenAiModel::Gpt5Nano);

                Configuration::set(tx, "system_prompt", "custom instructions")?;
                assert_eq!(Configuration::system_prompt(tx)?, "custom instructions");
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn out_of_range_numbers_fall_back() {
        let store = Store::open_in_memory().unwrap();
        store
            .with_tx(|tx| {
                Configuration::set(tx, "openai_timeout_minutes", "3")?;
                assert_eq!(Configuration::openai_timeout_minutes(tx)?, 60);

                Configuration::set(tx, "openai_timeout_minutes", "120")?;
                assert_eq!(Configuration::openai_timeout_minutes(tx)?, 120);

                Configuration::set(tx, "openai_compression_threshold", "2000000")?;
                assert_eq!(Configuration::openai_compression_threshold(tx)?, 320_000);

                Configuration::set(tx, "openai_compression_threshold", "not a number")?;
                assert_eq!(Configuration::openai_compression_threshold(tx)?, 320_000);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn unparseable_enum_falls_back() {
        let store = Store::open_in_memory().unwrap();
        store
            .with_tx(|tx| {
                Configuration::set(tx, "openai_verbosity", "shouty")?;
                assert_eq!(Configuration::openai_verbosity(tx)?, OpenAiVerbosity::Medium);
                Ok(())
            })
            .unwrap();
    }
}
