//! Prompt supply for request generation.
//!
//! Prompts are loaded once per session from a JSONL file and handed out
//! round-robin to concurrent request tasks. Each record is a JSON object
//! with at least a `question` field; records without one are skipped.

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info};

/// Errors that can occur when loading prompts.
#[derive(Error, Debug)]
pub enum PromptError {
    #[error("Failed to read prompt file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid prompt record at line {line}: {source}")]
    InvalidRecord {
        line: usize,
        source: serde_json::Error,
    },

    #[error("Prompt file contains no usable records")]
    Empty,
}

/// An ordered, non-empty set of prompts with a wrapping cursor.
///
/// The cursor advance is a single atomic increment, so concurrent request
/// tasks each receive exactly one prompt and no element is skipped.
#[derive(Debug)]
pub struct PromptSet {
    prompts: Vec<String>,
    cursor: AtomicUsize,
}

impl PromptSet {
    /// Load prompts from a JSONL file.
    ///
    /// Each line is parsed as a JSON object; the `question` field becomes
    /// the prompt text. Lines without a `question` field are skipped.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read, a line is not valid
    /// JSON, or no usable records remain.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, PromptError> {
        let path_ref = path.as_ref();
        info!(path = ?path_ref, "Loading prompt file");

        let content = fs::read_to_string(path_ref)?;
        let set = Self::from_jsonl(&content)?;

        info!(path = ?path_ref, prompts = set.count(), "Prompts loaded");
        Ok(set)
    }

    /// Parse prompts from JSONL content (useful for testing).
    pub fn from_jsonl(content: &str) -> Result<Self, PromptError> {
        let mut prompts = Vec::new();

        for (idx, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let record: Value = serde_json::from_str(line)
                .map_err(|source| PromptError::InvalidRecord { line: idx + 1, source })?;

            match record.get("question").and_then(Value::as_str) {
                Some(question) => prompts.push(question.to_string()),
                None => debug!(line = idx + 1, "Skipping record without 'question' field"),
            }
        }

        if prompts.is_empty() {
            return Err(PromptError::Empty);
        }

        Ok(Self {
            prompts,
            cursor: AtomicUsize::new(0),
        })
    }

    /// Returns the next prompt, advancing the cursor by exactly one and
    /// wrapping at the end of the set.
    pub fn next(&self) -> String {
        let index = self.cursor.fetch_add(1, Ordering::Relaxed);
        self.prompts[index % self.prompts.len()].clone()
    }

    /// Total number of prompts in the set.
    pub fn count(&self) -> usize {
        self.prompts.len()
    }

    /// Reset the cursor to the first prompt.
    pub fn reset(&self) {
        self.cursor.store(0, Ordering::Relaxed);
    }
}
