//! Worker abstraction layer for Quill.
//!
//! This crate defines the narrow boundary between the workflow engine and the
//! things it drives: capabilities (workers), text generators, and the document
//! store that downstream code persists step results through.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Free-form key-value bag handed to a capability for one step execution.
pub type Parameters = serde_json::Map<String, Value>;

/// Represents an error raised by a capability, generator, or document store.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CapabilityError {
    /// The parameters handed to the capability were unusable.
    #[error("Invalid Input: {0}")]
    InvalidInput(String),

    /// The capability ran but could not produce a result.
    #[error("Execution Error: {0}")]
    Execution(String),

    /// The underlying text generator failed.
    #[error("Generation Error ({generator}): {message}")]
    Generation {
        /// The generator that failed.
        generator: String,
        /// Error message reported by the generator.
        message: String,
    },

    /// A result could not be serialized or deserialized.
    #[error("Serialization Error: {0}")]
    Serialization(String),

    /// Reading or writing a stored document failed.
    #[error("Storage Error: {0}")]
    Storage(String),

    /// Other unexpected errors.
    #[error("Other Capability Error: {0}")]
    Other(String),
}

impl From<serde_json::Error> for CapabilityError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// A worker behavior the orchestrator can invoke for a workflow step.
///
/// The orchestrator knows nothing about the shape of the returned value beyond
/// it being serializable; downstream steps receive it as `"<step_id>_result"`.
#[async_trait]
pub trait Capability: Send + Sync {
    /// Returns the name the capability registers under.
    fn name(&self) -> &str;

    /// Returns a short description of what the capability does.
    fn description(&self) -> &str {
        ""
    }

    /// Executes one workflow step.
    ///
    /// # Arguments
    /// * `step_id` - The template step being executed
    /// * `parameters` - Run parameters plus the results of completed steps
    ///
    /// # Errors
    /// Returns a `CapabilityError` if the step could not be performed.
    async fn execute(&self, step_id: &str, parameters: &Parameters)
    -> Result<Value, CapabilityError>;
}

/// An opaque `invoke(prompt) -> text` language-model capability.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    /// Generates text for the given prompt.
    ///
    /// # Errors
    /// Returns `CapabilityError::Generation` if the generator could not answer.
    async fn generate(&self, prompt: &str) -> Result<String, CapabilityError>;

    /// Returns the ID of the generator (model name or backend identifier).
    fn generator_id(&self) -> &str;
}

/// Get/put document storage keyed by project and document kind.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Stores `document` as the current version of `kind` for `project_id`.
    async fn put(&self, project_id: &str, kind: &str, document: &Value)
    -> Result<(), CapabilityError>;

    /// Loads the current version of `kind` for `project_id`, if any.
    async fn get(&self, project_id: &str, kind: &str) -> Result<Option<Value>, CapabilityError>;

    /// Lists the document kinds stored for a project, sorted.
    async fn list_kinds(&self, project_id: &str) -> Result<Vec<String>, CapabilityError>;

    /// Lists all known projects, sorted.
    async fn list_projects(&self) -> Result<Vec<String>, CapabilityError>;
}

/// Reads a string parameter, treating absent and non-string values as missing.
pub fn string_param<'a>(parameters: &'a Parameters, key: &str) -> Option<&'a str> {
    parameters.get(key).and_then(Value::as_str)
}
