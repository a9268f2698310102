//! Prompt-backed capabilities.
//!
//! A [`PromptCapability`] renders a prompt from the task parameters, asks a
//! [`TextGenerator`] for text, and turns the answer into a JSON result.
//! [`PersistingCapability`] wraps any capability and stores its results.

use async_trait::async_trait;
use quill_abstraction::{Capability, CapabilityError, DocumentStore, Parameters, TextGenerator, string_param};
use serde_json::{Map, Value, json};
use std::sync::Arc;
use tracing::{debug, warn};

/// Parameter naming the project results are stored under.
const PROJECT_ID_PARAM: &str = "project_id";

/// Substitutes `{{key}}` placeholders with parameter values.
///
/// Strings are inserted verbatim, other values as compact JSON, and missing
/// keys as nothing. An unterminated `{{` is kept as is.
pub fn render_prompt(template: &str, parameters: &Parameters) -> String {
    let mut rendered = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        let Some(len) = rest[start + 2..].find("}}") else {
            break;
        };
        rendered.push_str(&rest[..start]);

        let key = rest[start + 2..start + 2 + len].trim();
        match parameters.get(key) {
            Some(Value::String(s)) => rendered.push_str(s),
            Some(Value::Null) | None => {}
            Some(other) => rendered.push_str(&other.to_string()),
        }
        rest = &rest[start + 2 + len + 2..];
    }

    rendered.push_str(rest);
    rendered
}

/// Interprets generator output as JSON, falling back to `{"content": text}`.
///
/// A JSON document wrapped in a Markdown code fence is unwrapped first.
pub fn parse_output(text: &str) -> Value {
    let trimmed = text.trim();
    let candidate = strip_code_fence(trimmed).unwrap_or(trimmed);

    match serde_json::from_str::<Value>(candidate) {
        Ok(value @ (Value::Object(_) | Value::Array(_))) => value,
        _ => json!({ "content": text }),
    }
}

fn strip_code_fence(text: &str) -> Option<&str> {
    let body = text.strip_prefix("```")?.strip_suffix("```")?;
    let body = body.strip_prefix("json").unwrap_or(body);
    Some(body.trim())
}

/// Capability that answers a step by prompting a text generator.
pub struct PromptCapability {
    name: String,
    description: String,
    prompt: String,
    generator: Arc<dyn TextGenerator>,
    fallback: Option<Value>,
}

impl PromptCapability {
    /// Creates a prompt capability without a fallback.
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        prompt: impl Into<String>,
        generator: Arc<dyn TextGenerator>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            prompt: prompt.into(),
            generator,
            fallback: None,
        }
    }

    /// Returns `document` (marked with `"fallback": true`) when the generator fails.
    #[must_use]
    pub fn with_fallback(mut self, document: Value) -> Self {
        self.fallback = Some(document);
        self
    }

    /// The prompt template.
    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    fn fallback_document(fallback: &Value) -> Value {
        let mut document = match fallback {
            Value::Object(fields) => fields.clone(),
            other => {
                let mut fields = Map::new();
                fields.insert("content".to_string(), other.clone());
                fields
            }
        };
        document.insert("fallback".to_string(), Value::Bool(true));
        Value::Object(document)
    }
}

#[async_trait]
impl Capability for PromptCapability {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    async fn execute(&self, step_id: &str, parameters: &Parameters) -> Result<Value, CapabilityError> {
        let prompt = render_prompt(&self.prompt, parameters);
        debug!(capability = %self.name, step_id = %step_id, prompt_len = prompt.len(), "Prompting generator");

        match self.generator.generate(&prompt).await {
            Ok(text) => Ok(parse_output(&text)),
            Err(e) => {
                if let Some(fallback) = &self.fallback {
                    warn!(capability = %self.name, step_id = %step_id, error = %e, "Generator failed, using fallback");
                    return Ok(Self::fallback_document(fallback));
                }
                Err(match e {
                    generation @ CapabilityError::Generation { .. } => generation,
                    other => CapabilityError::Generation {
                        generator: self.generator.generator_id().to_string(),
                        message: other.to_string(),
                    },
                })
            }
        }
    }
}

/// Decorator that stores every successful result under `(project_id, step_id)`.
pub struct PersistingCapability {
    inner: Arc<dyn Capability>,
    store: Arc<dyn DocumentStore>,
}

impl PersistingCapability {
    /// Wraps `inner`, persisting its results to `store`.
    pub fn new(inner: Arc<dyn Capability>, store: Arc<dyn DocumentStore>) -> Self {
        Self { inner, store }
    }
}

#[async_trait]
impl Capability for PersistingCapability {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn description(&self) -> &str {
        self.inner.description()
    }

    async fn execute(&self, step_id: &str, parameters: &Parameters) -> Result<Value, CapabilityError> {
        let result = self.inner.execute(step_id, parameters).await?;

        let project_id = string_param(parameters, PROJECT_ID_PARAM)
            .ok_or_else(|| CapabilityError::InvalidInput(format!("missing '{PROJECT_ID_PARAM}' parameter")))?;
        self.store.put(project_id, step_id, &result).await?;
        debug!(project_id = %project_id, step_id = %step_id, "Step result persisted");

        Ok(result)
    }
}

/// Offline generator that answers every prompt with `{"generator", "prompt"}`.
#[derive(Debug, Clone)]
pub struct EchoGenerator {
    id: String,
}

impl EchoGenerator {
    /// Creates an echo generator with the given id.
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

impl Default for EchoGenerator {
    fn default() -> Self {
        Self::new("echo")
    }
}

#[async_trait]
impl TextGenerator for EchoGenerator {
    async fn generate(&self, prompt: &str) -> Result<String, CapabilityError> {
        Ok(json!({ "generator": self.id, "prompt": prompt }).to_string())
    }

    fn generator_id(&self) -> &str {
        &self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryDocumentStore;

    struct Scripted(Result<String, CapabilityError>);

    #[async_trait]
    impl TextGenerator for Scripted {
        async fn generate(&self, _prompt: &str) -> Result<String, CapabilityError> {
            self.0.clone()
        }

        fn generator_id(&self) -> &str {
            "scripted"
        }
    }

    fn params(value: Value) -> Parameters {
        match value {
            Value::Object(map) => map,
            _ => Parameters::new(),
        }
    }

    #[test]
    fn test_render_prompt() {
        let parameters = params(json!({
            "genre": "mystery",
            "tags": {"mood": "dark"},
            "count": 3,
            "nothing": null,
        }));
        assert_eq!(
            render_prompt("A {{genre}} novel, {{ count }} chapters, {{tags}}{{missing}}{{nothing}}.", &parameters),
            r#"A mystery novel, 3 chapters, {"mood":"dark"}."#
        );
        assert_eq!(render_prompt("open {{genre", &parameters), "open {{genre");
        assert_eq!(render_prompt("no placeholders", &parameters), "no placeholders");
    }

    #[test]
    fn test_parse_output() {
        assert_eq!(parse_output(r#"{"title": "Dusk"}"#), json!({"title": "Dusk"}));
        assert_eq!(parse_output("```json\n{\"title\": \"Dusk\"}\n```"), json!({"title": "Dusk"}));
        assert_eq!(parse_output("[1, 2]"), json!([1, 2]));
        assert_eq!(parse_output("Once upon a time"), json!({"content": "Once upon a time"}));
        assert_eq!(parse_output("42"), json!({"content": "42"}));
    }

    #[tokio::test]
    async fn test_prompt_capability_parses_generator_output() {
        let capability = PromptCapability::new(
            "tag_selector",
            "Selects tags",
            "Pick tags for {{project_id}}",
            Arc::new(EchoGenerator::default()),
        );
        let result = capability.execute("tags", &params(json!({"project_id": "p1"}))).await.unwrap();
        assert_eq!(result, json!({"generator": "echo", "prompt": "Pick tags for p1"}));
        assert_eq!(capability.description(), "Selects tags");
    }

    #[tokio::test]
    async fn test_prompt_capability_fallback() {
        let failing = Arc::new(Scripted(Err(CapabilityError::Generation {
            generator: "scripted".to_string(),
            message: "quota exceeded".to_string(),
        })));

        let strict = PromptCapability::new("w", "", "p", failing.clone());
        let err = strict.execute("s", &Parameters::new()).await.unwrap_err();
        assert!(matches!(err, CapabilityError::Generation { ref message, .. } if message == "quota exceeded"));

        let lenient = PromptCapability::new("w", "", "p", failing).with_fallback(json!({"tags": ["mystery"]}));
        let result = lenient.execute("s", &Parameters::new()).await.unwrap();
        assert_eq!(result, json!({"tags": ["mystery"], "fallback": true}));
    }

    #[tokio::test]
    async fn test_prompt_capability_wraps_other_errors() {
        let broken = Arc::new(Scripted(Err(CapabilityError::Other("socket closed".to_string()))));
        let capability = PromptCapability::new("w", "", "p", broken);
        let err = capability.execute("s", &Parameters::new()).await.unwrap_err();
        assert!(matches!(err, CapabilityError::Generation { ref generator, .. } if generator == "scripted"));
    }

    #[tokio::test]
    async fn test_persisting_capability() {
        let store = Arc::new(MemoryDocumentStore::new());
        let inner = Arc::new(PromptCapability::new(
            "chapter_writer",
            "",
            "{{project_id}}",
            Arc::new(Scripted(Ok("Chapter one".to_string()))),
        ));
        let capability = PersistingCapability::new(inner, store.clone());
        assert_eq!(capability.name(), "chapter_writer");

        let result = capability.execute("chapter_writing", &params(json!({"project_id": "p1"}))).await.unwrap();
        assert_eq!(result, json!({"content": "Chapter one"}));
        assert_eq!(store.get("p1", "chapter_writing").await.unwrap(), Some(result));

        let err = capability.execute("chapter_writing", &Parameters::new()).await.unwrap_err();
        assert!(matches!(err, CapabilityError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_persisting_capability_skips_failures() {
        let store = Arc::new(MemoryDocumentStore::new());
        let inner = Arc::new(PromptCapability::new(
            "w",
            "",
            "p",
            Arc::new(Scripted(Err(CapabilityError::Other("down".to_string())))),
        ));
        let capability = PersistingCapability::new(inner, store.clone());
        assert!(capability.execute("s", &params(json!({"project_id": "p1"}))).await.is_err());
        assert!(store.list_projects().await.unwrap().is_empty());
    }
}
