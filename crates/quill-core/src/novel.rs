//! Workers for the built-in novel workflows.

use quill_abstraction::{Capability, DocumentStore, TextGenerator};
use quill_orchestrator::CapabilityRegistry;
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::info;

use crate::capabilities::{PersistingCapability, PromptCapability};

/// A prompt-backed worker used by the built-in templates.
#[derive(Debug, Clone, Copy)]
pub struct NovelWorker {
    /// Capability name the templates refer to.
    pub name: &'static str,
    /// One line summary.
    pub description: &'static str,
    /// Capability tags.
    pub tags: &'static [&'static str],
    /// Prompt template with `{{key}}` placeholders.
    pub prompt: &'static str,
    /// Document returned when the generator fails. Writers have none.
    fallback: Option<fn() -> Value>,
}

impl NovelWorker {
    /// Fallback document, if the worker degrades gracefully.
    pub fn fallback(&self) -> Option<Value> {
        self.fallback.map(|build| build())
    }

    /// Builds the capability over `generator`.
    pub fn capability(&self, generator: Arc<dyn TextGenerator>) -> PromptCapability {
        let capability = PromptCapability::new(self.name, self.description, self.prompt, generator);
        match self.fallback() {
            Some(document) => capability.with_fallback(document),
            None => capability,
        }
    }
}

const NOVEL_WORKERS: [NovelWorker; 7] = [
    NovelWorker {
        name: "tag_selector",
        description: "Recommends genre, theme, style and audience tags",
        tags: &["tagging", "planning"],
        prompt: "Recommend tags for novel project {{project_id}}.\n\
                 Requirements: {{requirements}}\n\
                 Answer with JSON: {\"recommended_tags\": {\"genre\": [], \"theme\": [], \"style\": [], \"audience\": []}, \"reasoning\": \"\"}",
        fallback: Some(tag_selector_fallback),
    },
    NovelWorker {
        name: "character_creator",
        description: "Creates the protagonist from the selected tags",
        tags: &["characters", "planning"],
        prompt: "Create the main character for novel project {{project_id}}.\n\
                 Tags: {{tag_selection_result}}\n\
                 Answer with JSON: {\"basic_info\": {}, \"personality\": {}, \"background\": {}, \"skills\": []}",
        fallback: Some(character_creator_fallback),
    },
    NovelWorker {
        name: "storyline_generator",
        description: "Outlines the plot and chapter structure",
        tags: &["plot", "planning"],
        prompt: "Outline the storyline for novel project {{project_id}}.\n\
                 Tags: {{tag_selection_result}}\n\
                 Characters: {{character_creation_result}}\n\
                 Answer with JSON: {\"title\": \"\", \"summary\": \"\", \"chapters\": [{\"title\": \"\", \"summary\": \"\"}]}",
        fallback: Some(storyline_generator_fallback),
    },
    NovelWorker {
        name: "chapter_writer",
        description: "Writes chapter text from the storyline",
        tags: &["writing"],
        prompt: "Write the next chapter of novel project {{project_id}}.\n\
                 Storyline: {{storyline_generation_result}}\n\
                 Answer with JSON: {\"title\": \"\", \"content\": \"\"}",
        fallback: None,
    },
    NovelWorker {
        name: "quality_assessor",
        description: "Scores written text and suggests improvements",
        tags: &["review"],
        prompt: "Assess the quality of this text from novel project {{project_id}}.\n\
                 {{chapter_writing_result}}{{continuation_writing_result}}\n\
                 Answer with JSON: {\"overall_score\": 0, \"strengths\": [], \"suggestions\": []}",
        fallback: Some(quality_assessor_fallback),
    },
    NovelWorker {
        name: "continuation_analyzer",
        description: "Analyzes existing content before continuing it",
        tags: &["analysis"],
        prompt: "Analyze the existing content of novel project {{project_id}}.\n\
                 Content: {{existing_content}}\n\
                 Answer with JSON: {\"plot_points\": [], \"characters\": [], \"style\": \"\", \"open_threads\": []}",
        fallback: Some(continuation_analyzer_fallback),
    },
    NovelWorker {
        name: "continuation_writer",
        description: "Continues existing content in its own style",
        tags: &["writing"],
        prompt: "Continue novel project {{project_id}}.\n\
                 Analysis: {{continuation_analysis_result}}\n\
                 Content so far: {{existing_content}}\n\
                 Answer with JSON: {\"title\": \"\", \"content\": \"\"}",
        fallback: None,
    },
];

fn tag_selector_fallback() -> Value {
    json!({
        "recommended_tags": {
            "genre": ["urban", "fantasy"],
            "theme": ["growth", "adventure"],
            "style": ["light"],
            "audience": ["general"]
        },
        "reasoning": "default recommendation"
    })
}

fn character_creator_fallback() -> Value {
    json!({
        "basic_info": {"name": "Unnamed", "occupation": "unknown"},
        "personality": {"description": "curious and determined"},
        "background": {"motivation": "change their circumstances"},
        "skills": []
    })
}

fn storyline_generator_fallback() -> Value {
    json!({"title": "Untitled", "summary": "", "chapters": []})
}

fn quality_assessor_fallback() -> Value {
    json!({"overall_score": null, "strengths": [], "suggestions": []})
}

fn continuation_analyzer_fallback() -> Value {
    json!({"plot_points": [], "characters": [], "style": "", "open_threads": []})
}

/// The workers needed by the built-in templates.
pub fn novel_workers() -> &'static [NovelWorker] {
    &NOVEL_WORKERS
}

/// Registers every novel worker, persisting results to `store` when given.
///
/// # Returns
/// The number of capability names that were not registered before.
pub async fn register_novel_workers(
    registry: &CapabilityRegistry,
    generator: Arc<dyn TextGenerator>,
    store: Option<Arc<dyn DocumentStore>>,
) -> usize {
    let mut added = 0;
    for worker in novel_workers() {
        let prompt: Arc<dyn Capability> = Arc::new(worker.capability(Arc::clone(&generator)));
        let capability: Arc<dyn Capability> = match &store {
            Some(store) => Arc::new(PersistingCapability::new(prompt, Arc::clone(store))),
            None => prompt,
        };
        let tags = worker.tags.iter().map(|t| (*t).to_string()).collect();
        if registry.register(worker.name, capability, tags).await {
            added += 1;
        }
    }
    info!(workers = novel_workers().len(), added, generator = generator.generator_id(), "Novel workers registered");
    added
}
