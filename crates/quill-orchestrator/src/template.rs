//! Workflow templates and the template catalog.
//!
//! A template is an ordered list of steps, each bound to a capability and a
//! priority, plus a dependency map. Templates are validated before they enter
//! the catalog and are immutable afterwards: instances hold their own
//! `Arc` snapshot, so replacing a template only affects future instances.

use petgraph::algo::kosaraju_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Name of the built-in novel creation workflow.
pub const NOVEL_CREATION: &str = "novel_creation";
/// Name of the built-in novel continuation workflow.
pub const NOVEL_CONTINUATION: &str = "novel_continuation";

/// Task priority (higher variants are dispatched first).
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Background work.
    Low = 1,
    /// Default priority.
    #[default]
    Normal = 2,
    /// Work other steps are waiting on.
    High = 3,
    /// Dispatched before everything else.
    Critical = 4,
}

/// One step of a workflow template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepSpec {
    /// Step id, unique within the template.
    pub id: String,
    /// Name of the capability that performs the step.
    pub capability: String,
    /// Dispatch priority of the step's tasks.
    #[serde(default)]
    pub priority: Priority,
}

impl StepSpec {
    /// Creates a new step.
    #[must_use]
    pub fn new(id: impl Into<String>, capability: impl Into<String>, priority: Priority) -> Self {
        Self { id: id.into(), capability: capability.into(), priority }
    }
}

/// Errors found while validating a template.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemplateError {
    /// The template has no steps.
    #[error("template '{0}' has no steps")]
    Empty(String),

    /// Two steps share an id.
    #[error("template '{template}' declares step '{step}' more than once")]
    DuplicateStep {
        /// Template name.
        template: String,
        /// Duplicated step id.
        step: String,
    },

    /// A dependency entry names a step that does not exist.
    #[error("template '{template}': '{step}' depends on unknown step '{dependency}'")]
    UnknownDependency {
        /// Template name.
        template: String,
        /// Step declaring the dependency (or the unknown key itself).
        step: String,
        /// Missing step id.
        dependency: String,
    },

    /// The dependency map contains a cycle.
    #[error("template '{template}' has a circular dependency: {cycle}")]
    CycleDetected {
        /// Template name.
        template: String,
        /// Steps forming the cycle, in template order.
        cycle: String,
    },
}

/// A named, immutable workflow definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowTemplate {
    /// Catalog name.
    pub name: String,
    /// Human readable description.
    #[serde(default)]
    pub description: String,
    /// Steps in declaration order (the ready-step tie-break order).
    pub steps: Vec<StepSpec>,
    /// step id -> ids of steps that must complete first.
    #[serde(default)]
    pub dependencies: BTreeMap<String, Vec<String>>,
}

impl WorkflowTemplate {
    /// Creates a template without dependencies.
    #[must_use]
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            steps: Vec::new(),
            dependencies: BTreeMap::new(),
        }
    }

    /// Appends a step.
    #[must_use]
    pub fn with_step(mut self, step: StepSpec) -> Self {
        self.steps.push(step);
        self
    }

    /// Declares that `step` needs every step in `prerequisites` completed first.
    #[must_use]
    pub fn with_dependency(mut self, step: &str, prerequisites: &[&str]) -> Self {
        self.dependencies
            .entry(step.to_string())
            .or_default()
            .extend(prerequisites.iter().map(|p| (*p).to_string()));
        self
    }

    /// Looks up a step by id.
    pub fn step(&self, id: &str) -> Option<&StepSpec> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Returns the prerequisites of a step (empty if none are declared).
    pub fn prerequisites(&self, id: &str) -> &[String] {
        self.dependencies.get(id).map_or(&[], Vec::as_slice)
    }

    /// Number of steps.
    pub fn step_count(&self) -> usize {
        self.steps.len()
    }

    /// Validates the template structure.
    ///
    /// # Errors
    /// Returns an error if:
    /// - the template has no steps
    /// - a step id is declared twice
    /// - a dependency names an unknown step
    /// - the dependency map is cyclic (a self-dependency is a cycle of one)
    pub fn validate(&self) -> Result<(), TemplateError> {
        if self.steps.is_empty() {
            return Err(TemplateError::Empty(self.name.clone()));
        }

        let mut graph: DiGraph<&str, ()> = DiGraph::new();
        let mut nodes: HashMap<&str, NodeIndex> = HashMap::new();
        for step in &self.steps {
            if nodes.contains_key(step.id.as_str()) {
                return Err(TemplateError::DuplicateStep {
                    template: self.name.clone(),
                    step: step.id.clone(),
                });
            }
            nodes.insert(step.id.as_str(), graph.add_node(step.id.as_str()));
        }

        for (step, prerequisites) in &self.dependencies {
            let Some(&to) = nodes.get(step.as_str()) else {
                return Err(TemplateError::UnknownDependency {
                    template: self.name.clone(),
                    step: step.clone(),
                    dependency: step.clone(),
                });
            };
            for prerequisite in prerequisites {
                let Some(&from) = nodes.get(prerequisite.as_str()) else {
                    return Err(TemplateError::UnknownDependency {
                        template: self.name.clone(),
                        step: step.clone(),
                        dependency: prerequisite.clone(),
                    });
                };
                // Edge from prerequisite to dependent: prerequisites complete first.
                graph.add_edge(from, to, ());
            }
        }

        for component in kosaraju_scc(&graph) {
            let is_cycle = component.len() > 1
                || component.iter().any(|&n| graph.find_edge(n, n).is_some());
            if is_cycle {
                let members: HashSet<&str> = component.iter().map(|&n| graph[n]).collect();
                let cycle = self
                    .steps
                    .iter()
                    .filter(|s| members.contains(s.id.as_str()))
                    .map(|s| s.id.as_str())
                    .collect::<Vec<_>>()
                    .join(" -> ");
                return Err(TemplateError::CycleDetected { template: self.name.clone(), cycle });
            }
        }

        Ok(())
    }

    /// The built-in five step novel creation workflow.
    #[must_use]
    pub fn novel_creation() -> Self {
        Self::new(NOVEL_CREATION, "Complete novel creation workflow")
            .with_step(StepSpec::new("tag_selection", "tag_selector", Priority::High))
            .with_step(StepSpec::new("character_creation", "character_creator", Priority::High))
            .with_step(StepSpec::new(
                "storyline_generation",
                "storyline_generator",
                Priority::High,
            ))
            .with_step(StepSpec::new("chapter_writing", "chapter_writer", Priority::Normal))
            .with_step(StepSpec::new("quality_assessment", "quality_assessor", Priority::Normal))
            .with_dependency("character_creation", &["tag_selection"])
            .with_dependency("storyline_generation", &["tag_selection", "character_creation"])
            .with_dependency("chapter_writing", &["storyline_generation"])
            .with_dependency("quality_assessment", &["chapter_writing"])
    }

    /// The built-in three step continuation workflow.
    #[must_use]
    pub fn novel_continuation() -> Self {
        Self::new(NOVEL_CONTINUATION, "Continue an existing novel from its current content")
            .with_step(StepSpec::new(
                "continuation_analysis",
                "continuation_analyzer",
                Priority::High,
            ))
            .with_step(StepSpec::new(
                "continuation_writing",
                "continuation_writer",
                Priority::High,
            ))
            .with_step(StepSpec::new("quality_check", "quality_assessor", Priority::Normal))
            .with_dependency("continuation_writing", &["continuation_analysis"])
            .with_dependency("quality_check", &["continuation_writing"])
    }
}

/// Catalog of named workflow templates.
pub struct TemplateCatalog {
    templates: RwLock<HashMap<String, Arc<WorkflowTemplate>>>,
}

impl fmt::Debug for TemplateCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TemplateCatalog")
            .field("template_count", &self.templates.try_read().map(|t| t.len()).unwrap_or(0))
            .finish_non_exhaustive()
    }
}

impl TemplateCatalog {
    /// Creates an empty catalog.
    #[must_use]
    pub fn new() -> Self {
        Self { templates: RwLock::new(HashMap::new()) }
    }

    /// Creates a catalog holding the built-in `novel_creation` and
    /// `novel_continuation` templates.
    #[must_use]
    pub fn with_builtin() -> Self {
        let templates = [WorkflowTemplate::novel_creation(), WorkflowTemplate::novel_continuation()]
            .into_iter()
            .map(|t| (t.name.clone(), Arc::new(t)))
            .collect();
        Self { templates: RwLock::new(templates) }
    }

    /// Validates and registers a template.
    ///
    /// # Returns
    /// Returns `true` if the name was new, `false` if it replaced a template.
    pub async fn register(&self, template: WorkflowTemplate) -> Result<bool, TemplateError> {
        template.validate()?;
        debug!(template = %template.name, steps = template.step_count(), "Registering template");

        let name = template.name.clone();
        let mut templates = self.templates.write().await;
        let replaced = templates.insert(name.clone(), Arc::new(template)).is_some();
        if replaced {
            warn!(template = %name, "Template replaced in catalog");
        }
        Ok(!replaced)
    }

    /// Retrieves a template by name.
    pub async fn get(&self, name: &str) -> Option<Arc<WorkflowTemplate>> {
        self.templates.read().await.get(name).cloned()
    }

    /// Lists all templates, sorted by name.
    pub async fn list(&self) -> Vec<Arc<WorkflowTemplate>> {
        let templates = self.templates.read().await;
        let mut all: Vec<_> = templates.values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    /// Returns the number of templates.
    pub async fn count(&self) -> usize {
        self.templates.read().await.len()
    }
}

impl Default for TemplateCatalog {
    fn default() -> Self {
        Self::with_builtin()
    }
}
