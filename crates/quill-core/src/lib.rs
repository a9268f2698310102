//! Application layer for Quill.
//!
//! Wires the orchestration engine into something runnable: layered
//! configuration, logging setup, a JSON document store, and prompt-backed
//! capabilities for the built-in novel workflows.

pub mod capabilities;
pub mod config;
pub mod logging;
pub mod novel;
pub mod store;

pub use capabilities::{EchoGenerator, PersistingCapability, PromptCapability, parse_output, render_prompt};
pub use config::{ConfigError, QuillConfig};
pub use logging::init_logging;
pub use novel::{NovelWorker, novel_workers, register_novel_workers};
pub use store::{JsonFileStore, MemoryDocumentStore, StoreError};
