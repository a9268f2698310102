//! Show command implementation.

use anyhow::Context;
use colored::Colorize;
use quill_abstraction::DocumentStore;
use quill_core::{JsonFileStore, QuillConfig};

/// Print one stored document, or the kinds stored for a project.
pub async fn execute(config: &QuillConfig, project: &str, kind: Option<&str>) -> anyhow::Result<()> {
    let store = JsonFileStore::new(&config.storage.data_dir);

    let Some(kind) = kind else {
        let kinds = store
            .list_kinds(project)
            .await
            .with_context(|| format!("Failed to list documents of project '{project}'"))?;
        if kinds.is_empty() {
            println!("{}", format!("No documents stored for project '{project}'").yellow());
        }
        for kind in kinds {
            println!("{kind}");
        }
        return Ok(());
    };

    let document = store
        .get(project, kind)
        .await
        .with_context(|| format!("Failed to read '{kind}' of project '{project}'"))?
        .with_context(|| format!("No '{kind}' document stored for project '{project}'"))?;
    println!("{}", serde_json::to_string_pretty(&document)?);
    Ok(())
}
