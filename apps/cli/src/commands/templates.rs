//! Templates command implementation.

use anyhow::Context;
use colored::Colorize;
use quill_core::QuillConfig;
use serde_json::json;

/// List the catalog: built-in templates plus the configured ones.
pub async fn execute(config: &QuillConfig, json_output: bool) -> anyhow::Result<()> {
    let orchestrator = config.orchestrator().await.context("Failed to load templates")?;
    let templates = orchestrator.catalog().list().await;

    if json_output {
        let list: Vec<_> = templates
            .iter()
            .map(|template| {
                json!({
                    "name": template.name,
                    "description": template.description,
                    "steps": template.steps,
                    "dependencies": template.dependencies,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&list)?);
        return Ok(());
    }

    println!("{}", format!("Found {} templates", templates.len()).bold().green());
    for template in &templates {
        println!();
        println!("{}  {}", template.name.bold(), template.description.dimmed());
        for step in &template.steps {
            let prerequisites = template.prerequisites(&step.id);
            let after = if prerequisites.is_empty() {
                String::new()
            } else {
                format!("  after {}", prerequisites.join(", "))
            };
            println!("  - {} [{} {:?}]{}", step.id, step.capability, step.priority, after);
        }
    }

    Ok(())
}
