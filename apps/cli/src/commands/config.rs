//! Config command implementation.

use quill_core::QuillConfig;

/// Print the effective configuration.
pub fn execute(config: &QuillConfig) -> anyhow::Result<()> {
    print!("{}", config.to_toml()?);
    Ok(())
}
