//! Command implementations for the Quill CLI.

pub mod config;
pub mod run;
pub mod show;
pub mod templates;
