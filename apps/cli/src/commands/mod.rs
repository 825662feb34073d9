//! Command implementations for the poster CLI.

pub mod check;
pub mod split;
pub mod stats;
pub mod train;

use anyhow::{Context, Result};
use poster_training::Config;
use std::path::Path;

pub(crate) fn load_config(path: &Path) -> Result<Config> {
    Config::from_file(path).with_context(|| format!("Failed to load config {}", path.display()))
}
