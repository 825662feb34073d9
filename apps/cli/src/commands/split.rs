use super::load_config;
use anyhow::{Context, Result};
use colored::Colorize;
use poster_training::{split_and_save_datasets, DataLayout, SplitOutcome};
use std::path::Path;

pub fn execute(path: &Path) -> Result<()> {
    let config = load_config(path)?;
    let layout = DataLayout::new(config.data_config.data_path.clone());
    let outcome = split_and_save_datasets(&layout, config.data_config.train_size, config.seed)
        .with_context(|| format!("Failed to split dataset in {}", layout.root().display()))?;

    match outcome {
        SplitOutcome::Reused => {
            println!("{} {}", "Split already present:".yellow(), layout.root().display());
        }
        SplitOutcome::Created { original, deduplicated, train, valid, test } => {
            println!("{}", "Split written".bold().green());
            println!("  rows   {original} ({deduplicated} after dedup)");
            println!("  train  {train}");
            println!("  valid  {valid}");
            println!("  test   {test}");
        }
    }
    Ok(())
}
