use super::load_config;
use anyhow::{Context, Result};
use colored::Colorize;
use poster_training::{Config, Registries};
use std::path::Path;

pub fn execute(path: &Path) -> Result<()> {
    let config = load_config(path)?;
    let registries = Registries::builtin();
    registries.validate(&config).context("Config references an unusable object")?;

    println!("{} {}", "✓".green(), path.display().to_string().bold());
    print_resolved(&registries, &config)?;
    Ok(())
}

fn print_resolved(registries: &Registries, config: &Config) -> Result<()> {
    println!("  model      {}", registries.models.canonical(config.model_name()?)?.cyan());
    println!("  optimizer  {} {}", registries.optimizers.canonical(&config.optimizer)?.cyan(), alias(&config.optimizer));
    println!("  scheduler  {} {}", registries.schedulers.canonical(&config.scheduler)?.cyan(), alias(&config.scheduler));
    for loss in &config.losses {
        println!(
            "  loss       {} = {} x {} {}",
            loss.name,
            loss.weight,
            registries.losses.canonical(&loss.loss_fn)?.cyan(),
            alias(&loss.loss_fn)
        );
    }
    Ok(())
}

fn alias(key: &str) -> colored::ColoredString {
    format!("({key})").dimmed()
}
