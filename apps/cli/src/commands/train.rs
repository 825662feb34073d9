use super::load_config;
use anyhow::{Context, Result};
use colored::Colorize;
use poster_training::{PosterTrainer, Trainer, TracingProgressSink, TrainingJob};
use std::path::Path;

pub async fn execute(path: &Path, json_output: bool) -> Result<()> {
    let config = load_config(path)?;
    let trainer = PosterTrainer::default();
    let job = TrainingJob::new(config);

    trainer.prepare(&job).await.context("Failed to prepare training job")?;
    let manifest = trainer.run(&job, &TracingProgressSink).await.context("Training failed")?;

    if json_output {
        println!("{}", serde_json::to_string_pretty(&manifest)?);
        return Ok(());
    }

    let metrics = &manifest.metrics;
    println!();
    println!("{}", "Training complete".bold().green());
    println!("  Job:        {}", manifest.job_id.to_string().cyan());
    println!("  Experiment: {}/{}", manifest.project_name, manifest.experiment_name);
    println!("  Epochs:     {}{}", metrics.epochs_run, if metrics.stopped_early { " (stopped early)" } else { "" });
    if let Some(best) = metrics.best_score {
        println!("  Best {}: {best:.4}", metrics.monitor);
    }
    for (name, value) in &metrics.test {
        println!("  {name:<18} {value:.4}");
    }
    if let Some(ckpt) = manifest.artifacts.iter().find(|a| a.kind == poster_training::ArtifactKind::Checkpoint) {
        println!("  Checkpoint: {}", ckpt.path.display().to_string().dimmed());
    }
    println!();
    Ok(())
}
