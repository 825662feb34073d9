//! Poster CLI
//!
//! `poster` prepares the stratified train/valid/test split of a poster
//! dataset and trains a multi-label classifier on it.

mod commands;

use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "poster", author, version, about = "Multi-label poster classification")]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Split the dataset (if needed), train, checkpoint and test
    Train {
        /// Experiment config (YAML, or TOML by extension)
        config: PathBuf,

        /// Print the training manifest as JSON
        #[arg(long)]
        json: bool,
    },

    /// Write df_train/df_valid/df_test next to the images, once
    Split {
        config: PathBuf,
    },

    /// Subset sizes and per-tag positive rates of an existing split
    Stats {
        config: PathBuf,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Validate a config and resolve every registry key it names
    Check {
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber =
        FmtSubscriber::builder().with_max_level(level).without_time().with_target(false).with_writer(std::io::stderr).finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("failed to install logger: {e}");
    }

    let result = match args.command {
        Command::Train { config, json } => commands::train::execute(&config, json).await,
        Command::Split { config } => commands::split::execute(&config),
        Command::Stats { config, json } => commands::stats::execute(&config, json),
        Command::Check { config } => commands::check::execute(&config),
    };

    if let Err(e) = result {
        eprintln!("{} {e:#}", "error:".red().bold());
        std::process::exit(1);
    }
}
