//! Per-subset label statistics for a persisted split.

use super::load_config;
use anyhow::{Context, Result};
use colored::Colorize;
use comfy_table::{Cell, Color, Table};
use poster_training::{read_subsets, DataLayout, Subset};
use serde_json::json;
use std::path::Path;

pub fn execute(path: &Path, json_output: bool) -> Result<()> {
    let config = load_config(path)?;
    let layout = DataLayout::new(config.data_config.data_path.clone());
    let subsets = read_subsets(&layout)
        .with_context(|| format!("No split found in {}. Run `poster split` first.", layout.root().display()))?;
    let tags = subsets.train.tags().to_vec();
    let rates: Vec<Vec<f64>> = Subset::ALL.iter().map(|&s| subsets.get(s).positive_rates()).collect();

    if json_output {
        let out = json!({
            "tags": tags,
            "subsets": Subset::ALL.iter().zip(&rates).map(|(&s, r)| json!({
                "subset": s.as_str(),
                "rows": subsets.get(s).len(),
                "positive_rates": r,
            })).collect::<Vec<_>>(),
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    println!("{}", format!("Split of {}", layout.root().display()).bold().cyan());
    for subset in Subset::ALL {
        println!("  {:<6} {}", subset.as_str(), subsets.get(subset).len());
    }
    println!();

    let mut table = Table::new();
    let mut header = vec![Cell::new("Tag")];
    header.extend(Subset::ALL.iter().map(|s| Cell::new(s.as_str())));
    table.set_header(header);
    for (t, tag) in tags.iter().enumerate() {
        let train = rates[0][t];
        let mut row = vec![Cell::new(tag)];
        for subset_rates in &rates {
            let rate = subset_rates[t];
            // drift above 5 points from train is worth a look
            let cell = Cell::new(format!("{:.1}%", rate * 100.0));
            row.push(if (rate - train).abs() > 0.05 { cell.fg(Color::Yellow) } else { cell });
        }
        table.add_row(row);
    }
    println!("{table}");
    println!();
    Ok(())
}
