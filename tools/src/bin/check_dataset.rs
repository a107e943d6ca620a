use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tile_dataset::TilePipeline;
use tileseg_tools::{init_tracing, load_training_config, open_spatial_store, DatasetCheck};

#[derive(Parser, Debug)]
#[command(
    name = "check_dataset",
    about = "Index a tile dataset and print usable/excluded tiles as JSON"
)]
struct Args {
    /// Training configuration (defaults to $TILESEG_CONFIG, then tileseg.toml).
    #[arg(long)]
    config: Option<PathBuf>,
    /// Also draw one full epoch and include its report.
    #[arg(long, default_value_t = false)]
    sample: bool,
    /// Write the summary to this file instead of stdout.
    #[arg(long)]
    output: Option<PathBuf>,
}

fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();
    let (path, cfg) = load_training_config(args.config.as_deref())?;
    let store = open_spatial_store(&cfg)?;
    let mut pipeline = TilePipeline::from_config(&cfg, store)
        .with_context(|| format!("build pipeline from {}", path.display()))?;

    let mut check = DatasetCheck::from_pipeline(&pipeline);
    if args.sample {
        let sampler = pipeline.sampler();
        for pair in sampler.prefetch() {
            pair.context("sample epoch")?;
        }
        check.epoch = sampler.report().cloned();
    }

    let json = serde_json::to_string_pretty(&check)?;
    match &args.output {
        Some(out) => {
            if let Some(parent) = out.parent() {
                fs::create_dir_all(parent).context("create output dir")?;
            }
            fs::write(out, json).with_context(|| format!("write {}", out.display()))?;
            tracing::info!(path = %out.display(), usable = check.usable, excluded = check.excluded, "dataset check written");
        }
        None => println!("{json}"),
    }
    Ok(())
}
