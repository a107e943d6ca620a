use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use tile_dataset::TilePipeline;
use tileseg_tools::{init_tracing, load_training_config, open_spatial_store};

#[derive(Parser, Debug)]
#[command(
    name = "sample_epoch",
    about = "Draw epochs from the tile sampler and print one JSON report per epoch"
)]
struct Args {
    /// Training configuration (defaults to $TILESEG_CONFIG, then tileseg.toml).
    #[arg(long)]
    config: Option<PathBuf>,
    /// Number of epochs to draw.
    #[arg(long, default_value_t = 1)]
    epochs: u64,
    /// Draw through the prefetching worker pool instead of rayon batches.
    #[arg(long, default_value_t = false)]
    prefetch: bool,
    /// Pairs per batch when not prefetching.
    #[arg(long, default_value_t = 16)]
    batch_size: usize,
}

fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();
    let (path, cfg) = load_training_config(args.config.as_deref())?;
    let store = open_spatial_store(&cfg)?;
    let mut pipeline = TilePipeline::from_config(&cfg, store)
        .with_context(|| format!("build pipeline from {}", path.display()))?;
    let sampler = pipeline.sampler();

    for _ in 0..args.epochs {
        let started = Instant::now();
        let mut pairs = 0usize;
        if args.prefetch {
            for pair in sampler.prefetch() {
                pair?;
                pairs += 1;
            }
        } else {
            sampler.start_epoch();
            while let Some(batch) = sampler.next_batch(args.batch_size)? {
                pairs += batch.len();
            }
        }
        let secs = started.elapsed().as_secs_f64().max(0.001);
        tracing::debug!(epoch = sampler.epoch(), pairs, rate = pairs as f64 / secs, "epoch drawn");
        if let Some(report) = sampler.report() {
            println!("{}", serde_json::to_string(report)?);
        }
    }
    Ok(())
}
