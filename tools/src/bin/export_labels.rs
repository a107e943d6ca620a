use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tile_dataset::TilePipeline;
use tileseg_tools::export::write_label_tile;
use tileseg_tools::{init_tracing, load_training_config, open_spatial_store};

#[derive(Parser, Debug)]
#[command(
    name = "export_labels",
    about = "Rasterize labels for every indexed tile and write class-colored PNGs to out/z/x/y.png"
)]
struct Args {
    /// Training configuration (defaults to $TILESEG_CONFIG, then tileseg.toml).
    #[arg(long)]
    config: Option<PathBuf>,
    /// Output root.
    #[arg(long, default_value = "labels_export")]
    out: PathBuf,
    /// Stop after this many tiles.
    #[arg(long)]
    limit: Option<usize>,
}

fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();
    let (path, cfg) = load_training_config(args.config.as_deref())?;
    let store = open_spatial_store(&cfg)?;
    let mut pipeline = TilePipeline::from_config(&cfg, store)
        .with_context(|| format!("build pipeline from {}", path.display()))?;

    let classes = pipeline.classes().clone();
    let tiles: Vec<_> = pipeline
        .index()
        .tile_ids()
        .take(args.limit.unwrap_or(usize::MAX))
        .collect();
    let loader = pipeline.sampler().loader().clone();

    let mut written = 0usize;
    let mut skipped = 0usize;
    for tile in tiles {
        match loader.rasterizer().rasterize(tile) {
            Ok(label) => {
                write_label_tile(&args.out, tile, &label, &classes)?;
                written += 1;
            }
            Err(e) if e.is_recoverable() => {
                tracing::warn!(tile = %tile, error = %e, "skipping tile");
                skipped += 1;
            }
            Err(e) => return Err(e).with_context(|| format!("rasterize {tile}")),
        }
    }

    tracing::info!(out = %args.out.display(), written, skipped, "label export complete");
    println!("Labels written to {}", args.out.display());
    Ok(())
}
