use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use data_contracts::TileId;
use image::{Rgb, RgbImage};
use tile_dataset::{ClassRegistry, LabelTensor};

/// Paint class indices with their configured colors. Unknown indices stay black.
pub fn colorize(label: &LabelTensor, classes: &ClassRegistry) -> RgbImage {
    RgbImage::from_fn(label.size, label.size, |x, y| {
        Rgb(classes.color_of(label.get(x, y)).unwrap_or([0, 0, 0]))
    })
}

/// Write `out_root/z/x/y.png` and return its path.
pub fn write_label_tile(
    out_root: &Path,
    tile: TileId,
    label: &LabelTensor,
    classes: &ClassRegistry,
) -> Result<PathBuf> {
    let path = out_root.join(tile.relative_path("png"));
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    colorize(label, classes)
        .save(&path)
        .with_context(|| format!("write {}", path.display()))?;
    Ok(path)
}
