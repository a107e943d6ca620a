//! Tile index: the set of tiles present in every required source.

use crate::channels::ChannelSet;
use crate::raster::is_tile_extension;
use crate::types::{DatasetResult, TileDatasetError, TileNote};
use data_contracts::TileId;
use rayon::prelude::*;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

/// Exclusions kept verbatim for diagnostics; the rest are only counted.
pub const MAX_EXCLUSION_EXAMPLES: usize = 16;

#[derive(Debug, Clone)]
pub struct TileIndex {
    root: PathBuf,
    required: Vec<String>,
    tiles: Vec<TileId>,
    excluded: usize,
    exclusions: Vec<TileNote>,
    snapshot_key: String,
}

impl TileIndex {
    /// Scan `root` for tiles present in every channel sub-directory and, when
    /// given, the label sub-directory. `cover` restricts the candidate tiles.
    pub fn build(
        root: &Path,
        channels: &ChannelSet,
        label_sub: Option<&str>,
        cover: Option<&[TileId]>,
    ) -> DatasetResult<Self> {
        let mut required = channels.required_subs();
        if let Some(label_sub) = label_sub {
            if !required.iter().any(|s| s == label_sub) {
                required.push(label_sub.to_string());
            }
        }

        let scanned = required
            .par_iter()
            .map(|sub| scan_sub(root, sub).map(|tiles| (sub.clone(), tiles)))
            .collect::<DatasetResult<Vec<_>>>()?;
        let per_sub: BTreeMap<String, BTreeSet<TileId>> = scanned.into_iter().collect();

        let candidates: BTreeSet<TileId> = match cover {
            Some(cover) => cover.iter().copied().collect(),
            None => per_sub.values().flatten().copied().collect(),
        };

        let mut tiles = Vec::with_capacity(candidates.len());
        let mut excluded = 0usize;
        let mut exclusions = Vec::new();
        for tile in candidates {
            let missing: Vec<&str> = required
                .iter()
                .filter(|sub| !per_sub[sub.as_str()].contains(&tile))
                .map(String::as_str)
                .collect();
            if missing.is_empty() {
                tiles.push(tile);
                continue;
            }
            excluded += 1;
            if exclusions.len() < MAX_EXCLUSION_EXAMPLES {
                exclusions.push(TileNote {
                    tile,
                    reason: format!("missing from {}", missing.join(", ")),
                });
            }
        }

        if excluded > 0 {
            tracing::warn!(
                root = %root.display(),
                excluded,
                usable = tiles.len(),
                examples = ?exclusions.iter().map(|n| n.tile.to_string()).collect::<Vec<_>>(),
                "tiles missing from at least one source were excluded"
            );
        }
        if tiles.is_empty() {
            return Err(TileDatasetError::EmptyDataset {
                root: root.to_path_buf(),
                required,
                excluded,
            });
        }
        tracing::info!(
            root = %root.display(),
            tiles = tiles.len(),
            sources = ?required,
            "tile index built"
        );

        let snapshot_key = snapshot_key(root, channels, label_sub);
        Ok(Self {
            root: root.to_path_buf(),
            required,
            tiles,
            excluded,
            exclusions,
            snapshot_key,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn size(&self) -> usize {
        self.tiles.len()
    }

    /// Usable tiles sorted by `(z, x, y)`. Each call starts from the first tile.
    pub fn tile_ids(&self) -> impl Iterator<Item = TileId> + '_ {
        self.tiles.iter().copied()
    }

    pub fn contains(&self, tile: TileId) -> bool {
        self.tiles.binary_search(&tile).is_ok()
    }

    pub fn required_subs(&self) -> &[String] {
        &self.required
    }

    pub fn excluded_count(&self) -> usize {
        self.excluded
    }

    pub fn exclusions(&self) -> &[TileNote] {
        &self.exclusions
    }

    pub fn snapshot_key(&self) -> &str {
        &self.snapshot_key
    }

    /// False when the index was built for another root, channel list or label source.
    pub fn is_current(&self, root: &Path, channels: &ChannelSet, label_sub: Option<&str>) -> bool {
        self.snapshot_key == snapshot_key(root, channels, label_sub)
    }
}

/// SHA256 hex of the inputs that determine which tiles are usable.
pub fn snapshot_key(root: &Path, channels: &ChannelSet, label_sub: Option<&str>) -> String {
    #[derive(Serialize)]
    struct SnapshotTuple<'a> {
        dataset_root: String,
        channels: &'a ChannelSet,
        label_sub: Option<&'a str>,
    }
    let tuple = SnapshotTuple {
        dataset_root: root.display().to_string(),
        channels,
        label_sub,
    };
    let bytes = serde_json::to_vec(&tuple).unwrap_or_default();
    use sha2::Digest;
    let hash = sha2::Sha256::digest(bytes);
    format!("{:x}", hash)
}

fn read_dir(path: &Path) -> DatasetResult<fs::ReadDir> {
    fs::read_dir(path).map_err(|e| TileDatasetError::Io {
        path: path.to_path_buf(),
        source: e,
    })
}

/// `raw` as a number only when it is written canonically (`7`, not `007` or `+7`).
fn canonical<T: std::str::FromStr + ToString>(raw: &str) -> Option<T> {
    raw.parse::<T>().ok().filter(|v| v.to_string() == raw)
}

fn numeric_dirs<T: std::str::FromStr + ToString>(path: &Path) -> DatasetResult<Vec<(T, PathBuf)>> {
    let mut out = Vec::new();
    for entry in read_dir(path)? {
        let Ok(entry) = entry else { continue };
        let p = entry.path();
        if !p.is_dir() {
            continue;
        }
        let Some(value) = p
            .file_name()
            .and_then(|s| s.to_str())
            .and_then(canonical::<T>)
        else {
            continue;
        };
        out.push((value, p));
    }
    Ok(out)
}

/// Collect tile ids from `root/sub/z/x/y.ext`. Entries that do not parse, or
/// that [`crate::raster::locate_tile`] would not find under their canonical
/// name, are ignored.
pub fn scan_sub(root: &Path, sub: &str) -> DatasetResult<BTreeSet<TileId>> {
    let base = root.join(sub);
    let mut tiles = BTreeSet::new();
    for (z, z_dir) in numeric_dirs::<u8>(&base)? {
        for (x, x_dir) in numeric_dirs::<u32>(&z_dir)? {
            for entry in read_dir(&x_dir)? {
                let Ok(entry) = entry else { continue };
                let p = entry.path();
                if !p.is_file() {
                    continue;
                }
                let ext_ok = p
                    .extension()
                    .and_then(|s| s.to_str())
                    .is_some_and(is_tile_extension);
                let y = p
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .and_then(canonical::<u32>);
                let (true, Some(y)) = (ext_ok, y) else {
                    continue;
                };
                match TileId::new(z, x, y) {
                    Ok(tile) => {
                        tiles.insert(tile);
                    }
                    Err(e) => {
                        tracing::debug!(path = %p.display(), error = %e, "ignoring tile outside zoom range");
                    }
                }
            }
        }
    }
    Ok(tiles)
}
