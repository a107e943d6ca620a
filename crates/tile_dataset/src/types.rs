//! Core types, error definitions, and tensor containers for tile_dataset.

use data_contracts::{ConfigError, TileId};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

pub type DatasetResult<T> = Result<T, TileDatasetError>;

#[derive(Debug, Error)]
pub enum TileDatasetError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("no usable tiles under {root}: {excluded} tiles missing from at least one of {required:?}")]
    EmptyDataset {
        root: PathBuf,
        required: Vec<String>,
        excluded: usize,
    },
    #[error("tile {tile} in {sub}: band {band} requested but raster has {available} band(s)")]
    BandIndex {
        tile: TileId,
        sub: String,
        band: usize,
        available: usize,
    },
    #[error("tile {tile}: label value {value} does not map to any class")]
    LabelMapping { tile: TileId, value: String },
    #[error("tile {tile} in {sub}: raster is {width}x{height}, expected {expected}x{expected}")]
    TileGeometry {
        tile: TileId,
        sub: String,
        width: u32,
        height: u32,
        expected: u32,
    },
    #[error("tile {tile} missing from {sub}")]
    MissingTile { tile: TileId, sub: String },
    #[error("label query failed for tile {tile}: {msg}")]
    Query { tile: TileId, msg: String },
    #[error("epoch {epoch}: {skipped} of {scheduled} tiles skipped, above max ratio {max_ratio:.3}")]
    TooManySkipped {
        epoch: u64,
        skipped: usize,
        scheduled: usize,
        max_ratio: f32,
    },
    #[error("wkb raster decode error: {0}")]
    Wkb(String),
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("image decode error at {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("epoch cancelled")]
    Cancelled,
}

impl TileDatasetError {
    /// Per-tile failures that skip the tile instead of halting the run.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            TileDatasetError::MissingTile { .. } | TileDatasetError::Query { .. }
        )
    }
}

/// Normalized multi-band input for one tile, band-major (`[bands, size, size]`).
#[derive(Debug, Clone, PartialEq)]
pub struct InputTensor {
    pub bands: usize,
    pub size: u32,
    pub data: Vec<f32>,
}

impl InputTensor {
    pub fn shape(&self) -> [usize; 3] {
        [self.bands, self.size as usize, self.size as usize]
    }

    pub fn plane_len(&self) -> usize {
        self.size as usize * self.size as usize
    }

    /// Zero-based band plane.
    pub fn band(&self, i: usize) -> &[f32] {
        let plane = self.plane_len();
        &self.data[i * plane..(i + 1) * plane]
    }
}

/// Per-pixel class indices for one tile (`[size, size]`, row-major).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelTensor {
    pub size: u32,
    pub data: Vec<u8>,
}

impl LabelTensor {
    pub fn shape(&self) -> [usize; 2] {
        [self.size as usize, self.size as usize]
    }

    pub fn get(&self, x: u32, y: u32) -> u8 {
        self.data[(y * self.size + x) as usize]
    }
}

/// One excluded or skipped tile with the reason it was left out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TileNote {
    pub tile: TileId,
    pub reason: String,
}
