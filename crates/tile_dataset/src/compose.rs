//! Channel compositor: stacks the configured bands of every channel block into
//! one normalized input tensor per tile.

use crate::channels::ChannelSet;
use crate::raster::{locate_tile, Raster};
use crate::types::{DatasetResult, InputTensor, TileDatasetError};
use data_contracts::TileId;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct ChannelCompositor {
    root: PathBuf,
    tile_size: u32,
}

impl ChannelCompositor {
    pub fn new(root: impl Into<PathBuf>, tile_size: u32) -> Self {
        Self {
            root: root.into(),
            tile_size,
        }
    }

    pub fn tile_size(&self) -> u32 {
        self.tile_size
    }

    pub fn compose(&self, tile: TileId, channels: &ChannelSet) -> DatasetResult<InputTensor> {
        let plane = self.tile_size as usize * self.tile_size as usize;
        let mut data = Vec::with_capacity(channels.total_bands() * plane);
        // Blocks may share a sub-directory; decode each file once per tile.
        let mut decoded: HashMap<&str, Raster> = HashMap::new();

        for spec in channels.iter() {
            if !decoded.contains_key(spec.sub.as_str()) {
                let raster = self.load(tile, &spec.sub)?;
                decoded.insert(spec.sub.as_str(), raster);
            }
            let raster = &decoded[spec.sub.as_str()];
            for (i, &band) in spec.bands.iter().enumerate() {
                let values = raster.band(band).ok_or_else(|| TileDatasetError::BandIndex {
                    tile,
                    sub: spec.sub.clone(),
                    band,
                    available: raster.bands,
                })?;
                data.extend(values.iter().map(|&raw| spec.normalize(i, raw)));
            }
        }

        Ok(InputTensor {
            bands: channels.total_bands(),
            size: self.tile_size,
            data,
        })
    }

    fn load(&self, tile: TileId, sub: &str) -> DatasetResult<Raster> {
        let missing = || TileDatasetError::MissingTile {
            tile,
            sub: sub.to_string(),
        };
        let path = locate_tile(&self.root, sub, tile).ok_or_else(missing)?;
        let raster = match Raster::open(&path) {
            Ok(r) => r,
            // Removed between locate and open.
            Err(TileDatasetError::Io { source, .. })
                if source.kind() == std::io::ErrorKind::NotFound =>
            {
                return Err(missing());
            }
            Err(e) => return Err(e),
        };
        check_geometry(tile, sub, &path, raster.width, raster.height, self.tile_size)?;
        Ok(raster)
    }
}

pub(crate) fn check_geometry(
    tile: TileId,
    sub: &str,
    path: &Path,
    width: u32,
    height: u32,
    expected: u32,
) -> DatasetResult<()> {
    if width != expected || height != expected {
        tracing::error!(tile = %tile, sub, path = %path.display(), width, height, expected, "tile geometry mismatch");
        return Err(TileDatasetError::TileGeometry {
            tile,
            sub: sub.to_string(),
            width,
            height,
            expected,
        });
    }
    Ok(())
}
