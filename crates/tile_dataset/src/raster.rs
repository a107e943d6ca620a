//! Raster tile files: locating `sub/z/x/y.ext` and decoding into band planes.

use crate::types::{DatasetResult, TileDatasetError};
use data_contracts::TileId;
use image::{DynamicImage, ImageBuffer, Pixel};
use std::path::{Path, PathBuf};

/// Accepted tile extensions, probed in this order. Matching is exact: the
/// index only lists files that [`locate_tile`] can open again.
pub const TILE_EXTENSIONS: &[&str] = &["png", "tif", "tiff", "jpg", "jpeg", "webp"];

pub fn is_tile_extension(ext: &str) -> bool {
    TILE_EXTENSIONS.contains(&ext)
}

/// First existing file for `tile` under `root/sub`, if any.
pub fn locate_tile(root: &Path, sub: &str, tile: TileId) -> Option<PathBuf> {
    let dir = root.join(sub);
    TILE_EXTENSIONS
        .iter()
        .map(|ext| dir.join(tile.relative_path(ext)))
        .find(|p| p.is_file())
}

/// Decoded raster with samples cast to `f32` and stored band-major.
#[derive(Debug, Clone)]
pub struct Raster {
    pub width: u32,
    pub height: u32,
    pub bands: usize,
    data: Vec<f32>,
}

impl Raster {
    pub fn open(path: &Path) -> DatasetResult<Self> {
        let img = image::open(path).map_err(|e| match e {
            image::ImageError::IoError(source) => TileDatasetError::Io {
                path: path.to_path_buf(),
                source,
            },
            other => TileDatasetError::Image {
                path: path.to_path_buf(),
                source: other,
            },
        })?;
        Ok(Self::from_dynamic(img))
    }

    pub fn from_dynamic(img: DynamicImage) -> Self {
        let (width, height) = (img.width(), img.height());
        let (bands, data) = match img {
            DynamicImage::ImageLuma8(b) => planar(&b),
            DynamicImage::ImageLumaA8(b) => planar(&b),
            DynamicImage::ImageRgb8(b) => planar(&b),
            DynamicImage::ImageRgba8(b) => planar(&b),
            DynamicImage::ImageLuma16(b) => planar(&b),
            DynamicImage::ImageLumaA16(b) => planar(&b),
            DynamicImage::ImageRgb16(b) => planar(&b),
            DynamicImage::ImageRgba16(b) => planar(&b),
            DynamicImage::ImageRgb32F(b) => planar(&b),
            DynamicImage::ImageRgba32F(b) => planar(&b),
            other => planar(&other.to_rgba32f()),
        };
        Self {
            width,
            height,
            bands,
            data,
        }
    }

    /// One-based band plane, `None` when out of range.
    pub fn band(&self, band: usize) -> Option<&[f32]> {
        if band == 0 || band > self.bands {
            return None;
        }
        let plane = self.width as usize * self.height as usize;
        Some(&self.data[(band - 1) * plane..band * plane])
    }
}

fn planar<P>(img: &ImageBuffer<P, Vec<P::Subpixel>>) -> (usize, Vec<f32>)
where
    P: Pixel,
    P::Subpixel: Into<f32>,
{
    let channels = P::CHANNEL_COUNT as usize;
    let plane = img.width() as usize * img.height() as usize;
    let mut out = vec![0.0f32; channels * plane];
    for (i, px) in img.pixels().enumerate() {
        for (c, v) in px.channels().iter().enumerate() {
            out[c * plane + i] = (*v).into();
        }
    }
    (channels, out)
}
