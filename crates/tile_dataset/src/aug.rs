//! Joint geometric augmentation of an input/label pair.

use crate::types::{InputTensor, LabelTensor};
use data_contracts::{AugmentSection, TileId};
use rand::{Rng, SeedableRng};
use serde::Serialize;

/// Pixel-exact transform applied identically to every band and to the label plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum GeoTransform {
    FlipHorizontal,
    FlipVertical,
    /// Clockwise.
    Rotate90,
    Rotate180,
    Rotate270,
}

impl GeoTransform {
    /// Transform a square row-major plane of side `size` in place.
    pub fn apply_plane<T: Copy>(self, plane: &mut [T], size: usize) {
        debug_assert_eq!(plane.len(), size * size);
        let last = size.saturating_sub(1);
        let src = plane.to_vec();
        for y in 0..size {
            for x in 0..size {
                let (sy, sx) = match self {
                    GeoTransform::FlipHorizontal => (y, last - x),
                    GeoTransform::FlipVertical => (last - y, x),
                    GeoTransform::Rotate90 => (last - x, y),
                    GeoTransform::Rotate180 => (last - y, last - x),
                    GeoTransform::Rotate270 => (x, last - y),
                };
                plane[y * size + x] = src[sy * size + sx];
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct JointAugment {
    /// Probability of mirroring left/right.
    pub flip_horizontal_prob: f32,
    /// Probability of mirroring top/bottom.
    pub flip_vertical_prob: f32,
    /// Probability of a rotation; 90, 180 and 270 degrees are equally likely.
    pub rotate_prob: f32,
    /// Seed for reproducible draws per `(seed, epoch, tile)`.
    pub seed: Option<u64>,
}

impl JointAugment {
    pub fn new(cfg: &AugmentSection, seed: Option<u64>) -> Self {
        Self {
            flip_horizontal_prob: cfg.flip_horizontal_prob,
            flip_vertical_prob: cfg.flip_vertical_prob,
            rotate_prob: cfg.rotate_prob,
            seed,
        }
    }

    pub fn is_identity(&self) -> bool {
        self.flip_horizontal_prob <= 0.0 && self.flip_vertical_prob <= 0.0 && self.rotate_prob <= 0.0
    }

    pub fn describe(&self) -> String {
        format!(
            "flip_h_p={:.2} flip_v_p={:.2} rotate_p={:.2} seed={}",
            self.flip_horizontal_prob,
            self.flip_vertical_prob,
            self.rotate_prob,
            self.seed
                .map(|s| s.to_string())
                .unwrap_or_else(|| "none".to_string())
        )
    }

    /// Transform sequence for one tile in one epoch.
    pub fn draw(&self, tile: TileId, epoch: u64) -> Vec<GeoTransform> {
        if self.is_identity() {
            return Vec::new();
        }
        let mut rng_local;
        let mut seeded_rng;
        let rng: &mut dyn rand::RngCore = if let Some(seed) = self.seed {
            let mixed = seed ^ tile.key() ^ epoch.wrapping_mul(0x9E37_79B9_7F4A_7C15);
            seeded_rng = rand::rngs::StdRng::seed_from_u64(mixed);
            &mut seeded_rng
        } else {
            rng_local = rand::rng();
            &mut rng_local
        };

        let mut out = Vec::new();
        if rng.random_range(0.0..1.0) < self.flip_horizontal_prob {
            out.push(GeoTransform::FlipHorizontal);
        }
        if rng.random_range(0.0..1.0) < self.flip_vertical_prob {
            out.push(GeoTransform::FlipVertical);
        }
        if rng.random_range(0.0..1.0) < self.rotate_prob {
            out.push(match rng.random_range(0..3u8) {
                0 => GeoTransform::Rotate90,
                1 => GeoTransform::Rotate180,
                _ => GeoTransform::Rotate270,
            });
        }
        out
    }

    /// Draw a sequence and apply it to both tensors. Returns what was applied.
    pub fn apply_pair(
        &self,
        tile: TileId,
        epoch: u64,
        input: &mut InputTensor,
        label: &mut LabelTensor,
    ) -> Vec<GeoTransform> {
        let transforms = self.draw(tile, epoch);
        apply_all(&transforms, input, label);
        transforms
    }
}

pub fn apply_all(transforms: &[GeoTransform], input: &mut InputTensor, label: &mut LabelTensor) {
    let size = input.size as usize;
    let plane = input.plane_len();
    for &t in transforms {
        for band in input.data.chunks_mut(plane) {
            t.apply_plane(band, size);
        }
        t.apply_plane(&mut label.data, label.size as usize);
    }
}
