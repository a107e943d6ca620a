//! Channel compositor, label rasterizer and tile sampler for segmentation training.
//!
//! This crate provides:
//! - Class registry and channel block resolution from a [`data_contracts::TrainingConfig`]
//! - Tile indexing across raster sources (`root/{sub}/{z}/{x}/{y}.{ext}`)
//! - Multi-band input composition with per-band normalization
//! - Label rasterization from pre-rendered rasters or PostGIS geometries
//! - A restartable, optionally prefetching sampler with joint augmentation
//! - Burn tensor collation behind the `burn-runtime` feature

pub mod aug;
pub mod channels;
pub mod classes;
pub mod colors;
pub mod compose;
pub mod index;
pub mod labels;
pub mod pipeline;
pub mod prefetch;
pub mod raster;
pub mod sampler;
pub mod types;
pub mod validation;
pub mod wkb;

#[cfg(feature = "burn-runtime")]
pub mod batch;

pub use aug::{GeoTransform, JointAugment};
pub use channels::{resolve_channels, ChannelSet, ChannelSpec};
pub use classes::{ClassDef, ClassRegistry, LabelValue, MAX_CLASSES};
pub use colors::parse_color;
pub use compose::ChannelCompositor;
pub use index::TileIndex;
pub use labels::{
    LabelEncoding, LabelRaster, LabelRasterizer, LabelSource, PostgisLabels, RasterLabels,
    RawLabels, SpatialStore,
};
pub use pipeline::TilePipeline;
pub use prefetch::PrefetchEpoch;
pub use sampler::{PairLoader, SamplerOptions, SamplerState, TilePair, TileSampler};
pub use types::*;
pub use validation::{EpochReport, ValidationOutcome};

#[cfg(feature = "burn-runtime")]
pub use batch::{collate_pairs, SegBatch};
