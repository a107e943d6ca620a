//! Shared contracts for the tile pipeline: the training configuration schema and
//! slippy-map tile coordinates.

pub mod config;
pub mod tile;

pub use config::{
    AugmentSection, ChannelBlock, ClassBlock, ConfigError, DatasetSection, LabelEncodingKind,
    LabelSourceKind, ModelSection, SamplerSection, TrainingConfig,
};
pub use tile::{parse_cover, LngLatBounds, TileId, TileParseError};
