use std::path::PathBuf;

use serde::Serialize;
use tile_dataset::{EpochReport, TileNote, TilePipeline};

/// Summary printed by `check_dataset`.
#[derive(Debug, Clone, Serialize)]
pub struct DatasetCheck {
    pub root: PathBuf,
    pub snapshot_key: String,
    pub sources: Vec<String>,
    pub usable: usize,
    pub excluded: usize,
    pub exclusions: Vec<TileNote>,
    pub num_classes: usize,
    pub classes: Vec<String>,
    pub bands: usize,
    pub tile_size: u32,
    /// Present when the check also drew a full epoch.
    pub epoch: Option<EpochReport>,
}

impl DatasetCheck {
    pub fn from_pipeline(pipeline: &TilePipeline) -> Self {
        let index = pipeline.index();
        Self {
            root: index.root().to_path_buf(),
            snapshot_key: index.snapshot_key().to_string(),
            sources: index.required_subs().to_vec(),
            usable: index.size(),
            excluded: index.excluded_count(),
            exclusions: index.exclusions().to_vec(),
            num_classes: pipeline.num_classes(),
            classes: pipeline.classes().iter().map(|c| c.title.clone()).collect(),
            bands: pipeline.channels().total_bands(),
            tile_size: pipeline.tile_size(),
            epoch: None,
        }
    }
}
