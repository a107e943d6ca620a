//! Wiring from a loaded [`TrainingConfig`] to a ready sampler.

use crate::aug::JointAugment;
use crate::channels::{resolve_channels, ChannelSet};
use crate::classes::ClassRegistry;
use crate::compose::ChannelCompositor;
use crate::index::TileIndex;
use crate::labels::{LabelRasterizer, LabelSource, PostgisLabels, RasterLabels, SpatialStore};
use crate::sampler::{PairLoader, SamplerOptions, TileSampler};
use crate::types::{DatasetResult, TileDatasetError};
use data_contracts::{parse_cover, ConfigError, LabelSourceKind, ModelSection, TileId, TrainingConfig};
use std::path::Path;
use std::sync::Arc;

pub struct TilePipeline {
    classes: Arc<ClassRegistry>,
    index: TileIndex,
    sampler: TileSampler,
    model: ModelSection,
    train: toml::Table,
}

impl TilePipeline {
    /// Validate the configuration, index the dataset and build the sampler.
    /// `store` is required when labels come from PostGIS and ignored otherwise.
    pub fn from_config(
        cfg: &TrainingConfig,
        store: Option<Arc<dyn SpatialStore>>,
    ) -> DatasetResult<Self> {
        let classes = Arc::new(ClassRegistry::build(&cfg.classes)?);
        let channels = resolve_channels(&cfg.channels)?;
        let tile_size = cfg.model.tile_size;
        let root = cfg.dataset.path.as_path();

        let cover = match &cfg.dataset.cover {
            Some(path) => Some(load_cover(path)?),
            None => None,
        };

        let (source, label_sub): (Arc<dyn LabelSource>, Option<&str>) =
            match cfg.dataset.label_source {
                LabelSourceKind::Raster => {
                    let source: Arc<dyn LabelSource> = Arc::new(RasterLabels::new(
                        root,
                        cfg.dataset.label_sub.clone(),
                        cfg.dataset.label_encoding.into(),
                    ));
                    (source, Some(cfg.dataset.label_sub.as_str()))
                }
                LabelSourceKind::Postgis => {
                    let store = store.ok_or_else(|| {
                        ConfigError::invalid(
                            "dataset.label_source",
                            "postgis labels need a spatial store connected with dataset.pg_dsn",
                        )
                    })?;
                    let source: Arc<dyn LabelSource> =
                        Arc::new(PostgisLabels::connect(store, &classes, tile_size)?);
                    (source, None)
                }
            };

        let index = TileIndex::build(root, &channels, label_sub, cover.as_deref())?;
        tracing::info!(
            root = %root.display(),
            tiles = index.size(),
            classes = classes.num_classes(),
            bands = channels.total_bands(),
            tile_size,
            labels = %source.describe(),
            "tile pipeline ready"
        );

        let options = SamplerOptions::from_section(&cfg.sampler);
        let loader = PairLoader::new(
            ChannelCompositor::new(root, tile_size),
            channels,
            LabelRasterizer::new(source, classes.clone(), tile_size),
            JointAugment::new(&cfg.sampler.augment, cfg.sampler.seed),
        );
        let sampler = TileSampler::new(Arc::new(loader), index.tile_ids().collect(), options);

        Ok(Self {
            classes,
            index,
            sampler,
            model: cfg.model.clone(),
            train: cfg.train.clone(),
        })
    }

    pub fn num_classes(&self) -> usize {
        self.classes.num_classes()
    }

    pub fn color_of(&self, index: u8) -> Option<[u8; 3]> {
        self.classes.color_of(index)
    }

    pub fn title_of(&self, index: u8) -> Option<&str> {
        self.classes.title_of(index)
    }

    pub fn classes(&self) -> &Arc<ClassRegistry> {
        &self.classes
    }

    pub fn channels(&self) -> &ChannelSet {
        self.sampler.loader().channels()
    }

    pub fn index(&self) -> &TileIndex {
        &self.index
    }

    pub fn sampler(&mut self) -> &mut TileSampler {
        &mut self.sampler
    }

    pub fn into_sampler(self) -> TileSampler {
        self.sampler
    }

    pub fn tile_size(&self) -> u32 {
        self.model.tile_size
    }

    /// `[model]` as configured, including keys this crate does not read.
    pub fn model(&self) -> &ModelSection {
        &self.model
    }

    /// `[train]` verbatim.
    pub fn train(&self) -> &toml::Table {
        &self.train
    }
}

fn load_cover(path: &Path) -> DatasetResult<Vec<TileId>> {
    let text = std::fs::read_to_string(path).map_err(|e| TileDatasetError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;
    let tiles = parse_cover(&text)
        .map_err(|e| ConfigError::invalid("dataset.cover", format!("{}: {e}", path.display())))?;
    tracing::debug!(path = %path.display(), tiles = tiles.len(), "cover loaded");
    Ok(tiles)
}
