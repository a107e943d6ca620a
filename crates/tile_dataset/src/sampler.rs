//! Tile sampler: restartable epochs of (input, label) pairs.

use crate::aug::{GeoTransform, JointAugment};
use crate::channels::ChannelSet;
use crate::compose::ChannelCompositor;
use crate::labels::LabelRasterizer;
use crate::types::{DatasetResult, InputTensor, LabelTensor};
use crate::validation::EpochReport;
use data_contracts::{SamplerSection, TileId};
use rand::{seq::SliceRandom, SeedableRng};
use rayon::prelude::*;
use std::sync::Arc;
use std::time::Instant;

pub(crate) const DEFAULT_LOG_EVERY_PAIRS: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplerState {
    Idle,
    Iterating,
    Exhausted,
}

/// One training example, already augmented.
#[derive(Debug, Clone)]
pub struct TilePair {
    pub tile: TileId,
    pub input: InputTensor,
    pub label: LabelTensor,
    /// Transforms applied to both tensors, in order.
    pub transforms: Vec<GeoTransform>,
}

#[derive(Debug, Clone)]
pub struct SamplerOptions {
    pub shuffle: bool,
    pub seed: Option<u64>,
    pub max_skip_ratio: f32,
    pub workers: usize,
    pub queue_depth: usize,
    /// Progress log interval in pairs; `None` disables it.
    pub log_every: Option<usize>,
}

impl SamplerOptions {
    /// Options from the `[sampler]` section. `TILESEG_LOG_EVERY` overrides the
    /// progress interval (`0`/`off` disables it).
    pub fn from_section(section: &SamplerSection) -> Self {
        let log_every = match std::env::var("TILESEG_LOG_EVERY") {
            Ok(val) => {
                if val.eq_ignore_ascii_case("off") || val.trim() == "0" {
                    None
                } else {
                    val.trim().parse::<usize>().ok().filter(|v| *v > 0)
                }
            }
            Err(_) => Some(DEFAULT_LOG_EVERY_PAIRS),
        };
        Self {
            shuffle: section.shuffle,
            seed: section.seed,
            max_skip_ratio: section.max_skip_ratio,
            workers: section.workers,
            queue_depth: section.queue_depth,
            log_every,
        }
    }
}

impl Default for SamplerOptions {
    fn default() -> Self {
        Self::from_section(&SamplerSection::default())
    }
}

/// Composes, rasterizes and augments one tile. Shared by sampler threads.
pub struct PairLoader {
    compositor: ChannelCompositor,
    channels: ChannelSet,
    rasterizer: LabelRasterizer,
    augment: JointAugment,
}

impl PairLoader {
    pub fn new(
        compositor: ChannelCompositor,
        channels: ChannelSet,
        rasterizer: LabelRasterizer,
        augment: JointAugment,
    ) -> Self {
        Self {
            compositor,
            channels,
            rasterizer,
            augment,
        }
    }

    pub fn channels(&self) -> &ChannelSet {
        &self.channels
    }

    pub fn rasterizer(&self) -> &LabelRasterizer {
        &self.rasterizer
    }

    pub fn augment(&self) -> &JointAugment {
        &self.augment
    }

    pub fn load(&self, tile: TileId, epoch: u64) -> DatasetResult<TilePair> {
        let mut input = self.compositor.compose(tile, &self.channels)?;
        let mut label = self.rasterizer.rasterize(tile)?;
        let transforms = self.augment.apply_pair(tile, epoch, &mut input, &mut label);
        Ok(TilePair {
            tile,
            input,
            label,
            transforms,
        })
    }
}

pub struct TileSampler {
    pub(crate) loader: Arc<PairLoader>,
    tiles: Vec<TileId>,
    order: Vec<TileId>,
    cursor: usize,
    next_epoch: u64,
    pub(crate) epoch: u64,
    pub(crate) state: SamplerState,
    pub(crate) report: Option<EpochReport>,
    pub(crate) options: SamplerOptions,
    started: Instant,
    last_logged: usize,
}

impl TileSampler {
    /// `tiles` in index order; shuffling happens per epoch.
    pub fn new(loader: Arc<PairLoader>, tiles: Vec<TileId>, options: SamplerOptions) -> Self {
        Self {
            loader,
            tiles,
            order: Vec::new(),
            cursor: 0,
            next_epoch: 0,
            epoch: 0,
            state: SamplerState::Idle,
            report: None,
            options,
            started: Instant::now(),
            last_logged: 0,
        }
    }

    pub fn state(&self) -> SamplerState {
        self.state
    }

    /// Epoch currently running, or the last one that ran.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn len(&self) -> usize {
        self.tiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }

    pub fn options(&self) -> &SamplerOptions {
        &self.options
    }

    pub fn loader(&self) -> &Arc<PairLoader> {
        &self.loader
    }

    /// Report of the running epoch, or of the last finished one.
    pub fn report(&self) -> Option<&EpochReport> {
        self.report.as_ref()
    }

    /// Begin the next epoch and return its number. Starting while an epoch is
    /// still running abandons it.
    pub fn start_epoch(&mut self) -> u64 {
        if self.state == SamplerState::Iterating {
            tracing::debug!(epoch = self.epoch, cursor = self.cursor, "abandoning running epoch");
        }
        let epoch = self.next_epoch;
        self.next_epoch += 1;
        self.order = self.schedule(epoch);
        self.cursor = 0;
        self.epoch = epoch;
        self.state = SamplerState::Iterating;
        self.report = Some(EpochReport::new(
            epoch,
            self.order.len(),
            self.options.max_skip_ratio,
        ));
        self.started = Instant::now();
        self.last_logged = 0;
        tracing::info!(
            epoch,
            tiles = self.order.len(),
            shuffle = self.options.shuffle,
            augment = %self.loader.augment.describe(),
            "epoch started"
        );
        epoch
    }

    /// Tile order for `epoch`. With a seed the order depends only on `(seed, epoch)`.
    pub fn schedule(&self, epoch: u64) -> Vec<TileId> {
        let mut order = self.tiles.clone();
        if self.options.shuffle {
            let mut rng = match self.options.seed {
                Some(seed) => rand::rngs::StdRng::seed_from_u64(seed.wrapping_add(epoch)),
                None => rand::rngs::StdRng::from_rng(&mut rand::rng()),
            };
            order.shuffle(&mut rng);
        }
        order
    }

    /// Tiles of the running epoch not yet handed out, in draw order.
    pub(crate) fn take_remaining(&mut self) -> Vec<TileId> {
        let rest = self.order[self.cursor..].to_vec();
        self.cursor = self.order.len();
        rest
    }

    /// Next pair of the epoch; `Ok(None)` marks the end of the epoch. An idle
    /// sampler starts its first epoch here.
    pub fn next_pair(&mut self) -> DatasetResult<Option<TilePair>> {
        match self.state {
            SamplerState::Idle => {
                self.start_epoch();
            }
            SamplerState::Exhausted => return Ok(None),
            SamplerState::Iterating => {}
        }
        while self.cursor < self.order.len() {
            let tile = self.order[self.cursor];
            self.cursor += 1;
            match self.loader.load(tile, self.epoch) {
                Ok(pair) => {
                    self.record_produced(1);
                    return Ok(Some(pair));
                }
                Err(e) => self.handle_failure(tile, e)?,
            }
        }
        self.finish_epoch();
        Ok(None)
    }

    /// Up to `n` pairs loaded in parallel, in draw order. Skipped tiles shrink
    /// the batch; `Ok(None)` marks the end of the epoch.
    pub fn next_batch(&mut self, n: usize) -> DatasetResult<Option<Vec<TilePair>>> {
        match self.state {
            SamplerState::Idle => {
                self.start_epoch();
            }
            SamplerState::Exhausted => return Ok(None),
            SamplerState::Iterating => {}
        }
        let n = n.max(1);
        while self.cursor < self.order.len() {
            let end = (self.cursor + n).min(self.order.len());
            let slice = &self.order[self.cursor..end];
            self.cursor = end;

            let loader = &self.loader;
            let epoch = self.epoch;
            let mut loaded: Vec<_> = slice
                .par_iter()
                .enumerate()
                .map(|(i, &tile)| (i, tile, loader.load(tile, epoch)))
                .collect();
            loaded.sort_by_key(|(i, _, _)| *i);

            let mut pairs = Vec::with_capacity(loaded.len());
            for (_i, tile, res) in loaded {
                match res {
                    Ok(pair) => pairs.push(pair),
                    Err(e) => self.handle_failure(tile, e)?,
                }
            }
            if !pairs.is_empty() {
                self.record_produced(pairs.len());
                return Ok(Some(pairs));
            }
        }
        self.finish_epoch();
        Ok(None)
    }

    /// Skip recoverable failures under the threshold; anything else ends the epoch.
    pub(crate) fn handle_failure(
        &mut self,
        tile: TileId,
        err: crate::types::TileDatasetError,
    ) -> DatasetResult<()> {
        if !err.is_recoverable() {
            tracing::error!(epoch = self.epoch, tile = %tile, error = %err, "fatal tile error");
            self.abort_epoch();
            return Err(err);
        }
        let verdict = match self.report.as_mut() {
            Some(report) => report.record_skip(tile, &err),
            None => Ok(()),
        };
        if verdict.is_err() {
            self.abort_epoch();
        }
        verdict
    }

    pub(crate) fn record_produced(&mut self, count: usize) {
        let Some(report) = self.report.as_mut() else {
            return;
        };
        for _ in 0..count {
            report.record_produced();
        }
        let produced = report.produced;
        let skipped = report.skipped;
        let Some(every) = self.options.log_every else {
            return;
        };
        if produced.saturating_sub(self.last_logged) < every {
            return;
        }
        let secs = self.started.elapsed().as_secs_f32().max(0.001);
        tracing::info!(
            epoch = self.epoch,
            produced,
            skipped,
            scheduled = self.order.len(),
            rate = produced as f32 / secs,
            "sampler progress"
        );
        self.last_logged = produced;
    }

    pub(crate) fn finish_epoch(&mut self) {
        if self.state != SamplerState::Iterating {
            return;
        }
        self.state = SamplerState::Exhausted;
        if let Some(report) = &self.report {
            report.log();
        }
    }

    /// End the epoch early. The partial report is still logged and kept.
    pub(crate) fn abort_epoch(&mut self) {
        self.cursor = self.order.len();
        if self.state != SamplerState::Iterating {
            return;
        }
        self.state = SamplerState::Exhausted;
        if let Some(report) = &self.report {
            report.log();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::resolve_channels;
    use crate::classes::ClassRegistry;
    use crate::labels::{LabelEncoding, RasterLabels};
    use crate::types::TileDatasetError;
    use data_contracts::{AugmentSection, ChannelBlock, ClassBlock};
    use image::{GrayImage, Luma};
    use std::path::Path;

    const SIZE: u32 = 4;

    fn write(root: &Path, sub: &str, tile: TileId, value: u8) {
        let path = root.join(sub).join(tile.relative_path("png"));
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        GrayImage::from_pixel(SIZE, SIZE, Luma([value])).save(path).unwrap();
    }

    fn sampler(root: &Path, tiles: Vec<TileId>, options: SamplerOptions) -> TileSampler {
        let channels = resolve_channels(&[ChannelBlock {
            sub: "images".into(),
            bands: vec![1],
            mean: vec![0.0],
            std: vec![1.0],
        }])
        .unwrap();
        let classes = Arc::new(
            ClassRegistry::build(&[
                ClassBlock { title: "background".into(), color: "black".into(), query: None },
                ClassBlock { title: "water".into(), color: "blue".into(), query: None },
            ])
            .unwrap(),
        );
        let source = Arc::new(RasterLabels::new(root, "labels", LabelEncoding::Index));
        let loader = PairLoader::new(
            ChannelCompositor::new(root, SIZE),
            channels,
            LabelRasterizer::new(source, classes, SIZE),
            JointAugment::new(&AugmentSection::default(), options.seed),
        );
        TileSampler::new(Arc::new(loader), tiles, options)
    }

    fn options(seed: Option<u64>, max_skip_ratio: f32) -> SamplerOptions {
        SamplerOptions {
            shuffle: true,
            seed,
            max_skip_ratio,
            workers: 2,
            queue_depth: 2,
            log_every: None,
        }
    }

    fn dataset(root: &Path, n: u32) -> Vec<TileId> {
        (0..n)
            .map(|x| {
                let tile = TileId::new(6, x, 1).unwrap();
                write(root, "images", tile, x as u8);
                write(root, "labels", tile, (x % 2) as u8);
                tile
            })
            .collect()
    }

    #[test]
    fn epochs_cover_every_tile_once_and_restart() {
        let tmp = tempfile::tempdir().unwrap();
        let tiles = dataset(tmp.path(), 6);
        let mut s = sampler(tmp.path(), tiles.clone(), options(Some(3), 0.0));
        assert_eq!(s.state(), SamplerState::Idle);
        for expected_epoch in 0..2 {
            let epoch = s.start_epoch();
            assert_eq!(epoch, expected_epoch);
            let mut seen = Vec::new();
            while let Some(pair) = s.next_pair().unwrap() {
                assert_eq!(pair.input.band(0)[0] as u32, pair.tile.x);
                assert_eq!(pair.label.data[0] as u32, pair.tile.x % 2);
                seen.push(pair.tile);
            }
            assert_eq!(s.state(), SamplerState::Exhausted);
            assert!(s.next_pair().unwrap().is_none());
            seen.sort();
            assert_eq!(seen, tiles);
            assert_eq!(s.report().unwrap().produced, 6);
        }
    }

    #[test]
    fn seeded_order_is_reproducible() {
        let tmp = tempfile::tempdir().unwrap();
        let tiles = dataset(tmp.path(), 12);
        let a = sampler(tmp.path(), tiles.clone(), options(Some(9), 0.0));
        let b = sampler(tmp.path(), tiles, options(Some(9), 0.0));
        assert_eq!(a.schedule(4), b.schedule(4));
        assert_ne!(a.schedule(4), a.schedule(5));
    }

    #[test]
    fn missing_tiles_are_skipped_until_the_ratio_is_exceeded() {
        let tmp = tempfile::tempdir().unwrap();
        let mut tiles = dataset(tmp.path(), 4);
        tiles.push(TileId::new(6, 40, 1).unwrap());

        let mut lenient = sampler(tmp.path(), tiles.clone(), options(None, 0.5));
        let mut count = 0;
        while lenient.next_pair().unwrap().is_some() {
            count += 1;
        }
        assert_eq!(count, 4);
        assert_eq!(lenient.report().unwrap().skipped, 1);

        let mut strict = sampler(tmp.path(), tiles, options(None, 0.1));
        let err = loop {
            match strict.next_pair() {
                Ok(Some(_)) => continue,
                Ok(None) => panic!("epoch should have failed"),
                Err(e) => break e,
            }
        };
        assert!(matches!(err, TileDatasetError::TooManySkipped { skipped: 1, scheduled: 5, .. }));
        assert_eq!(strict.state(), SamplerState::Exhausted);
        let report = strict.report().unwrap();
        assert_eq!(report.outcome(), crate::validation::ValidationOutcome::Fail);
        assert_eq!(report.examples[0].tile, TileId::new(6, 40, 1).unwrap());
        assert!(strict.next_pair().unwrap().is_none());
    }

    #[test]
    fn batches_preserve_draw_order() {
        let tmp = tempfile::tempdir().unwrap();
        let tiles = dataset(tmp.path(), 7);
        let mut s = sampler(tmp.path(), tiles, options(Some(1), 0.0));
        let epoch = s.start_epoch();
        let order = s.schedule(epoch);
        let mut drawn = Vec::new();
        while let Some(batch) = s.next_batch(3).unwrap() {
            assert!(batch.len() <= 3);
            drawn.extend(batch.into_iter().map(|p| p.tile));
        }
        assert_eq!(drawn, order);
    }

    #[test]
    fn fatal_errors_are_not_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        let tiles = dataset(tmp.path(), 2);
        write(tmp.path(), "labels", tiles[1], 7);
        let mut s = sampler(tmp.path(), tiles, options(None, 1.0));
        let failure = (0..3).map(|_| s.next_pair()).find(|r| r.is_err());
        assert!(matches!(failure, Some(Err(TileDatasetError::LabelMapping { .. }))));
        assert_eq!(s.state(), SamplerState::Exhausted);
    }
}
