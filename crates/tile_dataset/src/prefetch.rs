//! Prefetching epochs: a worker pool loads pairs ahead of the consumer.
//!
//! Workers pull tile ids from a shared work channel and push results into a
//! bounded queue of `queue_depth` slots, blocking while it is full. Dropping or
//! cancelling the epoch raises a flag, drops the queue and joins every worker.

use crate::sampler::{TilePair, TileSampler};
use crate::types::{DatasetResult, TileDatasetError};
use crossbeam_channel::{bounded, unbounded, Receiver};
use data_contracts::TileId;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

type Loaded = (TileId, DatasetResult<TilePair>);

pub struct PrefetchEpoch<'a> {
    sampler: &'a mut TileSampler,
    rx: Option<Receiver<Loaded>>,
    cancel: Arc<AtomicBool>,
    handles: Vec<thread::JoinHandle<()>>,
    remaining: usize,
    done: bool,
}

impl TileSampler {
    /// Start the next epoch on the worker pool. Order across workers is not
    /// deterministic; use [`TileSampler::next_pair`] when it must be.
    pub fn prefetch(&mut self) -> PrefetchEpoch<'_> {
        let epoch = self.start_epoch();
        let tiles = self.take_remaining();
        let workers = self.options.workers.max(1);
        let depth = self.options.queue_depth.max(1);

        let (work_tx, work_rx) = unbounded::<TileId>();
        for tile in &tiles {
            // Receiver is alive; sending cannot fail.
            let _ = work_tx.send(*tile);
        }
        drop(work_tx);

        let (tx, rx) = bounded::<Loaded>(depth);
        let cancel = Arc::new(AtomicBool::new(false));
        let mut handles = Vec::with_capacity(workers);
        for _ in 0..workers {
            let work_rx = work_rx.clone();
            let tx = tx.clone();
            let cancel = cancel.clone();
            let loader = self.loader.clone();
            handles.push(thread::spawn(move || loop {
                if cancel.load(Ordering::Relaxed) {
                    break;
                }
                let Ok(tile) = work_rx.recv() else { break };
                let result = loader.load(tile, epoch);
                if cancel.load(Ordering::Relaxed) {
                    break;
                }
                // Consumer gone.
                if tx.send((tile, result)).is_err() {
                    break;
                }
            }));
        }
        drop(tx);
        tracing::debug!(epoch, workers, queue_depth = depth, "prefetch workers started");

        PrefetchEpoch {
            sampler: self,
            rx: Some(rx),
            cancel,
            handles,
            remaining: tiles.len(),
            done: false,
        }
    }
}

impl PrefetchEpoch<'_> {
    /// Stop loading, discard queued pairs and end the epoch.
    pub fn cancel(&mut self) {
        if !self.done {
            tracing::info!(epoch = self.sampler.epoch(), remaining = self.remaining, "epoch cancelled");
            self.sampler.abort_epoch();
            self.done = true;
        }
        self.shutdown();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    /// Tiles not yet delivered, skipped or failed.
    pub fn remaining(&self) -> usize {
        self.remaining
    }

    fn shutdown(&mut self) {
        self.cancel.store(true, Ordering::Relaxed);
        // Unblocks workers waiting on a full queue.
        self.rx.take();
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                tracing::error!("prefetch worker panicked");
            }
        }
    }
}

impl Iterator for PrefetchEpoch<'_> {
    type Item = DatasetResult<TilePair>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            if self.remaining == 0 {
                self.done = true;
                self.shutdown();
                self.sampler.finish_epoch();
                return None;
            }
            let received = match &self.rx {
                Some(rx) => rx.recv().ok(),
                None => None,
            };
            let Some((tile, result)) = received else {
                // Every worker exited with tiles still outstanding.
                self.done = true;
                self.shutdown();
                self.sampler.abort_epoch();
                return Some(Err(TileDatasetError::Cancelled));
            };
            self.remaining -= 1;
            match result {
                Ok(pair) => {
                    self.sampler.record_produced(1);
                    return Some(Ok(pair));
                }
                Err(e) => {
                    if let Err(fatal) = self.sampler.handle_failure(tile, e) {
                        self.done = true;
                        self.shutdown();
                        return Some(Err(fatal));
                    }
                }
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.remaining))
    }
}

impl Drop for PrefetchEpoch<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.sampler.abort_epoch();
            self.done = true;
        }
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aug::JointAugment;
    use crate::channels::resolve_channels;
    use crate::classes::ClassRegistry;
    use crate::compose::ChannelCompositor;
    use crate::labels::{LabelEncoding, LabelRasterizer, RasterLabels};
    use crate::sampler::{PairLoader, SamplerOptions, SamplerState};
    use data_contracts::{AugmentSection, ChannelBlock, ClassBlock};
    use image::{GrayImage, Luma};
    use std::path::Path;

    fn build(root: &Path, n: u32, missing: u32, max_skip_ratio: f32, queue_depth: usize) -> TileSampler {
        let mut tiles = Vec::new();
        for x in 0..n + missing {
            let tile = TileId::new(8, x, 3).unwrap();
            tiles.push(tile);
            if x >= n {
                continue;
            }
            for sub in ["images", "labels"] {
                let path = root.join(sub).join(tile.relative_path("png"));
                std::fs::create_dir_all(path.parent().unwrap()).unwrap();
                GrayImage::from_pixel(2, 2, Luma([0])).save(path).unwrap();
            }
        }
        let channels = resolve_channels(&[ChannelBlock {
            sub: "images".into(),
            bands: vec![1],
            mean: vec![0.0],
            std: vec![1.0],
        }])
        .unwrap();
        let classes = Arc::new(
            ClassRegistry::build(&[ClassBlock {
                title: "background".into(),
                color: "black".into(),
                query: None,
            }])
            .unwrap(),
        );
        let loader = PairLoader::new(
            ChannelCompositor::new(root, 2),
            channels,
            LabelRasterizer::new(
                Arc::new(RasterLabels::new(root, "labels", LabelEncoding::Index)),
                classes,
                2,
            ),
            JointAugment::new(&AugmentSection::default(), None),
        );
        let options = SamplerOptions {
            shuffle: true,
            seed: Some(5),
            max_skip_ratio,
            workers: 3,
            queue_depth,
            log_every: None,
        };
        TileSampler::new(Arc::new(loader), tiles, options)
    }

    #[test]
    fn prefetch_delivers_every_tile_once() {
        let tmp = tempfile::tempdir().unwrap();
        let mut sampler = build(tmp.path(), 10, 0, 0.0, 2);
        for _ in 0..2 {
            let mut seen: Vec<TileId> = sampler.prefetch().map(|r| r.unwrap().tile).collect();
            seen.sort();
            seen.dedup();
            assert_eq!(seen.len(), 10);
            assert_eq!(sampler.state(), SamplerState::Exhausted);
            assert_eq!(sampler.report().unwrap().produced, 10);
        }
        assert_eq!(sampler.epoch(), 1);
    }

    #[test]
    fn dropping_mid_epoch_joins_blocked_workers() {
        let tmp = tempfile::tempdir().unwrap();
        let mut sampler = build(tmp.path(), 20, 0, 0.0, 1);
        {
            let mut epoch = sampler.prefetch();
            assert!(epoch.next().unwrap().is_ok());
        }
        assert_eq!(sampler.state(), SamplerState::Exhausted);

        let mut epoch = sampler.prefetch();
        epoch.cancel();
        assert!(epoch.is_cancelled());
        assert!(epoch.next().is_none());
    }

    #[test]
    fn skip_policy_matches_sequential_iteration() {
        let tmp = tempfile::tempdir().unwrap();
        let mut lenient = build(tmp.path(), 9, 1, 0.2, 4);
        let results: Vec<_> = lenient.prefetch().collect();
        assert_eq!(results.len(), 9);
        assert!(results.iter().all(|r| r.is_ok()));
        assert_eq!(lenient.report().unwrap().skipped, 1);

        let mut strict = build(tmp.path(), 9, 1, 0.0, 4);
        let results: Vec<_> = strict.prefetch().collect();
        assert!(matches!(
            results.last(),
            Some(Err(TileDatasetError::TooManySkipped { .. }))
        ));
        assert_eq!(strict.state(), SamplerState::Exhausted);
    }
}
