//! Per-epoch accounting of skipped tiles and the skip threshold.

use crate::index::MAX_EXCLUSION_EXAMPLES;
use crate::types::{DatasetResult, TileDatasetError, TileNote};
use data_contracts::TileId;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValidationOutcome {
    Pass,
    Warn,
    Fail,
}

impl ValidationOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationOutcome::Pass => "pass",
            ValidationOutcome::Warn => "warn",
            ValidationOutcome::Fail => "fail",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochReport {
    pub epoch: u64,
    pub scheduled: usize,
    pub produced: usize,
    pub skipped: usize,
    pub max_skip_ratio: f32,
    /// First few skipped tiles with their errors.
    pub examples: Vec<TileNote>,
}

impl EpochReport {
    pub fn new(epoch: u64, scheduled: usize, max_skip_ratio: f32) -> Self {
        Self {
            epoch,
            scheduled,
            produced: 0,
            skipped: 0,
            max_skip_ratio,
            examples: Vec::new(),
        }
    }

    pub fn record_produced(&mut self) {
        self.produced += 1;
    }

    /// Count a recoverable failure. Fails once the skip count exceeds
    /// `max_skip_ratio × scheduled`.
    pub fn record_skip(&mut self, tile: TileId, err: &TileDatasetError) -> DatasetResult<()> {
        self.skipped += 1;
        tracing::debug!(epoch = self.epoch, tile = %tile, error = %err, "skipping tile");
        if self.examples.len() < MAX_EXCLUSION_EXAMPLES {
            self.examples.push(TileNote {
                tile,
                reason: err.to_string(),
            });
        }
        if self.over_threshold() {
            tracing::error!(
                epoch = self.epoch,
                skipped = self.skipped,
                scheduled = self.scheduled,
                max_skip_ratio = self.max_skip_ratio,
                "skip ratio exceeded"
            );
            return Err(TileDatasetError::TooManySkipped {
                epoch: self.epoch,
                skipped: self.skipped,
                scheduled: self.scheduled,
                max_ratio: self.max_skip_ratio,
            });
        }
        Ok(())
    }

    pub fn over_threshold(&self) -> bool {
        self.skipped as f64 > f64::from(self.max_skip_ratio) * self.scheduled as f64
    }

    pub fn skip_ratio(&self) -> f32 {
        self.skipped as f32 / self.scheduled.max(1) as f32
    }

    /// Every scheduled tile was either produced or skipped.
    pub fn is_complete(&self) -> bool {
        self.produced + self.skipped >= self.scheduled
    }

    pub fn outcome(&self) -> ValidationOutcome {
        if self.over_threshold() {
            ValidationOutcome::Fail
        } else if self.skipped > 0 {
            ValidationOutcome::Warn
        } else {
            ValidationOutcome::Pass
        }
    }

    /// Emit the end-of-epoch summary.
    pub fn log(&self) {
        let examples: Vec<String> = self.examples.iter().map(|n| n.tile.to_string()).collect();
        match self.outcome() {
            ValidationOutcome::Pass => tracing::info!(
                epoch = self.epoch,
                scheduled = self.scheduled,
                produced = self.produced,
                complete = self.is_complete(),
                "epoch complete"
            ),
            outcome => tracing::warn!(
                epoch = self.epoch,
                scheduled = self.scheduled,
                produced = self.produced,
                skipped = self.skipped,
                complete = self.is_complete(),
                outcome = outcome.as_str(),
                examples = ?examples,
                "epoch complete with skipped tiles"
            ),
        }
    }
}
