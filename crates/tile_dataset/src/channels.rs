//! Channel block resolution.
//!
//! The declared order of channel blocks, and of bands inside each block, is the
//! channel axis of every input tensor. Nothing here reorders or deduplicates it.

use data_contracts::{ChannelBlock, ConfigError};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelSpec {
    pub sub: String,
    /// One-based band indices in the source raster.
    pub bands: Vec<usize>,
    pub mean: Vec<f32>,
    pub std: Vec<f32>,
}

impl ChannelSpec {
    pub fn len(&self) -> usize {
        self.bands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bands.is_empty()
    }

    pub fn normalize(&self, i: usize, raw: f32) -> f32 {
        (raw - self.mean[i]) / self.std[i]
    }

    pub fn denormalize(&self, i: usize, value: f32) -> f32 {
        value * self.std[i] + self.mean[i]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelSet {
    specs: Vec<ChannelSpec>,
}

impl ChannelSet {
    pub fn total_bands(&self) -> usize {
        self.specs.iter().map(ChannelSpec::len).sum()
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    pub fn get(&self, i: usize) -> Option<&ChannelSpec> {
        self.specs.get(i)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ChannelSpec> {
        self.specs.iter()
    }

    /// Offset of block `i` along the channel axis.
    pub fn band_offset(&self, i: usize) -> usize {
        self.specs.iter().take(i).map(ChannelSpec::len).sum()
    }

    /// Distinct sub-directories in first-seen order.
    pub fn required_subs(&self) -> Vec<String> {
        let mut subs: Vec<String> = Vec::new();
        for spec in &self.specs {
            if !subs.contains(&spec.sub) {
                subs.push(spec.sub.clone());
            }
        }
        subs
    }
}

pub fn resolve_channels(blocks: &[ChannelBlock]) -> Result<ChannelSet, ConfigError> {
    if blocks.is_empty() {
        return Err(ConfigError::invalid("channels", "at least one channel block is required"));
    }
    let specs = blocks
        .iter()
        .enumerate()
        .map(|(i, block)| resolve_block(i, block))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ChannelSet { specs })
}

fn resolve_block(i: usize, block: &ChannelBlock) -> Result<ChannelSpec, ConfigError> {
    let section = format!("channels[{i}]");
    let sub = block.sub.trim();
    if sub.is_empty() {
        return Err(ConfigError::invalid(section, "sub is empty"));
    }
    if block.bands.is_empty() {
        return Err(ConfigError::invalid(section, "bands is empty"));
    }
    let mut bands = Vec::with_capacity(block.bands.len());
    for &band in &block.bands {
        match usize::try_from(band) {
            Ok(b) if b >= 1 => bands.push(b),
            _ => {
                return Err(ConfigError::invalid(
                    section,
                    format!("band {band} is not a positive one-based index"),
                ))
            }
        }
    }
    if block.mean.len() != bands.len() {
        return Err(ConfigError::invalid(
            section,
            format!("mean has {} values for {} bands", block.mean.len(), bands.len()),
        ));
    }
    if block.std.len() != bands.len() {
        return Err(ConfigError::invalid(
            section,
            format!("std has {} values for {} bands", block.std.len(), bands.len()),
        ));
    }
    if let Some(m) = block.mean.iter().find(|m| !m.is_finite()) {
        return Err(ConfigError::invalid(section, format!("mean {m} is not finite")));
    }
    if let Some(s) = block.std.iter().find(|s| !s.is_finite() || **s <= 0.0) {
        return Err(ConfigError::invalid(
            section,
            format!("std {s} must be finite and strictly positive"),
        ));
    }
    Ok(ChannelSpec {
        sub: sub.to_string(),
        bands,
        mean: block.mean.clone(),
        std: block.std.clone(),
    })
}
