//! Training configuration file schema.
//!
//! The file is TOML with `[dataset]`, `[[classes]]`, `[[channels]]`, `[model]`,
//! `[train]` and an optional `[sampler]` section. Class and channel blocks are
//! kept as declared; their semantic validation happens where they are resolved
//! (class registry, channel resolver). This module only checks what it owns.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

const DEFAULT_LABEL_SUB: &str = "labels";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("toml parse error at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid configuration in {section}: {msg}")]
    Invalid { section: String, msg: String },
}

impl ConfigError {
    pub fn invalid(section: impl Into<String>, msg: impl Into<String>) -> Self {
        ConfigError::Invalid {
            section: section.into(),
            msg: msg.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LabelSourceKind {
    /// Pre-rendered label rasters under `dataset.label_sub`.
    #[default]
    Raster,
    /// Labels burnt on the fly from PostGIS geometries.
    Postgis,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LabelEncodingKind {
    /// Pixels carry the class display color.
    #[default]
    Color,
    /// Single-band pixels carry the class index.
    Index,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatasetSection {
    pub path: PathBuf,
    pub pg_dsn: Option<String>,
    #[serde(default = "default_label_sub")]
    pub label_sub: String,
    #[serde(default)]
    pub label_source: LabelSourceKind,
    #[serde(default)]
    pub label_encoding: LabelEncodingKind,
    /// Optional `x,y,z` cover file restricting the tiles used.
    pub cover: Option<PathBuf>,
}

fn default_label_sub() -> String {
    DEFAULT_LABEL_SUB.to_string()
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ClassBlock {
    pub title: String,
    pub color: String,
    /// Feature query burnt with this class index (postgis label source only).
    #[serde(default)]
    pub query: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ChannelBlock {
    pub sub: String,
    pub bands: Vec<i64>,
    pub mean: Vec<f32>,
    pub std: Vec<f32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelSection {
    pub tile_size: u32,
    /// Everything else is opaque to the data layer.
    #[serde(flatten)]
    pub extra: toml::Table,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct AugmentSection {
    pub flip_horizontal_prob: f32,
    pub flip_vertical_prob: f32,
    pub rotate_prob: f32,
}

impl Default for AugmentSection {
    fn default() -> Self {
        Self {
            flip_horizontal_prob: 0.0,
            flip_vertical_prob: 0.0,
            rotate_prob: 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SamplerSection {
    pub workers: usize,
    pub queue_depth: usize,
    pub shuffle: bool,
    pub seed: Option<u64>,
    pub max_skip_ratio: f32,
    pub augment: AugmentSection,
}

impl Default for SamplerSection {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_depth: 8,
            shuffle: true,
            seed: None,
            max_skip_ratio: 0.05,
            augment: AugmentSection::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TrainingConfig {
    pub dataset: DatasetSection,
    pub classes: Vec<ClassBlock>,
    pub channels: Vec<ChannelBlock>,
    pub model: ModelSection,
    #[serde(default)]
    pub train: toml::Table,
    #[serde(default)]
    pub sampler: SamplerSection,
}

impl TrainingConfig {
    /// Load and check a configuration file. Relative `dataset.path` and
    /// `dataset.cover` are resolved against the file's directory.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        Self::parse(&raw, path, base)
    }

    /// Parse configuration text; `base` anchors relative paths.
    pub fn from_toml_str(raw: &str, base: &Path) -> Result<Self, ConfigError> {
        Self::parse(raw, Path::new("<inline>"), base)
    }

    fn parse(raw: &str, origin: &Path, base: &Path) -> Result<Self, ConfigError> {
        let mut cfg: TrainingConfig = toml::from_str(raw).map_err(|e| ConfigError::Parse {
            path: origin.to_path_buf(),
            source: e,
        })?;
        cfg.dataset.path = anchor(base, expand_path(&cfg.dataset.path.to_string_lossy()));
        cfg.dataset.cover = cfg
            .dataset
            .cover
            .take()
            .map(|c| anchor(base, expand_path(&c.to_string_lossy())));
        cfg.validate()?;
        Ok(cfg)
    }

    /// Section-level checks. Class and channel blocks are checked when resolved.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.dataset.path.as_os_str().is_empty() {
            return Err(ConfigError::invalid("dataset", "path is empty"));
        }
        if self.dataset.label_sub.trim().is_empty() {
            return Err(ConfigError::invalid("dataset", "label_sub is empty"));
        }
        if self.dataset.label_source == LabelSourceKind::Postgis {
            if self
                .dataset
                .pg_dsn
                .as_deref()
                .is_none_or(|dsn| dsn.trim().is_empty())
            {
                return Err(ConfigError::invalid(
                    "dataset",
                    "label_source = \"postgis\" requires pg_dsn",
                ));
            }
            if !self.classes.iter().any(|c| c.query.is_some()) {
                return Err(ConfigError::invalid(
                    "classes",
                    "label_source = \"postgis\" requires at least one class query",
                ));
            }
        }
        if self.model.tile_size == 0 {
            return Err(ConfigError::invalid("model", "tile_size must be positive"));
        }
        let s = &self.sampler;
        if s.workers == 0 {
            return Err(ConfigError::invalid("sampler", "workers must be at least 1"));
        }
        if s.queue_depth == 0 {
            return Err(ConfigError::invalid("sampler", "queue_depth must be at least 1"));
        }
        check_probability("sampler", "max_skip_ratio", s.max_skip_ratio)?;
        check_probability("sampler.augment", "flip_horizontal_prob", s.augment.flip_horizontal_prob)?;
        check_probability("sampler.augment", "flip_vertical_prob", s.augment.flip_vertical_prob)?;
        check_probability("sampler.augment", "rotate_prob", s.augment.rotate_prob)?;
        Ok(())
    }
}

fn check_probability(section: &str, key: &str, value: f32) -> Result<(), ConfigError> {
    if !(0.0..=1.0).contains(&value) {
        return Err(ConfigError::invalid(
            section,
            format!("{key} must be within [0, 1], got {value}"),
        ));
    }
    Ok(())
}

fn anchor(base: &Path, path: PathBuf) -> PathBuf {
    if path.is_relative() {
        base.join(path)
    } else {
        path
    }
}

/// Expand a leading `~` and `${VAR}` references. Unknown variables are kept verbatim.
pub fn expand_path(raw: &str) -> PathBuf {
    let mut out = raw.to_string();
    if let Some(stripped) = out.strip_prefix('~') {
        if let Ok(home) = std::env::var("HOME") {
            out = format!("{home}{stripped}");
        }
    }
    PathBuf::from(expand_env(&out))
}

fn expand_env(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let key = &after[..end];
                match std::env::var(key) {
                    Ok(val) => out.push_str(&val),
                    Err(_) => out.push_str(&format!("${{{key}}}")),
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}
