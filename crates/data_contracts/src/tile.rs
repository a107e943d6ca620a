use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

/// Deepest zoom level accepted for slippy-map tiles.
pub const MAX_ZOOM: u8 = 30;

/// Slippy-map tile coordinate. Ordering is `(z, x, y)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TileId {
    pub z: u8,
    pub x: u32,
    pub y: u32,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TileParseError {
    #[error("expected {expected}, got {raw:?}")]
    Shape { expected: &'static str, raw: String },
    #[error("invalid tile coordinate component {raw:?}")]
    Component { raw: String },
    #[error("tile {x}/{y} out of range for zoom {z}")]
    OutOfRange { z: u8, x: u32, y: u32 },
    #[error("cover line {line}: {source}")]
    Cover {
        line: usize,
        #[source]
        source: Box<TileParseError>,
    },
}

/// Geographic extent of a tile in WGS84 degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LngLatBounds {
    pub west: f64,
    pub south: f64,
    pub east: f64,
    pub north: f64,
}

impl TileId {
    pub fn new(z: u8, x: u32, y: u32) -> Result<Self, TileParseError> {
        if z > MAX_ZOOM {
            return Err(TileParseError::OutOfRange { z, x, y });
        }
        let side = 1u64 << z;
        if u64::from(x) >= side || u64::from(y) >= side {
            return Err(TileParseError::OutOfRange { z, x, y });
        }
        Ok(Self { z, x, y })
    }

    /// Path of this tile under a sub-directory, without extension: `z/x/y`.
    pub fn relative_stem(&self) -> PathBuf {
        Path::new(&self.z.to_string())
            .join(self.x.to_string())
            .join(self.y.to_string())
    }

    /// Path of this tile under a sub-directory with the given extension.
    pub fn relative_path(&self, ext: &str) -> PathBuf {
        Path::new(&self.z.to_string())
            .join(self.x.to_string())
            .join(format!("{}.{ext}", self.y))
    }

    /// A 64-bit key mixing all three components, used to derive per-tile seeds.
    pub fn key(&self) -> u64 {
        (u64::from(self.z) << 58) ^ (u64::from(self.x) << 29) ^ u64::from(self.y)
    }

    pub fn bounds(&self) -> LngLatBounds {
        let n = (1u64 << self.z) as f64;
        let lon = |x: f64| x / n * 360.0 - 180.0;
        let lat = |y: f64| {
            let r = std::f64::consts::PI * (1.0 - 2.0 * y / n);
            r.sinh().atan().to_degrees()
        };
        LngLatBounds {
            west: lon(self.x as f64),
            south: lat(self.y as f64 + 1.0),
            east: lon(self.x as f64 + 1.0),
            north: lat(self.y as f64),
        }
    }
}

impl fmt::Display for TileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.z, self.x, self.y)
    }
}

fn component<T: FromStr>(raw: &str) -> Result<T, TileParseError> {
    raw.trim().parse().map_err(|_| TileParseError::Component {
        raw: raw.to_string(),
    })
}

impl FromStr for TileId {
    type Err = TileParseError;

    /// Parses the `z/x/y` form produced by `Display`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('/').collect();
        let [z, x, y] = parts.as_slice() else {
            return Err(TileParseError::Shape {
                expected: "z/x/y",
                raw: s.to_string(),
            });
        };
        TileId::new(component(z)?, component(x)?, component(y)?)
    }
}

/// Parse a cover listing: one `x,y,z` row per tile. Blank lines are skipped.
pub fn parse_cover(text: &str) -> Result<Vec<TileId>, TileParseError> {
    let mut tiles = Vec::new();
    for (i, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let parse_row = || -> Result<TileId, TileParseError> {
            let parts: Vec<&str> = line.split(',').collect();
            let [x, y, z] = parts.as_slice() else {
                return Err(TileParseError::Shape {
                    expected: "x,y,z",
                    raw: line.to_string(),
                });
            };
            TileId::new(component(z)?, component(x)?, component(y)?)
        };
        let tile = parse_row().map_err(|e| TileParseError::Cover {
            line: i + 1,
            source: Box::new(e),
        })?;
        tiles.push(tile);
    }
    Ok(tiles)
}
