//! Label rasterization.
//!
//! A [`LabelSource`] yields the raw label pixels for a tile; the
//! [`LabelRasterizer`] maps them to class indices through the class registry.
//! Two sources exist: pre-rendered rasters on disk ([`RasterLabels`]) and
//! rasters burnt from PostGIS geometries on demand ([`PostgisLabels`]).

use crate::classes::{ClassRegistry, LabelValue};
use crate::compose::check_geometry;
use crate::raster::locate_tile;
use crate::types::{DatasetResult, LabelTensor, TileDatasetError};
use crate::wkb::decode_wkb_raster;
use data_contracts::{ConfigError, TileId};
use image::DynamicImage;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawLabels {
    Rgb(Vec<[u8; 3]>),
    Raw(Vec<u32>),
}

impl RawLabels {
    pub fn len(&self) -> usize {
        match self {
            RawLabels::Rgb(v) => v.len(),
            RawLabels::Raw(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn value(&self, i: usize) -> LabelValue {
        match self {
            RawLabels::Rgb(v) => LabelValue::Rgb(v[i]),
            RawLabels::Raw(v) => LabelValue::Raw(v[i]),
        }
    }
}

/// Raw label pixels for one tile, row-major.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelRaster {
    pub width: u32,
    pub height: u32,
    pub values: RawLabels,
}

pub trait LabelSource: Send + Sync {
    fn load(&self, tile: TileId) -> DatasetResult<LabelRaster>;

    /// Sub-directory that must hold a label file for a tile to be usable, if any.
    fn required_sub(&self) -> Option<&str> {
        None
    }

    fn describe(&self) -> String;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelEncoding {
    /// Pixels carry class colors; paletted files decode to their colors.
    Color,
    /// Single-band pixels carry the class index.
    Index,
}

impl From<data_contracts::LabelEncodingKind> for LabelEncoding {
    fn from(kind: data_contracts::LabelEncodingKind) -> Self {
        match kind {
            data_contracts::LabelEncodingKind::Color => LabelEncoding::Color,
            data_contracts::LabelEncodingKind::Index => LabelEncoding::Index,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RasterLabels {
    root: PathBuf,
    sub: String,
    encoding: LabelEncoding,
}

impl RasterLabels {
    pub fn new(root: impl Into<PathBuf>, sub: impl Into<String>, encoding: LabelEncoding) -> Self {
        Self {
            root: root.into(),
            sub: sub.into(),
            encoding,
        }
    }

    fn decode(&self, path: &Path, img: DynamicImage) -> DatasetResult<LabelRaster> {
        let (width, height) = (img.width(), img.height());
        let values = match self.encoding {
            LabelEncoding::Color => {
                RawLabels::Rgb(img.to_rgb8().pixels().map(|p| p.0).collect())
            }
            LabelEncoding::Index => match img {
                DynamicImage::ImageLuma8(b) => {
                    RawLabels::Raw(b.pixels().map(|p| u32::from(p.0[0])).collect())
                }
                DynamicImage::ImageLuma16(b) => {
                    RawLabels::Raw(b.pixels().map(|p| u32::from(p.0[0])).collect())
                }
                other => {
                    return Err(TileDatasetError::Image {
                        path: path.to_path_buf(),
                        source: image::ImageError::Unsupported(
                            image::error::UnsupportedError::from_format_and_kind(
                                image::error::ImageFormatHint::Unknown,
                                image::error::UnsupportedErrorKind::Color(other.color().into()),
                            ),
                        ),
                    });
                }
            },
        };
        Ok(LabelRaster {
            width,
            height,
            values,
        })
    }
}

impl LabelSource for RasterLabels {
    fn load(&self, tile: TileId) -> DatasetResult<LabelRaster> {
        let missing = || TileDatasetError::MissingTile {
            tile,
            sub: self.sub.clone(),
        };
        let path = locate_tile(&self.root, &self.sub, tile).ok_or_else(missing)?;
        let img = match image::open(&path) {
            Ok(img) => img,
            Err(image::ImageError::IoError(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(missing());
            }
            Err(image::ImageError::IoError(source)) => {
                return Err(TileDatasetError::Io { path, source });
            }
            Err(source) => return Err(TileDatasetError::Image { path, source }),
        };
        self.decode(&path, img)
    }

    fn required_sub(&self) -> Option<&str> {
        Some(&self.sub)
    }

    fn describe(&self) -> String {
        format!("raster labels under {} ({:?})", self.root.join(&self.sub).display(), self.encoding)
    }
}

/// Database collaborator for on-the-fly label rasters. Implementations own the
/// connection (built from `dataset.pg_dsn`) and must be shareable across workers.
pub trait SpatialStore: Send + Sync {
    /// Run `sql`, a single-row `SELECT ST_Srid(..)`, and return the SRID.
    fn fetch_srid(&self, sql: &str) -> Result<i32, String>;

    /// First column of the first row as bytes, `None` when no row came back.
    fn fetch_raster(&self, sql: &str) -> Result<Option<Vec<u8>>, String>;
}

#[derive(Debug, Clone)]
struct BurnLayer {
    class: u8,
    sql: String,
    srid: i32,
}

/// Labels burnt from per-class feature queries. Layers are burnt in declared
/// class order and a later class overwrites an earlier one on shared pixels.
pub struct PostgisLabels {
    store: Arc<dyn SpatialStore>,
    layers: Vec<BurnLayer>,
    tile_size: u32,
}

impl PostgisLabels {
    /// Resolve the SRID of every class query up front so a broken query fails
    /// before any tile is drawn.
    pub fn connect(
        store: Arc<dyn SpatialStore>,
        classes: &ClassRegistry,
        tile_size: u32,
    ) -> Result<Self, ConfigError> {
        let mut layers = Vec::new();
        for class in classes.iter() {
            let Some(sql) = class.query.as_deref() else {
                continue;
            };
            let section = format!("classes[{}]", class.index);
            if class.index == 0 {
                return Err(ConfigError::invalid(
                    section,
                    "the background class cannot carry a query",
                ));
            }
            let srid_sql = format!("SELECT ST_Srid(geom) AS srid FROM ({sql} LIMIT 1) AS sub");
            let srid = store.fetch_srid(&srid_sql).map_err(|e| {
                ConfigError::invalid(section.clone(), format!("unable to resolve geometry SRID: {e}"))
            })?;
            layers.push(BurnLayer {
                class: class.index,
                sql: sql.to_string(),
                srid,
            });
        }
        if layers.is_empty() {
            return Err(ConfigError::invalid("classes", "no class carries a query"));
        }
        Ok(Self {
            store,
            layers,
            tile_size,
        })
    }
}

impl LabelSource for PostgisLabels {
    fn load(&self, tile: TileId) -> DatasetResult<LabelRaster> {
        let size = self.tile_size;
        let mut out = vec![0u32; size as usize * size as usize];
        for layer in &self.layers {
            let sql = tile_raster_query(&layer.sql, layer.srid, tile, size, layer.class);
            let bytes = self
                .store
                .fetch_raster(&sql)
                .map_err(|msg| TileDatasetError::Query { tile, msg })?;
            let Some(bytes) = bytes else { continue };
            let raster = decode_wkb_raster(&bytes)?;
            let (w, h) = (u32::from(raster.width), u32::from(raster.height));
            check_geometry(tile, "postgis", Path::new(&layer.sql), w, h, size)?;
            let Some(band) = raster.bands.first() else {
                continue;
            };
            let burn = f64::from(layer.class);
            for (dst, v) in out.iter_mut().zip(&band.values) {
                if (v - burn).abs() < 0.5 {
                    *dst = u32::from(layer.class);
                }
            }
        }
        Ok(LabelRaster {
            width: size,
            height: size,
            values: RawLabels::Raw(out),
        })
    }

    fn describe(&self) -> String {
        format!("postgis labels ({} class queries)", self.layers.len())
    }
}

/// SQL rendering one class layer for a tile as a WKB raster in web mercator.
pub fn tile_raster_query(
    feature_sql: &str,
    srid: i32,
    tile: TileId,
    tile_size: u32,
    burn: u8,
) -> String {
    let b = tile.bounds();
    let (w, s, e, n) = (b.west, b.south, b.east, b.north);
    format!(
        "WITH
  bbox AS (SELECT ST_Transform(ST_MakeEnvelope({w}, {s}, {e}, {n}, 4326), {srid}) AS bbox),
  bbox_merc AS (SELECT ST_Transform(ST_MakeEnvelope({w}, {s}, {e}, {n}, 4326), 3857) AS bbox),
  rast_a AS (
    SELECT ST_AddBand(
      ST_SetSRID(
        ST_MakeEmptyRaster({tile_size}, {tile_size}, ST_XMin(bbox), ST_YMax(bbox),
                           (ST_YMax(bbox) - ST_YMin(bbox)) / {tile_size}),
        3857),
      '8BUI'::text, 0) AS rast
    FROM bbox_merc),
  features AS (
    SELECT ST_Union(ST_Transform(ST_Force2D(geom), 3857)) AS geom
    FROM ({feature_sql}) AS sub, bbox
    WHERE ST_Intersects(geom, bbox)),
  rast_b AS (
    SELECT ST_AsRaster(geom, rast, '8BUI', {burn}) AS rast
    FROM features, rast_a
    WHERE NOT ST_IsEmpty(geom))
SELECT ST_AsBinary(ST_MapAlgebra(rast_a.rast, rast_b.rast, '{burn}', NULL, 'FIRST')) AS wkb
FROM rast_a, rast_b"
    )
}

pub struct LabelRasterizer {
    source: Arc<dyn LabelSource>,
    classes: Arc<ClassRegistry>,
    tile_size: u32,
}

impl LabelRasterizer {
    pub fn new(source: Arc<dyn LabelSource>, classes: Arc<ClassRegistry>, tile_size: u32) -> Self {
        Self {
            source,
            classes,
            tile_size,
        }
    }

    pub fn source(&self) -> &dyn LabelSource {
        self.source.as_ref()
    }

    pub fn rasterize(&self, tile: TileId) -> DatasetResult<LabelTensor> {
        let raw = self.source.load(tile)?;
        let sub = self.source.required_sub().unwrap_or("labels");
        check_geometry(tile, sub, Path::new(sub), raw.width, raw.height, self.tile_size)?;
        let mut data = Vec::with_capacity(raw.values.len());
        for i in 0..raw.values.len() {
            let value = raw.values.value(i);
            let index = self.classes.index_of(value).ok_or_else(|| {
                tracing::error!(tile = %tile, value = %value, "unmapped label value");
                TileDatasetError::LabelMapping {
                    tile,
                    value: value.to_string(),
                }
            })?;
            data.push(index);
        }
        Ok(LabelTensor {
            size: self.tile_size,
            data,
        })
    }
}
