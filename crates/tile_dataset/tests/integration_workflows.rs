//! Integration tests for end-to-end tile_dataset workflows.
//!
//! These tests drive the pipeline from a TOML file on disk:
//! 1. Config → index → sampler epochs (sequential, batched, prefetched)
//! 2. Partial coverage across sources and cover files
//! 3. Configuration errors surfacing at construction
//! 4. PostGIS labels burnt through a spatial store handed to the pipeline

use data_contracts::{ConfigError, TileId, TrainingConfig};
use image::{GrayImage, Luma, Rgb, RgbImage};
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tile_dataset::{SamplerState, SpatialStore, TileDatasetError, TilePipeline};

const SIZE: u32 = 8;
const PALETTE: [[u8; 3]; 3] = [[0, 0, 0], [255, 0, 0], [0, 0, 255]];

/// Class of pixel `(x, y)`; asymmetric so every flip and rotation changes it.
fn class_at(tile: TileId, x: u32, y: u32) -> u8 {
    ((x + 2 * y + tile.x) % 3) as u8
}

fn write_tile(root: &Path, tile: TileId, subs: &[&str]) -> anyhow::Result<()> {
    for sub in subs {
        let path = root.join(sub).join(tile.relative_path("png"));
        fs::create_dir_all(path.parent().unwrap())?;
        match *sub {
            "labels" => {
                let img = RgbImage::from_fn(SIZE, SIZE, |x, y| Rgb(PALETTE[class_at(tile, x, y) as usize]));
                img.save(&path)?;
            }
            "images" => {
                let img = RgbImage::from_fn(SIZE, SIZE, |x, y| {
                    let c = class_at(tile, x, y) * 100;
                    Rgb([c, 7, 9])
                });
                img.save(&path)?;
            }
            _ => {
                GrayImage::from_pixel(SIZE, SIZE, Luma([42])).save(&path)?;
            }
        }
    }
    Ok(())
}

fn write_config(dir: &Path, extra_dataset: &str, sampler: &str) -> anyhow::Result<std::path::PathBuf> {
    let toml = format!(
        r##"
[dataset]
path = "data"
label_sub = "labels"
{extra_dataset}

[[classes]]
title = "background"
color = "black"

[[classes]]
title = "building"
color = "red"

[[classes]]
title = "water"
color = "#0000ff"

[[channels]]
sub = "images"
bands = [1, 2, 3]
mean = [0.0, 7.0, 9.0]
std = [1.0, 1.0, 1.0]

[[channels]]
sub = "dsm"
bands = [1]
mean = [40.0]
std = [2.0]

[model]
tile_size = {SIZE}
arch = "unet"

[train]
epochs = 3

[sampler]
{sampler}
"##
    );
    let path = dir.join("tileseg.toml");
    fs::write(&path, toml)?;
    Ok(path)
}

fn tiles(n: u32) -> Vec<TileId> {
    (0..n).map(|x| TileId::new(10, 300 + x, 400).unwrap()).collect()
}

#[test]
fn partial_sources_exclude_tiles_and_channels_sum_bands() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let root = tmp.path().join("data");
    let ids = tiles(3);
    // A and B everywhere; C is missing from dsm.
    write_tile(&root, ids[0], &["images", "dsm", "labels"])?;
    write_tile(&root, ids[1], &["images", "dsm", "labels"])?;
    write_tile(&root, ids[2], &["images", "labels"])?;

    let cfg = TrainingConfig::load(&write_config(tmp.path(), "", "seed = 1")?)?;
    let mut pipeline = TilePipeline::from_config(&cfg, None)?;
    assert_eq!(pipeline.index().size(), 2);
    assert_eq!(pipeline.index().excluded_count(), 1);
    assert_eq!(pipeline.index().exclusions()[0].tile, ids[2]);
    assert!(pipeline.index().exclusions()[0].reason.contains("dsm"));
    assert_eq!(pipeline.num_classes(), 3);
    assert_eq!(pipeline.color_of(2), Some([0, 0, 255]));
    assert_eq!(pipeline.title_of(1), Some("building"));
    assert_eq!(pipeline.model().extra.get("arch").and_then(|v| v.as_str()), Some("unet"));
    assert_eq!(pipeline.train().get("epochs").and_then(|v| v.as_integer()), Some(3));

    let sampler = pipeline.sampler();
    let mut seen = Vec::new();
    while let Some(pair) = sampler.next_pair()? {
        assert_eq!(pair.input.shape(), [4, SIZE as usize, SIZE as usize]);
        assert!(pair.input.band(1).iter().all(|v| v.abs() < 1e-6));
        assert!(pair.input.band(3).iter().all(|v| (*v - 1.0).abs() < 1e-6));
        seen.push(pair.tile);
    }
    seen.sort();
    assert_eq!(seen, ids[..2].to_vec());
    Ok(())
}

#[test]
fn augmentation_keeps_inputs_and_labels_aligned() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let root = tmp.path().join("data");
    for tile in tiles(6) {
        write_tile(&root, tile, &["images", "dsm", "labels"])?;
    }
    let sampler_cfg = r#"
seed = 17
workers = 2
queue_depth = 2
[sampler.augment]
flip_horizontal_prob = 0.5
flip_vertical_prob = 0.5
rotate_prob = 0.75
"#;
    let cfg = TrainingConfig::load(&write_config(tmp.path(), "", sampler_cfg)?)?;
    let mut pipeline = TilePipeline::from_config(&cfg, None)?;
    let sampler = pipeline.sampler();

    let mut transformed = 0;
    for _ in 0..3 {
        sampler.start_epoch();
        while let Some(batch) = sampler.next_batch(4)? {
            for pair in batch {
                transformed += usize::from(!pair.transforms.is_empty());
                for (value, class) in pair.input.band(0).iter().zip(&pair.label.data) {
                    assert_eq!(*value as u32, u32::from(*class) * 100, "{}", pair.tile);
                }
            }
        }
        assert_eq!(sampler.state(), SamplerState::Exhausted);
    }
    assert!(transformed > 0);
    Ok(())
}

#[test]
fn prefetch_epoch_matches_sequential_epoch() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let root = tmp.path().join("data");
    for tile in tiles(9) {
        write_tile(&root, tile, &["images", "dsm", "labels"])?;
    }
    let cfg = TrainingConfig::load(&write_config(tmp.path(), "", "workers = 3\nqueue_depth = 1")?)?;
    let mut pipeline = TilePipeline::from_config(&cfg, None)?;
    let sampler = pipeline.sampler();

    let mut sequential = Vec::new();
    while let Some(pair) = sampler.next_pair()? {
        sequential.push(pair.tile);
    }
    let mut prefetched = sampler
        .prefetch()
        .map(|r| r.map(|p| p.tile))
        .collect::<Result<Vec<_>, _>>()?;
    sequential.sort();
    prefetched.sort();
    assert_eq!(sequential, prefetched);
    assert_eq!(sampler.epoch(), 1);
    Ok(())
}

#[test]
fn tiles_removed_after_indexing_are_skipped_then_fatal() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let root = tmp.path().join("data");
    let ids = tiles(10);
    for tile in &ids {
        write_tile(&root, *tile, &["images", "dsm", "labels"])?;
    }
    let cfg = TrainingConfig::load(&write_config(tmp.path(), "", "max_skip_ratio = 0.1")?)?;
    let mut pipeline = TilePipeline::from_config(&cfg, None)?;
    fs::remove_file(root.join("dsm").join(ids[0].relative_path("png")))?;

    let sampler = pipeline.sampler();
    let mut produced = 0;
    while sampler.next_pair()?.is_some() {
        produced += 1;
    }
    assert_eq!(produced, 9);
    let report = sampler.report().unwrap();
    assert_eq!(report.skipped, 1);
    assert_eq!(report.examples[0].tile, ids[0]);

    fs::remove_file(root.join("images").join(ids[1].relative_path("png")))?;
    sampler.start_epoch();
    let err = loop {
        match sampler.next_pair() {
            Ok(Some(_)) => continue,
            Ok(None) => anyhow::bail!("expected the epoch to fail"),
            Err(e) => break e,
        }
    };
    assert!(matches!(err, TileDatasetError::TooManySkipped { skipped: 2, scheduled: 10, .. }));
    Ok(())
}

#[test]
fn cover_file_restricts_the_index() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let root = tmp.path().join("data");
    let ids = tiles(4);
    for tile in &ids {
        write_tile(&root, *tile, &["images", "dsm", "labels"])?;
    }
    fs::write(
        tmp.path().join("cover.csv"),
        format!("{},{},{}\n{},{},{}\n", ids[1].x, ids[1].y, ids[1].z, ids[3].x, ids[3].y, ids[3].z),
    )?;
    let cfg = TrainingConfig::load(&write_config(tmp.path(), r#"cover = "cover.csv""#, "")?)?;
    let pipeline = TilePipeline::from_config(&cfg, None)?;
    assert_eq!(pipeline.index().tile_ids().collect::<Vec<_>>(), vec![ids[1], ids[3]]);
    Ok(())
}

#[test]
fn configuration_errors_surface_at_construction() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let root = tmp.path().join("data");
    write_tile(&root, tiles(1)[0], &["images", "dsm", "labels"])?;

    let mut cfg = TrainingConfig::load(&write_config(tmp.path(), "", "")?)?;
    cfg.classes[2].title = "building".into();
    let err = TilePipeline::from_config(&cfg, None).err().unwrap();
    assert!(matches!(
        err,
        TileDatasetError::Config(ConfigError::Invalid { ref section, .. }) if section == "classes[2]"
    ));

    let mut cfg = TrainingConfig::load(&write_config(tmp.path(), "", "")?)?;
    cfg.channels[0].mean.pop();
    let err = TilePipeline::from_config(&cfg, None).err().unwrap();
    assert!(matches!(
        err,
        TileDatasetError::Config(ConfigError::Invalid { ref section, .. }) if section == "channels[0]"
    ));

    let cfg = TrainingConfig::load(&write_config(
        tmp.path(),
        "label_source = \"postgis\"\npg_dsn = \"host=localhost\"",
        "",
    )?);
    // No class carries a query, so the file itself is rejected.
    assert!(cfg.is_err());

    let empty = tempfile::tempdir()?;
    fs::create_dir_all(empty.path().join("data/images"))?;
    fs::create_dir_all(empty.path().join("data/dsm"))?;
    fs::create_dir_all(empty.path().join("data/labels"))?;
    let cfg = TrainingConfig::load(&write_config(empty.path(), "", "")?)?;
    let err = TilePipeline::from_config(&cfg, None).err().unwrap();
    assert!(matches!(err, TileDatasetError::EmptyDataset { .. }));
    Ok(())
}

#[test]
fn non_canonical_tile_names_are_not_indexed() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let root = tmp.path().join("data");
    let ids = tiles(3);
    for tile in &ids {
        write_tile(&root, *tile, &["images", "labels"])?;
    }
    write_tile(&root, ids[0], &["dsm"])?;
    write_tile(&root, ids[1], &["dsm"])?;
    // Zero-padded x directory and an uppercase extension: unreachable by the reader.
    let odd = root.join(format!("dsm/{}/0{}/{}.PNG", ids[2].z, ids[2].x, ids[2].y));
    fs::create_dir_all(odd.parent().unwrap())?;
    GrayImage::from_pixel(SIZE, SIZE, Luma([42])).save_with_format(&odd, image::ImageFormat::Png)?;

    let cfg = TrainingConfig::load(&write_config(tmp.path(), "", "seed = 3")?)?;
    let mut pipeline = TilePipeline::from_config(&cfg, None)?;
    assert_eq!(pipeline.index().tile_ids().collect::<Vec<_>>(), ids[..2].to_vec());
    assert_eq!(pipeline.index().exclusions()[0].tile, ids[2]);

    let sampler = pipeline.sampler();
    let mut produced = 0;
    while sampler.next_pair()?.is_some() {
        produced += 1;
    }
    assert_eq!(produced, 2);
    assert_eq!(sampler.report().unwrap().skipped, 0);
    Ok(())
}

/// Little-endian single-band 8BUI WKB raster, as `ST_AsBinary` returns it.
fn wkb_u8(size: u16, values: &[u8]) -> Vec<u8> {
    let mut out = vec![1u8];
    out.extend_from_slice(&0u16.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes());
    for v in [1.0f64, -1.0, 0.0, 0.0, 0.0, 0.0] {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out.extend_from_slice(&3857i32.to_le_bytes());
    out.extend_from_slice(&size.to_le_bytes());
    out.extend_from_slice(&size.to_le_bytes());
    out.push(0x40 | 4);
    out.push(0);
    out.extend_from_slice(values);
    out
}

#[derive(Default)]
struct FakeStore {
    rasters: Vec<(&'static str, Vec<u8>)>,
    queries: Mutex<Vec<String>>,
}

impl SpatialStore for FakeStore {
    fn fetch_srid(&self, sql: &str) -> Result<i32, String> {
        self.queries.lock().unwrap().push(sql.to_string());
        Ok(4326)
    }

    fn fetch_raster(&self, sql: &str) -> Result<Option<Vec<u8>>, String> {
        self.queries.lock().unwrap().push(sql.to_string());
        Ok(self
            .rasters
            .iter()
            .find(|(needle, _)| sql.contains(needle))
            .map(|(_, raster)| raster.clone()))
    }
}

#[test]
fn postgis_labels_flow_through_the_pipeline() -> anyhow::Result<()> {
    let tmp = tempfile::tempdir()?;
    let root = tmp.path().join("data");
    let ids = tiles(2);
    for tile in &ids {
        write_tile(&root, *tile, &["images", "dsm"])?;
    }
    let config = format!(
        r##"
[dataset]
path = "data"
label_source = "postgis"
pg_dsn = "host=localhost dbname=osm"

[[classes]]
title = "background"
color = "black"

[[classes]]
title = "building"
color = "red"
query = "SELECT geom FROM buildings"

[[classes]]
title = "water"
color = "#0000ff"
query = "SELECT geom FROM water_bodies"

[[channels]]
sub = "images"
bands = [1]
mean = [0.0]
std = [1.0]

[model]
tile_size = {SIZE}

[sampler]
seed = 5
"##
    );
    let path = tmp.path().join("tileseg.toml");
    fs::write(&path, config)?;
    let cfg = TrainingConfig::load(&path)?;

    let n = SIZE as usize;
    let buildings: Vec<u8> = (0..n * n).map(|i| u8::from(i % n < 4)).collect();
    let water: Vec<u8> = (0..n * n).map(|i| if i / n < 2 { 2 } else { 0 }).collect();
    let store = Arc::new(FakeStore {
        rasters: vec![
            ("FROM buildings", wkb_u8(SIZE as u16, &buildings)),
            ("FROM water_bodies", wkb_u8(SIZE as u16, &water)),
        ],
        ..Default::default()
    });
    let shared: Arc<dyn SpatialStore> = store.clone();
    let mut pipeline = TilePipeline::from_config(&cfg, Some(shared))?;
    // No label directory is scanned for postgis labels.
    assert_eq!(pipeline.index().size(), 2);

    let sampler = pipeline.sampler();
    let mut seen = 0;
    while let Some(pair) = sampler.next_pair()? {
        assert_eq!(pair.label.get(0, 0), 2);
        assert_eq!(pair.label.get(1, 5), 1);
        assert_eq!(pair.label.get(6, 5), 0);
        seen += 1;
    }
    assert_eq!(seen, 2);

    let queries = store.queries.lock().unwrap();
    // Two SRID lookups at construction, then one raster query per class per tile.
    assert_eq!(queries.len(), 2 + 2 * 2);
    assert!(queries[0].starts_with("SELECT ST_Srid(geom)"));
    assert!(queries[2].contains("ST_AsBinary"));
    Ok(())
}
