use std::sync::Arc;

use anyhow::Result;
use data_contracts::{LabelSourceKind, TrainingConfig};
use tile_dataset::SpatialStore;

/// Spatial store for the configured label source: `None` for raster labels,
/// a connection to `dataset.pg_dsn` for postgis labels.
pub fn open_spatial_store(cfg: &TrainingConfig) -> Result<Option<Arc<dyn SpatialStore>>> {
    if cfg.dataset.label_source != LabelSourceKind::Postgis {
        return Ok(None);
    }
    let Some(dsn) = cfg.dataset.pg_dsn.as_deref() else {
        anyhow::bail!("label_source = \"postgis\" requires dataset.pg_dsn");
    };
    connect(dsn)
}

#[cfg(feature = "postgis")]
fn connect(dsn: &str) -> Result<Option<Arc<dyn SpatialStore>>> {
    let store: Arc<dyn SpatialStore> = Arc::new(pg::PgStore::connect(dsn)?);
    Ok(Some(store))
}

#[cfg(not(feature = "postgis"))]
fn connect(_dsn: &str) -> Result<Option<Arc<dyn SpatialStore>>> {
    anyhow::bail!("postgis labels need the tools built with `--features postgis`")
}

#[cfg(feature = "postgis")]
pub mod pg {
    use std::sync::Mutex;

    use anyhow::{Context, Result};
    use postgres::{Client, NoTls};
    use tile_dataset::SpatialStore;

    /// One blocking connection shared by the loader threads.
    pub struct PgStore {
        client: Mutex<Client>,
    }

    impl PgStore {
        pub fn connect(dsn: &str) -> Result<Self> {
            let client = Client::connect(dsn, NoTls).context("connect to postgres (dataset.pg_dsn)")?;
            tracing::info!("postgis store connected");
            Ok(Self {
                client: Mutex::new(client),
            })
        }

        fn client(&self) -> Result<std::sync::MutexGuard<'_, Client>, String> {
            self.client
                .lock()
                .map_err(|_| "postgres connection poisoned by a panicked loader".to_string())
        }
    }

    impl SpatialStore for PgStore {
        fn fetch_srid(&self, sql: &str) -> Result<i32, String> {
            let row = self.client()?.query_one(sql, &[]).map_err(|e| e.to_string())?;
            row.try_get::<_, i32>(0).map_err(|e| e.to_string())
        }

        fn fetch_raster(&self, sql: &str) -> Result<Option<Vec<u8>>, String> {
            let row = self.client()?.query_opt(sql, &[]).map_err(|e| e.to_string())?;
            match row {
                Some(row) => row.try_get::<_, Option<Vec<u8>>>(0).map_err(|e| e.to_string()),
                None => Ok(None),
            }
        }
    }
}
