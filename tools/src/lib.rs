pub mod config;
pub mod export;
pub mod logging;
pub mod report;
pub mod store;

pub use config::{load_training_config, resolve_config_path};
pub use logging::init_tracing;
pub use report::DatasetCheck;
pub use store::open_spatial_store;
