use tracing_subscriber::EnvFilter;

/// Initializes a `tracing_subscriber` using `TILESEG_LOG` first, then `RUST_LOG`, then `info`.
///
/// Fields used across the pipeline: `tile` as `z/x/y`, `sub` for the source
/// directory, `epoch` on sampler events.
pub fn init_tracing() {
    let filter = env_filter();
    // A second call (tests, embedding) keeps the first subscriber.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

pub fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env("TILESEG_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"))
}
