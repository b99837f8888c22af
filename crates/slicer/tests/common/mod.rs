use tracing_subscriber::{fmt, EnvFilter};

/// Installs a `tracing` subscriber writing to the test output, filtered
/// through `RUST_LOG`.
pub fn init_logging() {
    let _ = fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
