use tracing_subscriber::{fmt, EnvFilter};

/// Installs a test-friendly `tracing` subscriber.  Controlled through
/// `RUST_LOG`; safe to call from every test.
pub(crate) fn init_logging() {
    let _ = fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
