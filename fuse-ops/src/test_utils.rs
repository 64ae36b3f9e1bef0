//! Helpers shared by unit tests

/// Installs a global subscriber with an error layer, once per test binary
pub fn init_tracing() {
    use tracing_error::ErrorLayer;
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let _ = fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .finish()
        .with(ErrorLayer::default())
        .try_init();
}
