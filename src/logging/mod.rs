use tracing_subscriber::{fmt, EnvFilter};

/// Installs the global tracing subscriber.
///
/// Level comes from `RUST_LOG`, defaulting to `info`. Call once per
/// process; tests wrap this in a `Once`.
pub fn init_logging() {
    let filter: EnvFilter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .compact()
        .init();
}
