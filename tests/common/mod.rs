use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Opt-in log output while debugging tests, e.g. `RUST_LOG=taskweave=debug`.
/// Safe to call from every test; only the first call installs a subscriber.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("off"));
    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).without_time())
        .with(filter)
        .try_init();
}
