// Thin wrapper around the teacher's `main.rs` logging setup, pulled out so a
// host embedding this crate can opt in without duplicating the boilerplate.
use tracing_subscriber::EnvFilter;

/// Installs a global `tracing` subscriber reading `RUST_LOG`, defaulting to
/// `info` when it's unset. Call once, near process start.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
