//! Structured logging setup for binaries built on this crate.
//!
//! The library itself only emits `tracing` events; it never installs a
//! subscriber. This helper is for the bundled CLI, grounded in the
//! teacher's `main.rs` JSON subscriber with an env-filter default of
//! `info`.

/// Install a global JSON `tracing` subscriber, honoring `RUST_LOG` and
/// defaulting to `info`. Call once, near the top of `main`.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}
