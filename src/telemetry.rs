//! Structured logging setup shared by the controller and the two
//! persistence-coordinator binaries. Every entrypoint calls [`init`] before
//! doing anything else; nothing in the core reconcile/compose/credential
//! path uses `println!`/`eprintln!` once this is in place.

use tracing_subscriber::fmt::format::FmtSpan;

/// Initializes the global `tracing` subscriber from `RUST_LOG`, falling back
/// to a sensible default that's quiet about library crates but verbose about
/// our own.
pub fn init(default_filter: &str) {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.to_owned());
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_span_events(FmtSpan::CLOSE)
        .init();
}
