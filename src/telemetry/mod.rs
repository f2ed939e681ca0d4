//! Tracing bootstrap for worker processes.
//!
//! The library itself only emits `tracing` events with structured fields
//! (`report_id`, `stage`, token counts); embedding binaries call
//! [`try_init`] once at startup to get formatted output honoring
//! `RUST_LOG`.

use tracing_subscriber::EnvFilter;

/// Default filter when `RUST_LOG` is unset.
const DEFAULT_FILTER: &str = "claimweave=info";

/// Install the global fmt subscriber. Safe to call more than once — later
/// calls return `Err` and leave the first subscriber in place.
pub fn try_init() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_init_does_not_panic() {
        let _ = try_init();
        let _ = try_init();
    }
}
