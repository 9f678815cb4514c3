use tracing_subscriber::EnvFilter;

/// Directives used when `RUST_LOG` is unset or empty.
const DEFAULT_FILTER: &str = "leaky_throttle=debug";

/// Initialize logging for a given demo.
///
/// Limiter diagnostics are only emitted when `leaky-throttle` is built with
/// the `tracing` feature. Detached tasks run on Tokio's blocking pool, so
/// events carry the thread name and the time since startup.
pub fn init_logging() {
    use tracing_subscriber::prelude::*;

    let directives = std::env::var(EnvFilter::DEFAULT_ENV).ok();

    let _ = tracing_subscriber::registry()
        .with(filter(directives.as_deref()))
        .with(
            tracing_subscriber::fmt::layer()
                .with_timer(tracing_subscriber::fmt::time::uptime())
                .with_thread_names(true)
                .with_target(true)
                .compact(),
        )
        .try_init();
}

fn filter(directives: Option<&str>) -> EnvFilter {
    match directives {
        Some(directives) if !directives.trim().is_empty() => EnvFilter::new(directives),
        _ => EnvFilter::new(DEFAULT_FILTER),
    }
}
