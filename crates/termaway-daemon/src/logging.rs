use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize the global tracing subscriber: JSON lines to stderr, filtered
/// by `RUST_LOG` with the daemon at `info` by default.
///
/// Call once from `main`; a second call panics.
pub fn init_logging() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr)
                .with_current_span(false)
                .with_span_list(false),
        )
        .with(
            EnvFilter::from_default_env()
                .add_directive("termaway_daemon=info".parse().expect("static directive")),
        )
        .init();
}
