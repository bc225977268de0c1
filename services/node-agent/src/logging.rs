//! Tracing subscriber setup.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global subscriber.
///
/// `RUST_LOG` wins over `level`. `format` is `json` (default) or `text`.
pub fn init(level: &str, format: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        "text" | "compact" => registry
            .with(tracing_subscriber::fmt::layer().compact().with_target(false))
            .init(),
        _ => registry.with(tracing_subscriber::fmt::layer().json()).init(),
    }
}
