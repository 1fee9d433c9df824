//! Tracing subscriber setup for services embedding the coordination layer.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Installs a global subscriber driven by `RUST_LOG`
///
/// Falls back to `default_filter` (for example `"switchyard=info"`) when
/// `RUST_LOG` is unset. Calling it twice is harmless; the second call is a no-op.
pub fn init_tracing(default_filter: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into());
    let registry = tracing_subscriber::registry().with(filter);

    let result = if json {
        registry.with(tracing_subscriber::fmt::layer().json()).try_init()
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()
    };

    if result.is_ok() {
        tracing::debug!("Tracing initialised");
    }
}
