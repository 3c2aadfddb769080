//! Log output is controlled by environment variables at startup: `RUST_LOG`
//! selects the level filter and `SEQMINT_LOG_SCREEN=0` suppresses console
//! output entirely (useful when an init system captures stderr elsewhere).

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    let to_screen = std::env::var("SEQMINT_LOG_SCREEN")
        .map(|v| v != "0")
        .unwrap_or(true);

    let registry = tracing_subscriber::registry().with(filter);
    if to_screen {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        registry.init();
    }
}
