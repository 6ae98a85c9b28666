use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub(crate) fn tracing() {
    tracing_subscriber::registry()
        .with(fmt::layer().compact())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
}
