use tracing_subscriber::{
    util::{SubscriberInitExt, TryInitError},
    EnvFilter,
};

/// Installs the global tracing subscriber. `RUST_LOG` overrides the default
/// `info` level.
pub fn init_logging() -> Result<(), TryInitError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .finish()
        .try_init()
}
