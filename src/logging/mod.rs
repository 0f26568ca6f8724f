use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{fmt, EnvFilter, Registry};

/// Installs the global subscriber.
///
/// The filter comes from `RUST_LOG` when it is set and parses. Otherwise
/// `default_level` (normally `[logging] level` from the config file) is
/// used, and if that is not a valid directive either, `info`. Fails if a
/// global subscriber is already installed.
pub fn init_logging(default_level: &str) -> Result<(), anyhow::Error> {
    let filter: EnvFilter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let formatting_layer = fmt::layer()
        .with_timer(UtcTime::rfc_3339())
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_target(true)
        .compact();

    let subscriber = Registry::default().with(filter).with(formatting_layer);

    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}
