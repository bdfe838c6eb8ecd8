use std::sync::Arc;

use anyhow::{Context, Result};
use fishler_common::helpers::fs::create_secure_directory;
use fishler_common::FishlerConfig;
use time::{format_description, UtcOffset};
use tracing_log::LogTracer;
use tracing_subscriber::filter::dynamic_filter_fn;
use tracing_subscriber::fmt::time::OffsetTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Console text layer plus a JSON layer appending to
/// `<log-basepath>/system.log`; rotation happens out-of-band.
pub fn init_logging(config: &FishlerConfig) -> Result<()> {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", if config.debug { "debug" } else { "info" });
    }

    LogTracer::init().context("Failed to initialize log compatibility layer")?;

    let offset = UtcOffset::current_local_offset().unwrap_or(UtcOffset::UTC);
    let env_filter = Arc::new(EnvFilter::from_default_env());
    let enable_colors = console::user_attended();

    create_secure_directory(&config.log_basepath)?;
    let system_log = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(config.system_log_path())
        .context("opening system.log")?;

    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_ansi(false)
        .with_writer(Arc::new(system_log))
        .with_filter(dynamic_filter_fn({
            let env_filter = env_filter.clone();
            move |m, c| env_filter.enabled(m, c.clone())
        }));

    let console_layer = tracing_subscriber::fmt::layer()
        .with_ansi(enable_colors)
        .with_timer(OffsetTime::new(
            offset,
            #[allow(clippy::unwrap_used)]
            format_description::parse("[day].[month].[year] [hour]:[minute]:[second]").unwrap(),
        ))
        .with_filter(dynamic_filter_fn(move |m, c| {
            env_filter.enabled(m, c.clone())
        }));

    tracing_subscriber::registry()
        .with(json_layer)
        .with(console_layer)
        .init();
    Ok(())
}
