use tracing::level_filters::LevelFilter as Level;
use tracing_subscriber::filter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::prelude::*;

/// Initialize the logger with the given level for this crate's targets.
/// Safe to call more than once; later calls keep the first subscriber.
#[inline]
pub fn init_logger(level: &str) {
    let crate_level: Level = level.parse().unwrap_or(Level::INFO);
    let filter = filter::Targets::new()
        .with_target("sessionfs", crate_level)
        .with_target("", Level::WARN);

    let layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(filter);

    let subscriber = tracing_subscriber::Registry::default().with(layer);

    // Tests may initialize the logger from several entry points.
    let _: Result<(), tracing::subscriber::SetGlobalDefaultError> =
        tracing::subscriber::set_global_default(subscriber);
}
