use log::LevelFilter;

/// Initializes the global logger. The level given here is the default;
/// `RUST_LOG` still overrides it, so individual targets (`discovery`,
/// `offer`, `request`, `transfer`) can be tuned selectively.
pub fn init_logging(log_level: LevelFilter) {
    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .format_timestamp_millis()
        .init();
}
