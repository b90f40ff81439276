mod settings;

use config::{Config, ConfigError, Environment, File};

pub use settings::{
    LatencySettings, LogSettings, NodeSettings, PartialSettings, QueueSettings,
    ScannerSettings, Settings,
};

/// Prefix for environment overrides, e.g. `POPSUBD__QUEUE__MEM_QUEUE_SIZE=0`.
pub const ENV_PREFIX: &str = "POPSUBD";

/// Loads the configuration from the default file and environment variables
/// Merges the configuration with default values
/// Returns a `Settings` struct; call `Settings::validate` before using it
pub fn load_config() -> Result<Settings, ConfigError> {
    let builder = Config::builder()
        .add_source(File::with_name("config/default").required(false))
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("latency.percentiles")
                .try_parsing(true),
        );

    let config = builder.build()?;

    // Try to deserialize what is available
    let partial: PartialSettings = config.try_deserialize()?;

    Ok(partial.merge(Settings::default()))
}

#[cfg(test)]
mod tests;
