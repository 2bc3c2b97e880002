mod settings;

use config::{Config, ConfigError, Environment, File};

use settings::PartialSettings;

pub use settings::{
    BackpressureSettings, ConflictPolicy, DirectorySettings, DispatcherSettings, LoggingSettings,
    MaintenanceSettings, PersistenceSettings, RouterSettings, ServerSettings, Settings,
};

/// Prefix of environment variables read by [`load_config`].
pub const ENV_PREFIX: &str = "ROUTEMESH";

/// Loads the configuration from the default file and environment variables
/// Merges the configuration with default values
/// Returns a `Settings` struct covering every component of a node
///
/// Environment variables use `__` between section and key, for example
/// `ROUTEMESH_ROUTER__RETRY_INTERVAL_MS=500`.
pub fn load_config() -> Result<Settings, ConfigError> {
    let builder = Config::builder()
        .add_source(File::with_name("config/default").required(false))
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

    let config = builder.build()?;

    // Try to deserialize what is available
    let partial: PartialSettings = config.try_deserialize()?;

    let settings = partial.merge(Settings::default());
    validate(&settings)?;
    Ok(settings)
}

fn validate(settings: &Settings) -> Result<(), ConfigError> {
    let bp = &settings.backpressure;
    if bp.enabled && bp.max_incoming_requests > 0 && bp.lower_threshold >= bp.max_incoming_requests
    {
        return Err(ConfigError::Message(format!(
            "backpressure.lower_threshold ({}) must be below max_incoming_requests ({})",
            bp.lower_threshold, bp.max_incoming_requests
        )));
    }
    if settings.router.max_parallel_sends == 0 {
        return Err(ConfigError::Message(
            "router.max_parallel_sends must be at least 1".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests;
