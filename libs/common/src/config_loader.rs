//! Layered configuration loading
//!
//! A YAML file provides the base values and `{PREFIX}_SECTION__KEY`
//! environment variables override individual fields. Missing files are not an
//! error: every field of the target type is expected to carry a serde default.

use std::path::Path;

use figment::{
    providers::{Env, Format, Serialized, Yaml},
    Figment,
};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, info};

/// Separator between nested keys in environment variable names
pub const ENV_NESTING_SEPARATOR: &str = "__";

/// Build the figment used by [`load_config`]
///
/// Priority (highest to lowest):
/// 1. Environment variables `{env_prefix}SECTION__KEY`
/// 2. The YAML file at `path` (if it exists)
/// 3. `T::default()`
pub fn figment_for<T>(path: Option<&Path>, env_prefix: &str) -> Figment
where
    T: Serialize + Default,
{
    let mut figment = Figment::from(Serialized::defaults(T::default()));

    if let Some(path) = path {
        if path.exists() {
            info!("Loading configuration from {}", path.display());
            figment = figment.merge(Yaml::file(path));
        } else {
            debug!("Config file {} not found, using defaults", path.display());
        }
    }

    figment.merge(Env::prefixed(env_prefix).split(ENV_NESTING_SEPARATOR))
}

/// Load a configuration value of type `T`
pub fn load_config<T>(path: Option<&Path>, env_prefix: &str) -> Result<T, errors::VoltageError>
where
    T: Serialize + DeserializeOwned + Default,
{
    figment_for::<T>(path, env_prefix)
        .extract()
        .map_err(|e| errors::VoltageError::Configuration(format!("Failed to load configuration: {}", e)))
}
