//! TOML loading for [`ReplicatorSettings`].

use std::path::Path;

use crate::{ConfigError, ReplicatorSettings};

/// Loads settings from a TOML file and validates them.
///
/// Missing keys fall back to the built-in defaults; unknown keys are
/// ignored so hosts can keep replicator settings inside a larger config
/// file.
pub fn load_from_path(path: &Path) -> Result<ReplicatorSettings, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    let settings: ReplicatorSettings =
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

    settings.validate()?;
    Ok(settings)
}
