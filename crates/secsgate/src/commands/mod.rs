pub mod simulate;
pub mod validate;

use secsgate_config::{GatewayConfig, load_config};

use crate::cli::GlobalOpts;
use crate::error::CliError;

/// Load and validate the configuration named by the global options.
pub fn load_validated(global: &GlobalOpts) -> Result<GatewayConfig, CliError> {
    let path = global.config_path();
    tracing::debug!(path = %path.display(), "loading configuration");
    let config = load_config(Some(&path)).map_err(|e| CliError::config(&path, e))?;
    config.validate().map_err(|e| CliError::config(&path, e))?;
    Ok(config)
}
