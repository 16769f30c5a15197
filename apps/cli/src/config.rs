//! CLI configuration loading and merging.

use anyhow::{Context, Result};
use gradwire_client::ClientConfig;
use std::path::PathBuf;

/// Values given on the command line.
#[derive(Debug, Default)]
pub struct Overrides {
    pub config_path: Option<PathBuf>,
    pub base_url: Option<String>,
    pub model_id: Option<String>,
}

/// Load and merge CLI configuration.
///
/// Configuration precedence:
/// 1. CLI arguments
/// 2. Environment variables (GRADWIRE_BASE_URL, GRADWIRE_API_KEY, GRADWIRE_MODEL_ID)
/// 3. File given with --config
/// 4. Local config file (./.gradwirerc)
/// 5. Global config file (~/.gradwire/config.toml)
/// 6. Defaults
pub fn load_config(overrides: &Overrides) -> Result<ClientConfig> {
    let mut config = ClientConfig::discover_and_load();

    if let Some(path) = &overrides.config_path {
        let explicit = ClientConfig::load_from_file(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?;
        config.merge(&explicit);
    }

    config.apply_env_overrides();

    if let Some(base_url) = &overrides.base_url {
        config.base_url = Some(base_url.clone());
    }
    if let Some(model_id) = &overrides.model_id {
        config.model_id = Some(model_id.clone());
    }

    Ok(config)
}

/// The model id every training command needs.
pub fn require_model_id(config: &ClientConfig) -> Result<&str> {
    config
        .model_id
        .as_deref()
        .filter(|id| !id.trim().is_empty())
        .context("model_id is not set (use --model-id, GRADWIRE_MODEL_ID or the config file)")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_require_model_id() {
        let config = ClientConfig::default();
        assert!(require_model_id(&config).is_err());

        let config = ClientConfig::default().with_model_id("m");
        assert_eq!(require_model_id(&config).unwrap(), "m");
    }
}
