//! Config command implementation.

use super::types::ConfigCommand;
use anyhow::{Context, Result};
use colored::Colorize;
use gradwire_client::ClientConfig;

/// Execute the config command.
pub fn execute(config: &ClientConfig, command: ConfigCommand) -> Result<()> {
    match command {
        ConfigCommand::Show => {
            let rendered = config.redacted().to_toml().context("Failed to render configuration")?;
            print!("{}", rendered);
            Ok(())
        }
        ConfigCommand::Validate => {
            config.validate().context("Configuration is invalid")?;
            println!("{} Configuration is valid", "✓".green());
            Ok(())
        }
    }
}
