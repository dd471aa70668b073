//! Print the effective configuration.

use anyhow::{Context, Result};
use cast_stream::Config;

/// Run the config command.
pub fn run(config: &Config) -> Result<()> {
    let text = toml::to_string_pretty(config).context("Failed to serialize configuration")?;
    print!("{}", text);
    Ok(())
}
