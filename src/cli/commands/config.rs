use anyhow::Result;

use crate::config::MergeConductorConfig;

pub struct ConfigCommand;

impl ConfigCommand {
    pub fn execute(&self, config: &MergeConductorConfig) -> Result<()> {
        print!("{}", render(config)?);
        Ok(())
    }
}

/// Effective configuration as TOML, with the token masked
pub fn render(config: &MergeConductorConfig) -> Result<String> {
    let mut shown = config.clone();
    if shown.github.token.is_some() {
        shown.github.token = Some("********".to_string());
    }
    Ok(toml::to_string_pretty(&shown)?)
}
