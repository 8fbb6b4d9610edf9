//! Print the resolved configuration

use crate::settings::{self, Resolved};
use anyhow::Result;
use owo_colors::OwoColorize;

pub fn run(resolved: &Resolved) -> Result<()> {
    match &resolved.source {
        Some(path) => println!("{} {}", "# Loaded from".dimmed(), path.display().dimmed()),
        None => {
            let hint = settings::default_config_path()
                .map(|p| format!("# No config file; defaults apply (looked for {})", p.display()))
                .unwrap_or_else(|| "# No config file; defaults apply".to_string());
            println!("{}", hint.dimmed());
        }
    }
    print!("{}", resolved.config.to_toml()?);
    Ok(())
}
