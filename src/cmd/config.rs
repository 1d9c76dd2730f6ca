//! Configuration view and validation commands: `spaghettihub config`.

use anyhow::Result;
use std::path::Path;

use spaghettihub::config::AppConfig;

use super::super::ConfigCommands;

pub fn cmd_config(path: &Path, config: &AppConfig, command: Option<ConfigCommands>) -> Result<()> {
    match command {
        None | Some(ConfigCommands::Show) => {
            if path.exists() {
                println!("# Config file: {}", path.display());
            } else {
                println!("# Config file: {} (not found, using defaults)", path.display());
            }
            println!();
            print!("{}", config.redacted().to_toml()?);
        }
        Some(ConfigCommands::Validate) => {
            let problems = config.validate();
            if problems.is_empty() {
                println!("{}", console::style("Configuration is valid.").green());
            } else {
                for problem in &problems {
                    println!("  {} {}", console::style("✗").red(), problem);
                }
                anyhow::bail!("{} configuration problem(s)", problems.len());
            }
        }
    }
    Ok(())
}
