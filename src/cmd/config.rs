//! Configuration view and validation commands (`editorial config`).

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use console::style;

use editorial_orchestrator::config::{CONFIG_FILE_NAME, EditorialConfig};

use super::super::ConfigCommands;

fn config_file(config_path: Option<&Path>, cwd: &Path) -> PathBuf {
    config_path
        .map(Path::to_path_buf)
        .unwrap_or_else(|| cwd.join(CONFIG_FILE_NAME))
}

pub fn cmd_config(
    config_path: Option<&Path>,
    cwd: &Path,
    command: Option<ConfigCommands>,
) -> Result<()> {
    let path = config_file(config_path, cwd);

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("{}", style("Editorial Configuration").bold());
            println!("=======================");
            println!();
            if path.exists() {
                println!("Config file: {}", path.display());
            } else {
                println!("No {} found at {}; using defaults.", CONFIG_FILE_NAME, path.display());
            }
            println!("{}", style("Effective values (with env overrides):").dim());
            println!();

            let config = EditorialConfig::resolve(config_path, cwd)?;
            let rendered =
                toml::to_string_pretty(&config).context("Failed to render configuration")?;
            println!("{}", rendered);
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            let config = EditorialConfig::resolve(config_path, cwd)?;
            let warnings = config.validate();
            if warnings.is_empty() {
                println!("{}", style("Configuration is valid.").green());
            } else {
                println!("{}", style("Configuration warnings:").yellow());
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
        Some(ConfigCommands::Init { force }) => {
            if path.exists() && !force {
                println!("{} already exists at {}", CONFIG_FILE_NAME, path.display());
                println!("Pass --force to overwrite it.");
                return Ok(());
            }
            if let Some(parent) = path.parent()
                && !parent.as_os_str().is_empty()
            {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
            EditorialConfig::default().save(&path)?;

            println!("Created {} at {}", CONFIG_FILE_NAME, path.display());
            println!();
            println!("You can now customize:");
            println!("  - [server] host, port, role");
            println!("  - [rules] backend, file or ChromaDB host/port/collection");
            println!("  - [state] redis_url for durable checkpoints and sequences");
            println!();
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_init_writes_loadable_file() {
        let dir = tempdir().unwrap();
        cmd_config(None, dir.path(), Some(ConfigCommands::Init { force: false })).unwrap();
        let loaded = EditorialConfig::load(&dir.path().join(CONFIG_FILE_NAME)).unwrap();
        assert_eq!(loaded.server.port, 8040);
    }

    #[test]
    fn test_init_keeps_existing_file_without_force() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, "[server]\nport = 9999\n").unwrap();
        cmd_config(None, dir.path(), Some(ConfigCommands::Init { force: false })).unwrap();
        assert_eq!(EditorialConfig::load(&path).unwrap().server.port, 9999);

        cmd_config(None, dir.path(), Some(ConfigCommands::Init { force: true })).unwrap();
        assert_eq!(EditorialConfig::load(&path).unwrap().server.port, 8040);
    }
}
