//! Configuration view and validation commands: `labtriage config`.

use anyhow::{Context, Result};

use labtriage::config::{DATA_DIR, TriageConfig, TriageToml};

use super::super::{Cli, ConfigCommands};

pub fn cmd_config(config: &TriageConfig, cli: &Cli, command: Option<ConfigCommands>) -> Result<()> {
    let config_path = config.config_path();

    match command {
        None | Some(ConfigCommands::Show) => {
            if cli.json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&config.toml)
                        .context("Failed to serialize configuration")?
                );
                return Ok(());
            }

            println!();
            println!("{}", console::style("labtriage configuration").bold().cyan());
            println!();
            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No labtriage.toml found at {}; using defaults.", config_path.display());
            }
            println!();

            let toml = &config.toml;
            println!("[store]");
            println!("  backend = \"{}\"", toml.store.backend);
            println!("  path = \"{}\"", config.store_path().display());
            println!();
            println!("[engine]");
            println!("  session_lock_timeout_ms = {}", toml.engine.session_lock_timeout_ms);
            println!("  max_steps_per_call = {}", toml.engine.max_steps_per_call);
            println!();
            println!("[interpreter]");
            println!("  provider = \"{}\"", toml.interpreter.provider.as_str());
            println!("  base_url = \"{}\"", toml.interpreter.base_url);
            println!("  model = \"{}\"", toml.interpreter.model);
            println!(
                "  api_key_env = \"{}\" ({})",
                toml.interpreter.api_key_env,
                if config.api_key().is_some() { "set" } else { "not set" }
            );
            println!("  max_tokens = {}", toml.interpreter.max_tokens);
            println!();
            println!("[specialists]");
            if let Some(location) = &toml.specialists.default_location {
                println!("  default_location = \"{}\"", location);
            }
            println!("  directory entries = {}", toml.specialists.directory.len());
            println!();
            println!("[records]");
            println!("  fhir_base_url = \"{}\"", toml.records.fhir_base_url);
            println!();
            println!("[server]");
            println!("  listen = {}:{}", toml.server.host, toml.server.port);
            println!();
        }
        Some(ConfigCommands::Validate) => {
            let warnings = config.validate();
            if cli.json {
                println!(
                    "{}",
                    serde_json::json!({ "valid": warnings.is_empty(), "warnings": warnings })
                );
                return Ok(());
            }
            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("labtriage.toml already exists at {}", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }
            std::fs::create_dir_all(&config.data_dir)
                .with_context(|| format!("Failed to create {}", DATA_DIR))?;
            TriageToml::default().save(&config_path)?;

            println!("Created labtriage.toml at {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [interpreter] provider = \"rules\" to run without a model API key");
            println!("  - [[specialists.directory]] entries for the specialist search");
            println!("  - [records] fhir_base_url for record submission");
            println!();
        }
    }

    Ok(())
}
