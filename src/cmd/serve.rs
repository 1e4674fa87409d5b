//! `labtriage serve`.

use anyhow::Result;

use labtriage::config::TriageConfig;

pub async fn cmd_serve(config: &TriageConfig) -> Result<()> {
    let warnings = config.validate();
    for warning in &warnings {
        eprintln!("{} {}", console::style("warning:").yellow().bold(), warning);
    }
    println!(
        "{} store: {} ({})",
        console::style("labtriage").bold().cyan(),
        config.store_path().display(),
        config.toml.store.backend
    );
    labtriage::server::start_server(config).await
}
