// CLI daemon commands: serve, check-config

use std::path::Path;

use anyhow::Context;

use crate::daemon;

/// pocketd serve
pub async fn cmd_serve(
    config: Option<&Path>,
    data_dir: Option<&Path>,
    host: Option<&str>,
    port: Option<u16>,
) -> anyhow::Result<()> {
    daemon::start_daemon(config, data_dir, host, port).await
}

/// pocketd check-config
pub fn cmd_check_config(config: Option<&Path>, data_dir: Option<&Path>) -> anyhow::Result<()> {
    let config = daemon::resolve_config(config, data_dir)?;
    config.validate()?;
    println!(
        "{}",
        serde_json::to_string_pretty(&config).context("Failed to render config")?
    );
    eprintln!("Configuration is valid.");
    Ok(())
}
