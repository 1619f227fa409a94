use std::{env, path::PathBuf};

use anyhow::Context;
use clap::Parser;
use sidechannel::config::{ConfigManager, EnvConfigManager, ROOT_KEY, Settings};
use sidechannel::logger::{LogConfig, init_tracing};
use tracing::debug;

mod cli;

use cli::{Cli, CliContext};

/// Resolve the sidechannel root directory from the environment or use default.
pub fn resolve_root_dir() -> PathBuf {
    match env::var(ROOT_KEY) {
        Ok(path) if !path.trim().is_empty() => PathBuf::from(path),
        _ => PathBuf::from("./sidechannel"),
    }
}

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let root = cli.root.clone().unwrap_or_else(resolve_root_dir);

    let env_file = root.join("config").join(".env");
    let config_manager = ConfigManager(EnvConfigManager::new(Some(env_file)));
    let mut settings = Settings::load(&config_manager)
        .await
        .context("invalid sidechannel configuration")?
        .rebase(root);
    if let Some(level) = cli.log_level {
        settings.log_level = level;
    }

    let _guard = init_tracing(&LogConfig::from_settings(&settings))?;
    debug!(?settings, "settings resolved");

    let context = CliContext::new(settings, config_manager);
    let command = cli.command.unwrap_or_else(cli::default_command);
    cli::execute(&context, command).await
}
