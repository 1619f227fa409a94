use clap::{Args, Subcommand};

use super::CliContext;

#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommands,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Every SIDECHANNEL_* value and the settings resolved from them
    List,
    Get { key: String },
    /// Write a value to `<root>/config/.env`
    Set { key: String, value: String },
    Delete { key: String },
}

pub async fn execute(args: ConfigArgs, context: &CliContext) -> anyhow::Result<()> {
    let config = &context.config_manager;
    match args.command {
        ConfigCommands::List => {
            let mut keys = config.0.keys().await;
            keys.sort();
            for key in keys {
                println!("{key}={}", config.get(&key).await.unwrap_or_default());
            }
            println!("{}", serde_json::to_string_pretty(&context.settings)?);
        }
        ConfigCommands::Get { key } => match config.get(&key).await {
            Some(value) => println!("{value}"),
            None => eprintln!("❌ {key} is not set."),
        },
        ConfigCommands::Set { key, value } => match config.0.set(&key, &value).await {
            Ok(()) => println!("✅ Config updated."),
            Err(err) => eprintln!("❌ Config could not be updated: {err}"),
        },
        ConfigCommands::Delete { key } => match config.0.del(&key).await {
            Ok(()) => println!("✅ Config deleted."),
            Err(err) => eprintln!("❌ Config could not be deleted: {err}"),
        },
    }
    Ok(())
}
