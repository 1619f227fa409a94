use clap::{Parser, Subcommand};

pub mod audit;
pub mod config;
pub mod demo;
pub mod permissions;
pub mod schema;

use audit::AuditArgs;
use config::ConfigArgs;
use demo::DemoArgs;
use permissions::PermissionArgs;
use schema::SchemaArgs;

use sidechannel::config::{ConfigManager, Settings};

#[derive(Parser, Debug)]
#[command(
    name = "sidechannel",
    about = "Operate a client's sidechannel permissions and audit trail",
    version
)]
pub struct Cli {
    /// Root directory; overrides SIDECHANNEL_ROOT
    #[arg(long, global = true)]
    pub root: Option<std::path::PathBuf>,

    /// Log level override (error, warn, info, debug, trace)
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a client and server back to back and print what happened
    Demo(DemoArgs),

    /// Inspect and change what senders may do
    Permissions(PermissionArgs),

    /// Read or clean the audit trail
    Audit(AuditArgs),

    /// Emit JSON-Schema for every stored document
    Schema(SchemaArgs),

    /// Read and change SIDECHANNEL_* settings
    Config(ConfigArgs),
}

#[derive(Debug, Clone)]
pub struct CliContext {
    pub settings: Settings,
    pub config_manager: ConfigManager,
}

impl CliContext {
    pub fn new(settings: Settings, config_manager: ConfigManager) -> Self {
        Self {
            settings,
            config_manager,
        }
    }
}

pub async fn execute(context: &CliContext, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Demo(args) => demo::execute(args, context).await,
        Commands::Permissions(args) => permissions::execute(args, context).await,
        Commands::Audit(args) => audit::execute(args, context).await,
        Commands::Schema(args) => schema::execute(args, context).await,
        Commands::Config(args) => config::execute(args, context).await,
    }
}

pub fn default_command() -> Commands {
    Commands::Permissions(PermissionArgs::list_all())
}
