use chrono::NaiveDate;
use clap::{Args, Subcommand};
use sidechannel::audit_log::FileAuditLog;

use super::CliContext;

#[derive(Args, Debug)]
pub struct AuditArgs {
    #[command(subcommand)]
    pub command: AuditCommands,
}

#[derive(Subcommand, Debug)]
pub enum AuditCommands {
    /// Print audit lines, the most recent ones by default
    Show {
        #[arg(long, default_value_t = 50)]
        tail: usize,
        /// First day to print (YYYY-MM-DD)
        #[arg(long)]
        from: Option<NaiveDate>,
        /// Last day to print (YYYY-MM-DD), defaults to today
        #[arg(long)]
        to: Option<NaiveDate>,
    },
    /// Days that have a log file
    Days,
    /// Delete every audit log file
    Clean,
}

pub async fn execute(args: AuditArgs, context: &CliContext) -> anyhow::Result<()> {
    let log = FileAuditLog::new(context.settings.audit_dir());
    match args.command {
        AuditCommands::Show { tail, from, to } => {
            let lines = match from {
                Some(from) => log.range(from, to.unwrap_or_else(|| chrono::Utc::now().date_naive()))?,
                None => log.tail(tail)?,
            };
            for line in lines {
                println!("{line}");
            }
        }
        AuditCommands::Days => {
            for day in log.days()? {
                println!("{day}");
            }
        }
        AuditCommands::Clean => {
            let removed = log.clean()?;
            println!("✅ Removed {removed} audit file(s) from {}.", log.dir().display());
        }
    }
    Ok(())
}
