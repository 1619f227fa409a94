use anyhow::Context;
use clap::{Args, Subcommand};
use sidechannel::permission_file::FilePermissionStore;
use sidechannel::protocol::{Capability, PermissionGate, PermissionStore};
use std::sync::Arc;
use strum::IntoEnumIterator;

use super::CliContext;

#[derive(Args, Debug)]
pub struct PermissionArgs {
    #[command(subcommand)]
    pub command: PermissionCommands,
}

impl PermissionArgs {
    pub fn list_all() -> Self {
        Self {
            command: PermissionCommands::List { sender: None },
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum PermissionCommands {
    /// Effective permissions, globally or for one sender
    List {
        #[arg(long)]
        sender: Option<String>,
    },
    /// Senders the client has heard from
    Senders,
    /// Grant or deny a capability
    Set {
        capability: Capability,
        #[arg(action = clap::ArgAction::Set)]
        granted: bool,
        #[arg(long)]
        sender: Option<String>,
    },
    /// Drop an override so the capability falls back again
    Reset {
        capability: Capability,
        #[arg(long)]
        sender: Option<String>,
    },
    /// Forget everything stored about a sender
    Forget { sender: String },
}

pub async fn execute(args: PermissionArgs, context: &CliContext) -> anyhow::Result<()> {
    let path = context.settings.permissions_file();
    let store = Arc::new(
        FilePermissionStore::open(&path).with_context(|| format!("could not open {}", path.display()))?,
    );
    let gate = PermissionGate::new(store.clone());

    match args.command {
        PermissionCommands::List { sender } => {
            let overrides = store.overrides(sender.as_deref());
            let scope = sender.as_deref().unwrap_or("everyone");
            println!("Permissions for {scope}:");
            for capability in Capability::iter() {
                let granted = gate.is_granted_key(sender.as_deref(), capability);
                let mark = if granted { "✅" } else { "❌" };
                let note = if overrides.contains_key(&capability) { " (override)" } else { "" };
                println!("  {mark} {capability}{note}");
            }
            let with_overrides = store.senders();
            if sender.is_none() && !with_overrides.is_empty() {
                println!("Senders with their own overrides: {}", with_overrides.join(", "));
            }
        }
        PermissionCommands::Senders => {
            let known = store.known_senders();
            if known.is_empty() {
                println!("No senders recorded yet.");
            }
            for entry in known {
                let seen = entry
                    .last_seen
                    .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                    .unwrap_or_else(|| "never".to_string());
                println!("  {} [{}] last seen {seen}", entry.identity, entry.identity.stable_key);
            }
        }
        PermissionCommands::Set {
            capability,
            granted,
            sender,
        } => {
            gate.set_granted(sender.as_deref(), capability, granted)?;
            let verb = if granted { "granted" } else { "denied" };
            println!("✅ {capability} {verb} for {}.", sender.as_deref().unwrap_or("everyone"));
        }
        PermissionCommands::Reset { capability, sender } => {
            gate.reset(sender.as_deref(), capability)?;
            println!("✅ {capability} reset for {}.", sender.as_deref().unwrap_or("everyone"));
        }
        PermissionCommands::Forget { sender } => {
            if store.forget(&sender)? {
                println!("✅ Forgot {sender}.");
            } else {
                println!("Nothing stored about {sender}.");
            }
        }
    }
    Ok(())
}
