use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use schemars::{JsonSchema, schema_for};
use sidechannel_protocol::{AuditRecord, ClientEvent, Message, SenderIdentity};

use crate::config::Settings;
use crate::effects::Overlay;
use crate::permission_file::PermissionDocument;

/// Write a JSON schema for every document the sidechannel reads or writes
/// into `out_dir`, returning the files written.
pub fn write_schema(out_dir: &Path) -> Result<Vec<PathBuf>> {
    fs::create_dir_all(out_dir).with_context(|| format!("could not create {}", out_dir.display()))?;
    Ok(vec![
        write_one::<Message>(out_dir, "message")?,
        write_one::<SenderIdentity>(out_dir, "sender")?,
        write_one::<ClientEvent>(out_dir, "event")?,
        write_one::<Overlay>(out_dir, "overlay")?,
        write_one::<PermissionDocument>(out_dir, "permissions")?,
        write_one::<AuditRecord>(out_dir, "audit-record")?,
        write_one::<Settings>(out_dir, "settings")?,
    ])
}

fn write_one<T: JsonSchema>(out_dir: &Path, name: &str) -> Result<PathBuf> {
    let path = out_dir.join(format!("{name}.schema.json"));
    let json = serde_json::to_string_pretty(&schema_for!(T))?;
    fs::write(&path, json).with_context(|| format!("could not write {}", path.display()))?;
    Ok(path)
}
