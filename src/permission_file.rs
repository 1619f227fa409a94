use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use chrono::{DateTime, TimeDelta, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use sidechannel_protocol::{Capability, PermissionStore, SenderIdentity, StoreError};
use tracing::{debug, error, info};

/// A sighting only rewrites `last_seen` once the stored one is this old.
const LAST_SEEN_RESOLUTION: TimeDelta = TimeDelta::seconds(60);

/// On-disk layout of the permission store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PermissionDocument {
    /// Global overrides that apply to every sender without its own.
    #[serde(default)]
    pub permissions: BTreeMap<Capability, bool>,
    #[serde(default)]
    pub senders: BTreeMap<String, SenderEntry>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct SenderEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<SenderIdentity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
    #[serde(default)]
    pub permissions: BTreeMap<Capability, bool>,
}

impl SenderEntry {
    fn is_empty(&self) -> bool {
        self.identity.is_none() && self.permissions.is_empty()
    }
}

/// A sender the client has heard from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct KnownSender {
    pub identity: SenderIdentity,
    pub last_seen: Option<DateTime<Utc>>,
}

/// Records which senders a client has heard from.
pub trait SenderLedger: Send + Sync {
    fn remember(&self, sender: &SenderIdentity);
}

/// JSON-file backed [`PermissionStore`]. Every mutation is written through
/// before it returns.
#[derive(Debug)]
pub struct FilePermissionStore {
    path: PathBuf,
    doc: RwLock<PermissionDocument>,
}

impl FilePermissionStore {
    /// Open the store at `path`; a missing file is an empty store.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let doc = if path.exists() {
            let raw = fs::read(&path)?;
            if raw.iter().all(u8::is_ascii_whitespace) {
                PermissionDocument::default()
            } else {
                serde_json::from_slice(&raw)?
            }
        } else {
            PermissionDocument::default()
        };
        debug!(path = %path.display(), senders = doc.senders.len(), "opened permission store");
        Ok(Self {
            path,
            doc: RwLock::new(doc),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn document(&self) -> PermissionDocument {
        self.read().clone()
    }

    pub fn known_senders(&self) -> Vec<KnownSender> {
        self.read()
            .senders
            .values()
            .filter_map(|entry| {
                entry.identity.clone().map(|identity| KnownSender {
                    identity,
                    last_seen: entry.last_seen,
                })
            })
            .collect()
    }

    /// Drop everything stored about `stable_key`, overrides included.
    pub fn forget(&self, stable_key: &str) -> Result<bool, StoreError> {
        self.mutate(|doc| doc.senders.remove(stable_key).is_some())
    }

    /// Note a sighting of `sender`. Blank origin or location hint keep what
    /// was stored before. Returns whether the file was rewritten: repeat
    /// sightings with the same metadata are only written once
    /// `last_seen` has gone stale.
    pub fn record_sender(&self, sender: &SenderIdentity) -> Result<bool, StoreError> {
        let now = Utc::now();
        {
            let doc = self.read();
            if let Some(entry) = doc.senders.get(&sender.stable_key) {
                let fresh = entry.last_seen.is_some_and(|seen| now - seen < LAST_SEEN_RESOLUTION);
                let unchanged = entry
                    .identity
                    .as_ref()
                    .is_some_and(|stored| same_metadata(stored, &merge_identity(Some(stored), sender)));
                if fresh && unchanged {
                    return Ok(false);
                }
            }
        }
        self.mutate(|doc| {
            let entry = doc.senders.entry(sender.stable_key.clone()).or_default();
            entry.identity = Some(merge_identity(entry.identity.as_ref(), sender));
            entry.last_seen = Some(now);
        })?;
        Ok(true)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, PermissionDocument> {
        self.doc.read().unwrap_or_else(|p| p.into_inner())
    }

    /// Apply `f` to a copy and only keep it once it is on disk.
    fn mutate<R>(&self, f: impl FnOnce(&mut PermissionDocument) -> R) -> Result<R, StoreError> {
        let mut doc = self.doc.write().unwrap_or_else(|p| p.into_inner());
        let mut next = doc.clone();
        let out = f(&mut next);
        self.persist(&next)?;
        *doc = next;
        Ok(out)
    }

    fn persist(&self, doc: &PermissionDocument) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(doc)?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

fn merge_identity(stored: Option<&SenderIdentity>, seen: &SenderIdentity) -> SenderIdentity {
    let mut identity = seen.clone();
    if let Some(stored) = stored {
        if identity.origin.is_none() {
            identity.origin = stored.origin.clone();
        }
        if identity.location_hint.is_empty() {
            identity.location_hint = stored.location_hint.clone();
        }
    }
    identity
}

// `SenderIdentity` equality only looks at the stable key
fn same_metadata(a: &SenderIdentity, b: &SenderIdentity) -> bool {
    a.display_name == b.display_name
        && a.version == b.version
        && a.origin == b.origin
        && a.location_hint == b.location_hint
}

impl PermissionStore for FilePermissionStore {
    fn get(&self, sender: Option<&str>, capability: Capability) -> Option<bool> {
        let doc = self.read();
        match sender {
            None => doc.permissions.get(&capability).copied(),
            Some(key) => doc
                .senders
                .get(key)
                .and_then(|e| e.permissions.get(&capability).copied()),
        }
    }

    fn set(&self, sender: Option<&str>, capability: Capability, value: Option<bool>) -> Result<(), StoreError> {
        self.mutate(|doc| match (sender, value) {
            (None, Some(v)) => {
                doc.permissions.insert(capability, v);
            }
            (None, None) => {
                doc.permissions.remove(&capability);
            }
            (Some(key), Some(v)) => {
                doc.senders
                    .entry(key.to_string())
                    .or_default()
                    .permissions
                    .insert(capability, v);
            }
            (Some(key), None) => {
                if let Some(entry) = doc.senders.get_mut(key) {
                    entry.permissions.remove(&capability);
                    if entry.is_empty() {
                        doc.senders.remove(key);
                    }
                }
            }
        })?;
        info!(path = %self.path.display(), "permission store saved");
        Ok(())
    }

    fn overrides(&self, sender: Option<&str>) -> BTreeMap<Capability, bool> {
        let doc = self.read();
        match sender {
            None => doc.permissions.clone(),
            Some(key) => doc
                .senders
                .get(key)
                .map(|e| e.permissions.clone())
                .unwrap_or_default(),
        }
    }

    fn senders(&self) -> Vec<String> {
        self.read()
            .senders
            .iter()
            .filter(|(_, e)| !e.permissions.is_empty())
            .map(|(k, _)| k.clone())
            .collect()
    }
}

impl SenderLedger for FilePermissionStore {
    fn remember(&self, sender: &SenderIdentity) {
        if let Err(err) = self.record_sender(sender) {
            error!(sender = %sender, "could not record sender: {err:#}");
        }
    }
}
