use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use dashmap::DashMap;
use strum::IntoEnumIterator;
use thiserror::Error;
use tracing::{debug, info};

use crate::capability::Capability;
use crate::message::SenderIdentity;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("permission store i/o failed")]
    Io(#[from] std::io::Error),

    #[error("permission store is not valid json")]
    Format(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum PermissionError {
    #[error("capability `{0}` cannot be changed")]
    NotChangeable(Capability),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Backing storage for capability overrides.
///
/// `None` as the sender addresses the global table that applies to every
/// sender without its own override. Reads happen on every dispatch and must
/// not fail; writes may.
pub trait PermissionStore: Send + Sync {
    fn get(&self, sender: Option<&str>, capability: Capability) -> Option<bool>;

    /// Upsert an override, or remove it when `value` is `None`.
    fn set(&self, sender: Option<&str>, capability: Capability, value: Option<bool>) -> Result<(), StoreError>;

    fn overrides(&self, sender: Option<&str>) -> BTreeMap<Capability, bool>;

    /// Every sender key that currently has at least one override.
    fn senders(&self) -> Vec<String>;
}

#[derive(Debug, Default)]
pub struct MemoryPermissionStore {
    global: DashMap<Capability, bool>,
    per_sender: DashMap<String, BTreeMap<Capability, bool>>,
}

impl MemoryPermissionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PermissionStore for MemoryPermissionStore {
    fn get(&self, sender: Option<&str>, capability: Capability) -> Option<bool> {
        match sender {
            None => self.global.get(&capability).map(|v| *v),
            Some(key) => self.per_sender.get(key).and_then(|m| m.get(&capability).copied()),
        }
    }

    fn set(&self, sender: Option<&str>, capability: Capability, value: Option<bool>) -> Result<(), StoreError> {
        match (sender, value) {
            (None, Some(v)) => {
                self.global.insert(capability, v);
            }
            (None, None) => {
                self.global.remove(&capability);
            }
            (Some(key), Some(v)) => {
                self.per_sender.entry(key.to_string()).or_default().insert(capability, v);
            }
            (Some(key), None) => {
                self.per_sender.remove_if_mut(key, |_, m| {
                    m.remove(&capability);
                    m.is_empty()
                });
            }
        }
        Ok(())
    }

    fn overrides(&self, sender: Option<&str>) -> BTreeMap<Capability, bool> {
        match sender {
            None => self.global.iter().map(|e| (*e.key(), *e.value())).collect(),
            Some(key) => self.per_sender.get(key).map(|m| m.clone()).unwrap_or_default(),
        }
    }

    fn senders(&self) -> Vec<String> {
        self.per_sender.iter().map(|e| e.key().clone()).collect()
    }
}

/// Decides whether a sender may use a capability.
///
/// Resolution order: per-sender override, then global override, then the
/// capability's default. Capabilities that are not user changeable always
/// resolve to their default, whatever the store says.
#[derive(Clone)]
pub struct PermissionGate {
    store: Arc<dyn PermissionStore>,
}

impl std::fmt::Debug for PermissionGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PermissionGate")
            .field("senders", &self.store.senders().len())
            .finish()
    }
}

impl Default for PermissionGate {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl PermissionGate {
    pub fn new(store: Arc<dyn PermissionStore>) -> Self {
        Self { store }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryPermissionStore::new()))
    }

    pub fn store(&self) -> &Arc<dyn PermissionStore> {
        &self.store
    }

    pub fn is_granted(&self, sender: Option<&SenderIdentity>, capability: Capability) -> bool {
        self.is_granted_key(sender.map(|s| s.stable_key.as_str()), capability)
    }

    pub fn is_granted_key(&self, sender: Option<&str>, capability: Capability) -> bool {
        if !capability.user_changeable() {
            return capability.default_granted();
        }
        if let Some(key) = sender {
            if let Some(v) = self.store.get(Some(key), capability) {
                return v;
            }
        }
        self.fallback(capability)
    }

    /// What a sender without its own override gets.
    fn fallback(&self, capability: Capability) -> bool {
        self.store
            .get(None, capability)
            .unwrap_or_else(|| capability.default_granted())
    }

    pub fn set_granted(
        &self,
        sender: Option<&str>,
        capability: Capability,
        value: bool,
    ) -> Result<(), PermissionError> {
        if !capability.user_changeable() {
            return Err(PermissionError::NotChangeable(capability));
        }

        // a sender value is only redundant while no global override could
        // later change what it falls back to
        let redundant = value == capability.default_granted()
            && (sender.is_none() || self.store.get(None, capability).is_none());

        if redundant {
            debug!(sender = sender.unwrap_or("*"), %capability, value, "pruning redundant override");
            self.store.set(sender, capability, None)?;
        } else {
            self.store.set(sender, capability, Some(value))?;
        }
        info!(sender = sender.unwrap_or("*"), %capability, value, "permission updated");
        Ok(())
    }

    /// Drop any override, returning the sender to the fallback chain.
    pub fn reset(&self, sender: Option<&str>, capability: Capability) -> Result<(), PermissionError> {
        if !capability.user_changeable() {
            return Err(PermissionError::NotChangeable(capability));
        }
        self.store.set(sender, capability, None)?;
        Ok(())
    }

    pub fn granted(&self, sender: Option<&str>) -> BTreeSet<Capability> {
        Capability::iter()
            .filter(|cap| self.is_granted_key(sender, *cap))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plugin(key: &str) -> SenderIdentity {
        SenderIdentity::new(key, key, "1.0")
    }

    #[test]
    fn defaults_apply_without_overrides() {
        let gate = PermissionGate::in_memory();
        for cap in Capability::iter() {
            assert_eq!(gate.is_granted(Some(&plugin("a")), cap), cap.default_granted());
            assert_eq!(gate.is_granted(None, cap), cap.default_granted());
        }
    }

    #[test]
    fn sender_override_beats_global_beats_default() {
        let gate = PermissionGate::in_memory();
        let a = plugin("a");
        let b = plugin("b");

        gate.set_granted(None, Capability::Draw, false).unwrap();
        assert!(!gate.is_granted(Some(&a), Capability::Draw));
        assert!(!gate.is_granted(Some(&b), Capability::Draw));

        gate.set_granted(Some("a"), Capability::Draw, true).unwrap();
        assert!(gate.is_granted(Some(&a), Capability::Draw));
        assert!(!gate.is_granted(Some(&b), Capability::Draw));
    }

    #[test]
    fn required_cannot_be_changed() {
        let gate = PermissionGate::in_memory();
        for key in ["a", "pluginA", ""] {
            let err = gate.set_granted(Some(key), Capability::Required, false).unwrap_err();
            assert!(matches!(err, PermissionError::NotChangeable(Capability::Required)));
            assert!(gate.is_granted(Some(&plugin(key)), Capability::Required));
        }
        assert!(gate.set_granted(None, Capability::Required, false).is_err());
        assert!(gate.store().overrides(None).is_empty());
        assert!(gate.store().senders().is_empty());
    }

    #[test]
    fn stale_store_entry_for_required_is_ignored() {
        let store = Arc::new(MemoryPermissionStore::new());
        store.set(Some("a"), Capability::Required, Some(false)).unwrap();
        let gate = PermissionGate::new(store);
        assert!(gate.is_granted_key(Some("a"), Capability::Required));
    }

    #[test]
    fn override_equal_to_fallback_is_pruned() {
        let gate = PermissionGate::in_memory();
        gate.set_granted(Some("a"), Capability::Audio, false).unwrap();
        assert_eq!(gate.store().overrides(Some("a")).get(&Capability::Audio), Some(&false));

        gate.set_granted(Some("a"), Capability::Audio, true).unwrap();
        assert!(gate.store().overrides(Some("a")).is_empty());
        assert!(gate.store().senders().is_empty());
        assert!(gate.is_granted_key(Some("a"), Capability::Audio));
    }

    #[test]
    fn sender_decision_survives_a_global_reset() {
        let gate = PermissionGate::in_memory();
        gate.set_granted(None, Capability::Draw, false).unwrap();
        gate.set_granted(Some("pluginA"), Capability::Draw, false).unwrap();
        assert_eq!(gate.store().overrides(Some("pluginA")).get(&Capability::Draw), Some(&false));

        gate.reset(None, Capability::Draw).unwrap();
        assert!(!gate.is_granted_key(Some("pluginA"), Capability::Draw));
        assert!(gate.is_granted_key(Some("pluginB"), Capability::Draw));
    }

    #[test]
    fn reset_returns_to_fallback() {
        let gate = PermissionGate::in_memory();
        gate.set_granted(Some("a"), Capability::ReadSystemProperties, true).unwrap();
        assert!(gate.is_granted_key(Some("a"), Capability::ReadSystemProperties));

        gate.reset(Some("a"), Capability::ReadSystemProperties).unwrap();
        assert!(!gate.is_granted_key(Some("a"), Capability::ReadSystemProperties));
    }

    #[test]
    fn granted_lists_the_effective_set() {
        let gate = PermissionGate::in_memory();
        gate.set_granted(Some("a"), Capability::Draw, false).unwrap();
        gate.set_granted(Some("a"), Capability::OpenLinks, false).unwrap();
        gate.set_granted(Some("a"), Capability::ChangePreferences, true).unwrap();

        let granted = gate.granted(Some("a"));
        assert!(granted.contains(&Capability::Required));
        assert!(granted.contains(&Capability::ChangePreferences));
        assert!(!granted.contains(&Capability::Draw));
        assert!(!granted.contains(&Capability::OpenLinks));
    }
}
