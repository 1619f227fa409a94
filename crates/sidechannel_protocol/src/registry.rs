use std::collections::HashMap;

use thiserror::Error;

use crate::capability::Capability;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("logical id `{0}` is already registered")]
    Duplicate(String),
}

/// A handler together with the capability that gates it.
pub struct Registration<H> {
    pub capability: Capability,
    pub handler: H,
}

/// Maps a logical id to exactly one handler. Built once at startup and
/// never mutated afterwards.
pub struct Registry<H> {
    entries: HashMap<String, Registration<H>>,
}

impl<H> Default for Registry<H> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<H> std::fmt::Debug for Registry<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut ids: Vec<_> = self.entries.iter().map(|(id, r)| (id.as_str(), r.capability)).collect();
        ids.sort();
        f.debug_map().entries(ids).finish()
    }
}

impl<H> Registry<H> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from `(logical_id, capability, handler)` triples,
    /// failing on the first duplicate id.
    pub fn from_table<I, S>(table: I) -> Result<Self, RegistryError>
    where
        I: IntoIterator<Item = (S, Capability, H)>,
        S: Into<String>,
    {
        let mut registry = Self::new();
        for (id, capability, handler) in table {
            registry.register(id, capability, handler)?;
        }
        Ok(registry)
    }

    pub fn register(
        &mut self,
        logical_id: impl Into<String>,
        capability: Capability,
        handler: H,
    ) -> Result<(), RegistryError> {
        let logical_id = logical_id.into();
        if self.entries.contains_key(&logical_id) {
            return Err(RegistryError::Duplicate(logical_id));
        }
        self.entries.insert(logical_id, Registration { capability, handler });
        Ok(())
    }

    pub fn lookup(&self, logical_id: &str) -> Option<&Registration<H>> {
        self.entries.get(logical_id)
    }

    pub fn capability_of(&self, logical_id: &str) -> Option<Capability> {
        self.entries.get(logical_id).map(|r| r.capability)
    }

    pub fn contains(&self, logical_id: &str) -> bool {
        self.entries.contains_key(logical_id)
    }

    /// `(logical_id, capability)` pairs, sorted by id.
    pub fn bindings(&self) -> Vec<(String, Capability)> {
        let mut out: Vec<_> = self
            .entries
            .iter()
            .map(|(id, r)| (id.clone(), r.capability))
            .collect();
        out.sort();
        out
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
