use std::fmt;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display};
use tracing::{info, warn};

use crate::capability::Capability;
use crate::message::SenderIdentity;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, AsRefStr, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AuditOutcome {
    /// An instruction or query left this side.
    Sent,
    /// A handler was invoked for an inbound instruction or query.
    Received,
    Denied,
    UnknownId,
    Faulted,
}

impl AuditOutcome {
    /// Severity used when the record is written to a text log.
    pub fn level(self) -> &'static str {
        match self {
            AuditOutcome::Sent | AuditOutcome::Received => "INFO",
            AuditOutcome::Denied | AuditOutcome::UnknownId => "WARN",
            AuditOutcome::Faulted => "ERROR",
        }
    }
}

/// One line of the operator-facing audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct AuditRecord {
    pub timestamp: DateTime<Utc>,
    pub outcome: AuditOutcome,
    pub sender_key: String,
    pub sender_name: String,
    pub logical_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capability: Option<Capability>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl AuditRecord {
    pub fn new(outcome: AuditOutcome, sender: &SenderIdentity, logical_id: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            outcome,
            sender_key: sender.stable_key.clone(),
            sender_name: sender.display_name.clone(),
            logical_id: logical_id.into(),
            capability: None,
            detail: None,
        }
    }

    pub fn with_capability(mut self, capability: Capability) -> Self {
        self.capability = Some(capability);
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

impl fmt::Display for AuditRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} `{}` from {} ({})", self.outcome, self.logical_id, self.sender_name, self.sender_key)?;
        if let Some(cap) = self.capability {
            write!(f, " [{cap}]")?;
        }
        if let Some(detail) = &self.detail {
            write!(f, ": {detail}")?;
        }
        Ok(())
    }
}

/// Where audit records go. Implementations must not fail the caller: a
/// broken audit trail is logged, never propagated into dispatch.
pub trait AuditSink: Send + Sync {
    fn record(&self, record: AuditRecord);
}

/// Forwards records to `tracing` only.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAudit;

impl AuditSink for TracingAudit {
    fn record(&self, record: AuditRecord) {
        match record.outcome {
            AuditOutcome::Sent | AuditOutcome::Received => info!(target: "sidechannel::audit", "{record}"),
            _ => warn!(target: "sidechannel::audit", "{record}"),
        }
    }
}

/// Keeps records in memory. Mostly useful for tests and the demo.
#[derive(Debug, Default)]
pub struct MemoryAudit {
    records: Mutex<Vec<AuditRecord>>,
}

impl MemoryAudit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn count(&self, outcome: AuditOutcome) -> usize {
        self.records
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .filter(|r| r.outcome == outcome)
            .count()
    }

    pub fn clear(&self) {
        self.records.lock().unwrap_or_else(|p| p.into_inner()).clear();
    }
}

impl AuditSink for MemoryAudit {
    fn record(&self, record: AuditRecord) {
        self.records.lock().unwrap_or_else(|p| p.into_inner()).push(record);
    }
}
