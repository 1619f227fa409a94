use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::audit::{AuditOutcome, AuditRecord, AuditSink, TracingAudit};
use crate::capability::Capability;
use crate::message::{Message, ParamValue, SenderIdentity};
use crate::permission::PermissionGate;
use crate::registry::{Registry, RegistryError};

/// Runs one instruction against the receiving side's state.
pub type InstructionHandler<C> =
    Box<dyn Fn(&mut C, &Message, &SenderIdentity) -> anyhow::Result<()> + Send + Sync>;

/// Computes the value of one query against the receiving side's state.
pub type QueryHandler<C> =
    Box<dyn Fn(&mut C, &Message, &SenderIdentity) -> anyhow::Result<ParamValue> + Send + Sync>;

/// What happened to one dispatched message. Never an error: every outcome
/// has already been logged and audited by the time it is returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Invoked,
    UnknownId,
    Denied(Capability),
    Faulted(String),
}

impl DispatchOutcome {
    pub fn invoked(&self) -> bool {
        matches!(self, DispatchOutcome::Invoked)
    }
}

/// Outcome of answering a query. Anything but `Answered` means the client
/// stays silent and no response frame is written.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryOutcome {
    Answered(ParamValue),
    Refused(DispatchOutcome),
}

/// Looks up handlers by logical id, checks the sender's capability and
/// invokes them, isolating the caller from anything a handler does wrong.
///
/// `C` is the receiving side's mutable state. The dispatcher is meant to be
/// driven from that side's main loop only.
pub struct Dispatcher<C> {
    instructions: Registry<InstructionHandler<C>>,
    queries: Registry<QueryHandler<C>>,
    gate: PermissionGate,
    audit: Arc<dyn AuditSink>,
}

impl<C> std::fmt::Debug for Dispatcher<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("instructions", &self.instructions)
            .field("queries", &self.queries)
            .finish()
    }
}

impl<C> Dispatcher<C> {
    pub fn new(gate: PermissionGate) -> Self {
        Self {
            instructions: Registry::new(),
            queries: Registry::new(),
            gate,
            audit: Arc::new(TracingAudit),
        }
    }

    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    pub fn with_instructions(mut self, instructions: Registry<InstructionHandler<C>>) -> Self {
        self.instructions = instructions;
        self
    }

    pub fn with_queries(mut self, queries: Registry<QueryHandler<C>>) -> Self {
        self.queries = queries;
        self
    }

    pub fn instruction<F>(mut self, logical_id: &str, capability: Capability, handler: F) -> Result<Self, RegistryError>
    where
        F: Fn(&mut C, &Message, &SenderIdentity) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.instructions.register(logical_id, capability, Box::new(handler))?;
        Ok(self)
    }

    pub fn query<F>(mut self, logical_id: &str, capability: Capability, handler: F) -> Result<Self, RegistryError>
    where
        F: Fn(&mut C, &Message, &SenderIdentity) -> anyhow::Result<ParamValue> + Send + Sync + 'static,
    {
        self.queries.register(logical_id, capability, Box::new(handler))?;
        Ok(self)
    }

    pub fn gate(&self) -> &PermissionGate {
        &self.gate
    }

    pub fn instructions(&self) -> &Registry<InstructionHandler<C>> {
        &self.instructions
    }

    pub fn queries(&self) -> &Registry<QueryHandler<C>> {
        &self.queries
    }

    /// Dispatch one inbound instruction.
    pub fn dispatch(&self, ctx: &mut C, message: &Message, sender: &SenderIdentity) -> DispatchOutcome {
        let id = message.logical_id();
        let Some(registration) = self.instructions.lookup(id) else {
            warn!(logical_id = id, %sender, "no handler registered for instruction");
            self.audit.record(AuditRecord::new(AuditOutcome::UnknownId, sender, id));
            return DispatchOutcome::UnknownId;
        };

        if let Some(denied) = self.check(registration.capability, id, sender) {
            return denied;
        }

        let result = catch_unwind(AssertUnwindSafe(|| (registration.handler)(ctx, message, sender)));
        match flatten(result) {
            Ok(()) => {
                debug!(logical_id = id, %sender, "instruction handled");
                let record = AuditRecord::new(AuditOutcome::Received, sender, id);
                self.audit.record(record.with_capability(registration.capability));
                DispatchOutcome::Invoked
            }
            Err(cause) => self.fault(registration.capability, id, sender, cause),
        }
    }

    /// Answer one inbound query. Denied, unknown and faulted queries are
    /// audited and come back as `Refused`.
    pub fn respond(&self, ctx: &mut C, query: &Message, sender: &SenderIdentity) -> QueryOutcome {
        let id = query.logical_id();
        let Some(registration) = self.queries.lookup(id) else {
            warn!(logical_id = id, %sender, "no responder registered for query");
            self.audit.record(AuditRecord::new(AuditOutcome::UnknownId, sender, id));
            return QueryOutcome::Refused(DispatchOutcome::UnknownId);
        };

        if let Some(denied) = self.check(registration.capability, id, sender) {
            return QueryOutcome::Refused(denied);
        }

        let result = catch_unwind(AssertUnwindSafe(|| (registration.handler)(ctx, query, sender)));
        match flatten(result) {
            Ok(value) => {
                let record = AuditRecord::new(AuditOutcome::Received, sender, id);
                self.audit.record(record.with_capability(registration.capability));
                QueryOutcome::Answered(value)
            }
            Err(cause) => QueryOutcome::Refused(self.fault(registration.capability, id, sender, cause)),
        }
    }

    fn check(&self, capability: Capability, id: &str, sender: &SenderIdentity) -> Option<DispatchOutcome> {
        if self.gate.is_granted(Some(sender), capability) {
            return None;
        }
        warn!(logical_id = id, %sender, %capability, "permission denied");
        self.audit
            .record(AuditRecord::new(AuditOutcome::Denied, sender, id).with_capability(capability));
        Some(DispatchOutcome::Denied(capability))
    }

    fn fault(&self, capability: Capability, id: &str, sender: &SenderIdentity, cause: String) -> DispatchOutcome {
        error!(logical_id = id, %sender, "handler failed: {cause}");
        self.audit.record(
            AuditRecord::new(AuditOutcome::Faulted, sender, id)
                .with_capability(capability)
                .with_detail(cause.clone()),
        );
        DispatchOutcome::Faulted(cause)
    }
}

fn flatten<T>(result: Result<anyhow::Result<T>, Box<dyn Any + Send>>) -> Result<T, String> {
    match result {
        Ok(Ok(v)) => Ok(v),
        Ok(Err(err)) => Err(format!("{err:#}")),
        Err(panic) => Err(format!("handler panicked: {}", panic_message(panic.as_ref()))),
    }
}

/// Best-effort text of a caught panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "<non-string panic payload>".to_string()
    }
}
