//! Protocol core for a sidechannel multiplexed inside someone else's connection.
//!
//! The pieces, bottom-up: [`envelope`] frames and [`multiplexer`] pulls them out
//! of the host stream; [`dispatcher`] routes decoded messages to the handlers in
//! a [`registry`] after the [`permission`] gate has had its say; [`lifecycle`]
//! keeps transient effects alive; [`correlation`] pairs query responses with
//! their requests; [`main_loop`] serializes everything that touches state.

pub mod audit;
pub mod capability;
pub mod correlation;
pub mod dispatcher;
pub mod envelope;
pub mod event;
pub mod lifecycle;
pub mod main_loop;
pub mod message;
pub mod multiplexer;
pub mod permission;
pub mod registry;

pub use audit::{AuditOutcome, AuditRecord, AuditSink, MemoryAudit, TracingAudit};
pub use capability::Capability;
pub use correlation::CorrelationBus;
pub use dispatcher::{DispatchOutcome, Dispatcher, QueryOutcome};
pub use envelope::{Direction, Frame, FrameError, FrameTag};
pub use event::{ClientEvent, EventError, InputAction};
pub use lifecycle::{Clock, EntryId, LifecycleMap, ManualClock, SystemClock};
pub use main_loop::{MainLoop, MainLoopClosed, MainLoopHandle, MainState};
pub use message::{CodecError, Message, ParamError, ParamValue, SenderIdentity, Wire};
pub use multiplexer::{Intercept, Multiplexer};
pub use permission::{MemoryPermissionStore, PermissionError, PermissionGate, PermissionStore, StoreError};
pub use registry::{Registry, RegistryError};
