//! Server side of the sidechannel: sends instructions, asks queries and
//! listens to client events.

use std::collections::{BTreeMap, HashMap};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use bytes::Bytes;
use sidechannel_protocol::dispatcher::panic_message;
use sidechannel_protocol::{
    AuditOutcome, AuditRecord, AuditSink, Capability, ClientEvent, CodecError, CorrelationBus, Frame, Message,
    Multiplexer, ParamValue, PermissionGate, SenderIdentity, TracingAudit, Wire,
};
use thiserror::Error;
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::catalog;
use crate::transport::{PacketSink, TransportError, pump};

pub type EventListener = Arc<dyn Fn(&ClientEvent) + Send + Sync>;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("`{logical_id}` needs `{capability}`, which the client has not granted to this sender")]
    Denied {
        logical_id: String,
        capability: Capability,
    },

    #[error("no response to query {0} before the deadline")]
    TimedOut(Uuid),

    #[error("query {0} was dropped before it was answered")]
    Abandoned(Uuid),

    #[error("unexpected answer to `{logical_id}`: {detail}")]
    Unexpected { logical_id: String, detail: String },
}

/// What became of an instruction handed to [`ServerSession::send_instruction`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    /// The local copy of the client's permissions says no; nothing was sent.
    SkippedDenied(Capability),
}

/// One server's view of one client connection.
///
/// The permission gate here is a cache of what the client reported through
/// `sender_permissions`. It only saves round trips; the client enforces.
#[derive(Clone)]
pub struct ServerSession {
    sink: Arc<dyn PacketSink>,
    bus: CorrelationBus,
    gate: PermissionGate,
    audit: Arc<dyn AuditSink>,
    bindings: Arc<HashMap<String, Capability>>,
    listeners: Arc<RwLock<Vec<EventListener>>>,
    query_timeout: Option<Duration>,
}

impl std::fmt::Debug for ServerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerSession")
            .field("bus", &self.bus)
            .field("bindings", &self.bindings.len())
            .field("query_timeout", &self.query_timeout)
            .finish()
    }
}

impl ServerSession {
    pub fn new(sink: Arc<dyn PacketSink>) -> Self {
        Self {
            sink,
            bus: CorrelationBus::new(),
            gate: PermissionGate::in_memory(),
            audit: Arc::new(TracingAudit),
            bindings: Arc::new(catalog::bindings()),
            listeners: Arc::new(RwLock::new(Vec::new())),
            query_timeout: None,
        }
    }

    pub fn with_gate(mut self, gate: PermissionGate) -> Self {
        self.gate = gate;
        self
    }

    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    /// Deadline applied by [`query_value`](Self::query_value). `None` waits forever.
    pub fn with_query_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.query_timeout = timeout;
        self
    }

    pub fn bus(&self) -> &CorrelationBus {
        &self.bus
    }

    pub fn gate(&self) -> &PermissionGate {
        &self.gate
    }

    /// The capability that would stop `logical_id` from `sender`, if any.
    /// Ids the server does not know are let through for the client to judge.
    pub fn precheck(&self, logical_id: &str, sender: &SenderIdentity) -> Option<Capability> {
        let capability = *self.bindings.get(logical_id)?;
        (!self.gate.is_granted(Some(sender), capability)).then_some(capability)
    }

    /// Send one instruction. Nothing is retried; a failed write is returned.
    pub async fn send_instruction(&self, message: &Message, sender: &SenderIdentity) -> Result<Delivery, SessionError> {
        let id = message.logical_id();
        if let Some(capability) = self.precheck(id, sender) {
            debug!(logical_id = id, %sender, %capability, "client would refuse, not sending");
            return Ok(Delivery::SkippedDenied(capability));
        }

        let frame = Frame::Instruction {
            message: message.to_wire()?,
            sender: sender.to_wire()?,
        };
        self.sink.send_frame(&frame).await?;

        let mut record = AuditRecord::new(AuditOutcome::Sent, sender, id);
        if let Some(capability) = self.bindings.get(id) {
            record = record.with_capability(*capability);
        }
        self.audit.record(record);
        Ok(Delivery::Sent)
    }

    /// Ask a query and park `continuation` until the response arrives.
    ///
    /// A refused query is never answered, so the continuation may never run.
    pub async fn query<F>(
        &self,
        query: &Message,
        sender: &SenderIdentity,
        continuation: F,
    ) -> Result<Uuid, SessionError>
    where
        F: FnOnce(Bytes) + Send + Sync + 'static,
    {
        let encoded = query.to_wire()?;
        let sender_block = sender.to_wire()?;
        let request_id = self.bus.new_request(continuation);
        let frame = Frame::QueryRequest {
            request_id,
            query: encoded,
            sender: sender_block,
        };
        if let Err(err) = self.sink.send_frame(&frame).await {
            self.bus.abandon(request_id);
            return Err(err.into());
        }
        let record = AuditRecord::new(AuditOutcome::Sent, sender, query.logical_id());
        self.audit.record(record.with_detail(request_id.to_string()));
        Ok(request_id)
    }

    /// Ask a query and wait for its value, honouring the session's deadline.
    pub async fn query_value(&self, query: &Message, sender: &SenderIdentity) -> Result<ParamValue, SessionError> {
        match self.query_timeout {
            Some(timeout) => self.query_value_timeout(query, sender, timeout).await,
            None => {
                let (request_id, rx) = self.ask(query, sender).await?;
                let raw = rx.await.map_err(|_| SessionError::Abandoned(request_id))?;
                Ok(ParamValue::from_wire(&raw)?)
            }
        }
    }

    /// Ask a query and give up after `timeout`, forgetting the request.
    pub async fn query_value_timeout(
        &self,
        query: &Message,
        sender: &SenderIdentity,
        timeout: Duration,
    ) -> Result<ParamValue, SessionError> {
        let (request_id, rx) = self.ask(query, sender).await?;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(raw)) => Ok(ParamValue::from_wire(&raw)?),
            Ok(Err(_)) => Err(SessionError::Abandoned(request_id)),
            Err(_) => {
                self.bus.abandon(request_id);
                warn!(%request_id, logical_id = query.logical_id(), "query timed out");
                Err(SessionError::TimedOut(request_id))
            }
        }
    }

    async fn ask(
        &self,
        query: &Message,
        sender: &SenderIdentity,
    ) -> Result<(Uuid, tokio::sync::oneshot::Receiver<Bytes>), SessionError> {
        // the client would never answer, so don't wait on it
        if let Some(capability) = self.precheck(query.logical_id(), sender) {
            return Err(SessionError::Denied {
                logical_id: query.logical_id().to_string(),
                capability,
            });
        }
        let (tx, rx) = tokio::sync::oneshot::channel();
        let request_id = self
            .query(query, sender, move |value| {
                let _ = tx.send(value);
            })
            .await?;
        Ok((request_id, rx))
    }

    /// Ask the client what `sender` may do and cache the answer in the local gate.
    pub async fn refresh_permissions(
        &self,
        sender: &SenderIdentity,
    ) -> Result<BTreeMap<Capability, bool>, SessionError> {
        let value = self
            .query_value(&Message::bare(catalog::SENDER_PERMISSIONS), sender)
            .await?;
        let unexpected = |detail: String| SessionError::Unexpected {
            logical_id: catalog::SENDER_PERMISSIONS.to_string(),
            detail,
        };
        let map = value
            .as_map()
            .ok_or_else(|| unexpected(format!("expected a map, got {}", value.kind())))?;

        let mut granted = BTreeMap::new();
        for (name, flag) in map {
            let Ok(capability) = name.parse::<Capability>() else {
                debug!(capability = %name, "client reported an unknown capability");
                continue;
            };
            let flag = flag
                .as_bool()
                .ok_or_else(|| unexpected(format!("`{name}` is {}, not a bool", flag.kind())))?;
            granted.insert(capability, flag);
            if !capability.user_changeable() {
                continue;
            }
            if let Err(err) = self.gate.set_granted(Some(&sender.stable_key), capability, flag) {
                error!(%sender, %capability, "could not cache permission: {err}");
            }
        }
        info!(%sender, granted = granted.values().filter(|g| **g).count(), "permissions refreshed");
        Ok(granted)
    }

    /// Register `listener` for every event the client emits.
    pub fn on_event<F>(&self, listener: F)
    where
        F: Fn(&ClientEvent) + Send + Sync + 'static,
    {
        self.listeners
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .push(Arc::new(listener));
    }

    /// Handle one frame read off the connection, running event listeners in place.
    pub fn handle_frame(&self, frame: Frame) {
        if let Some(event) = self.take_event(frame) {
            self.deliver(&event);
        }
    }

    /// Resolve responses on the spot and hand back decoded events.
    fn take_event(&self, frame: Frame) -> Option<ClientEvent> {
        match frame {
            Frame::QueryResponse { request_id, value } => {
                self.bus.resolve(request_id, value);
                None
            }
            Frame::ClientEvent { event_id, params } => match ClientEvent::decode(event_id, &params) {
                Ok(event) => Some(event),
                Err(err) => {
                    warn!(event_id, "dropping client event: {err}");
                    None
                }
            },
            other => {
                warn!(tag = ?other.tag(), "server received a client-bound frame");
                None
            }
        }
    }

    /// A panicking listener is logged and skipped; the others still run.
    fn deliver(&self, event: &ClientEvent) {
        let listeners = self.listeners.read().unwrap_or_else(|p| p.into_inner()).clone();
        for (index, listener) in listeners.iter().enumerate() {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| listener(event))) {
                error!(
                    event = event.name(),
                    listener = index,
                    "event listener panicked: {}",
                    panic_message(panic.as_ref())
                );
            }
        }
    }

    /// Read the connection on a background task until it closes.
    ///
    /// Responses are resolved by the reader. Events are queued to a second
    /// task so listeners never run on the network path.
    pub fn spawn_reader<R>(
        &self,
        reader: R,
        host: mpsc::UnboundedSender<Bytes>,
    ) -> JoinHandle<Result<(), TransportError>>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel::<ClientEvent>();
        let listeners = self.clone();
        tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                listeners.deliver(&event);
            }
        });

        let session = self.clone();
        tokio::spawn(async move {
            pump(reader, Multiplexer::server(), host, |frame| {
                if let Some(event) = session.take_event(frame) {
                    if events_tx.send(event).is_err() {
                        warn!("event task is gone, dropping client event");
                    }
                }
            })
            .await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{ChannelSink, FramedSink};
    use sidechannel_protocol::MemoryAudit;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn plugin_a() -> SenderIdentity {
        SenderIdentity::new("pluginA", "Plugin A", "1.0")
    }

    fn session() -> (ServerSession, mpsc::UnboundedReceiver<Bytes>, Arc<MemoryAudit>) {
        let (sink, rx) = ChannelSink::new();
        let audit = Arc::new(MemoryAudit::new());
        let session = ServerSession::new(Arc::new(sink)).with_audit(audit.clone());
        (session, rx, audit)
    }

    fn next_frame(rx: &mut mpsc::UnboundedReceiver<Bytes>) -> Frame {
        let mut packet = rx.try_recv().unwrap();
        Frame::decode(&mut packet).unwrap()
    }

    #[tokio::test]
    async fn instructions_are_sent_and_audited() {
        let (session, mut rx, audit) = session();
        let msg = Message::new(catalog::DRAW_TEXT, vec!["hi".into(), 0.into(), 0.into(), 0.into(), 100.into()]);

        assert_eq!(session.send_instruction(&msg, &plugin_a()).await.unwrap(), Delivery::Sent);
        let Frame::Instruction { message, sender } = next_frame(&mut rx) else {
            panic!("expected an instruction");
        };
        assert_eq!(Message::from_wire(&message).unwrap(), msg);
        assert_eq!(SenderIdentity::from_wire(&sender).unwrap().stable_key, "pluginA");
        assert_eq!(audit.count(AuditOutcome::Sent), 1);
    }

    #[tokio::test]
    async fn precheck_skips_what_the_client_would_refuse() {
        let (session, mut rx, audit) = session();
        session.gate().set_granted(Some("pluginA"), Capability::Draw, false).unwrap();

        let delivery = session
            .send_instruction(&Message::bare(catalog::CLEAR_OVERLAYS), &plugin_a())
            .await
            .unwrap();
        assert_eq!(delivery, Delivery::SkippedDenied(Capability::Draw));
        assert!(rx.try_recv().is_err());
        assert_eq!(audit.count(AuditOutcome::Sent), 0);

        // unknown ids are the client's call
        let delivery = session.send_instruction(&Message::bare("teleport"), &plugin_a()).await.unwrap();
        assert_eq!(delivery, Delivery::Sent);
    }

    #[tokio::test]
    async fn responses_resolve_their_query() {
        let (session, mut rx, _) = session();
        let got = Arc::new(Mutex::new(None));
        let slot = got.clone();
        let id = session
            .query(&Message::bare(catalog::FPS), &plugin_a(), move |v| {
                *slot.lock().unwrap() = Some(ParamValue::from_wire(&v).unwrap());
            })
            .await
            .unwrap();

        let Frame::QueryRequest { request_id, .. } = next_frame(&mut rx) else {
            panic!("expected a query");
        };
        assert_eq!(request_id, id);
        assert!(session.bus().is_pending(id));

        session.handle_frame(Frame::QueryResponse {
            request_id: id,
            value: ParamValue::Int(60).to_wire().unwrap(),
        });
        assert_eq!(*got.lock().unwrap(), Some(ParamValue::Int(60)));
        assert_eq!(session.bus().pending_count(), 0);

        // a second response for the same id is ignored
        session.handle_frame(Frame::QueryResponse {
            request_id: id,
            value: ParamValue::Int(1).to_wire().unwrap(),
        });
        assert_eq!(*got.lock().unwrap(), Some(ParamValue::Int(60)));
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_query_times_out_and_is_forgotten() {
        let (session, _rx, _) = session();
        let err = session
            .query_value_timeout(&Message::bare("weather"), &plugin_a(), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::TimedOut(_)));
        assert_eq!(session.bus().pending_count(), 0);
    }

    #[tokio::test]
    async fn locally_denied_query_is_not_sent() {
        let (session, mut rx, _) = session();
        // off by default
        let err = session
            .query_value(&Message::bare(catalog::FREE_MEMORY), &plugin_a())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SessionError::Denied { capability: Capability::ReadSystemProperties, .. }
        ));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn failed_send_does_not_leave_a_pending_query() {
        let (session, rx, _) = session();
        drop(rx);
        let err = session.query(&Message::bare(catalog::FPS), &plugin_a(), |_| {}).await.unwrap_err();
        assert!(matches!(err, SessionError::Transport(TransportError::PeerGone)));
        assert_eq!(session.bus().pending_count(), 0);
    }

    #[tokio::test]
    async fn events_reach_every_listener() {
        let (session, _rx, _) = session();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for _ in 0..2 {
            let seen = seen.clone();
            session.on_event(move |e| seen.lock().unwrap().push(e.clone()));
        }

        let event = ClientEvent::ButtonClicked {
            button: "play".into(),
            screen: "title".into(),
        };
        session.handle_frame(event.to_frame().unwrap());
        session.handle_frame(Frame::ClientEvent {
            event_id: 42,
            params: Bytes::from_static(b"{}"),
        });

        assert_eq!(*seen.lock().unwrap(), vec![event.clone(), event]);
    }

    #[tokio::test]
    async fn a_panicking_listener_does_not_stop_the_others() {
        let (session, _rx, _) = session();
        let seen = Arc::new(AtomicUsize::new(0));
        session.on_event(|_| panic!("listener bug"));
        {
            let seen = seen.clone();
            session.on_event(move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
            });
        }

        let event = ClientEvent::ScreenChanged {
            old: None,
            new: Some("options".into()),
        };
        session.handle_frame(event.to_frame().unwrap());
        session.handle_frame(event.to_frame().unwrap());
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn reader_survives_a_panicking_listener() {
        let (client_end, server_end) = tokio::io::duplex(4096);
        let (sink, mut rx) = ChannelSink::new();
        let session = ServerSession::new(Arc::new(sink));
        session.on_event(|_| panic!("listener bug"));
        let (host_tx, _host_rx) = mpsc::unbounded_channel();
        let reader = session.spawn_reader(server_end, host_tx);
        let client = FramedSink::new(client_end);

        let event = ClientEvent::ScreenChanged {
            old: None,
            new: Some("options".into()),
        };
        client.send_frame(&event.to_frame().unwrap()).await.unwrap();

        let answer = {
            let session = session.clone();
            tokio::spawn(async move {
                session
                    .query_value_timeout(&Message::bare(catalog::OPERATING_SYSTEM), &plugin_a(), Duration::from_secs(5))
                    .await
            })
        };
        let request_id = loop {
            if let Ok(packet) = rx.try_recv() {
                let Frame::QueryRequest { request_id, .. } = Frame::decode(&mut packet.clone()).unwrap() else {
                    panic!("expected a query");
                };
                break request_id;
            }
            tokio::task::yield_now().await;
        };
        client
            .send_frame(&Frame::QueryResponse {
                request_id,
                value: ParamValue::from("linux").to_wire().unwrap(),
            })
            .await
            .unwrap();

        assert_eq!(answer.await.unwrap().unwrap(), ParamValue::from("linux"));
        assert!(!reader.is_finished());
    }
}
