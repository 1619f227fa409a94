//! Client side of the sidechannel: a main loop owning the client's state,
//! a reader that peels frames off the host connection, and a writer that
//! drains everything the client wants to say back to the server.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use sidechannel_protocol::{
    AuditSink, ClientEvent, Clock, Dispatcher, Frame, LifecycleMap, MainLoop, MainLoopClosed, MainLoopHandle,
    MainState, Message, Multiplexer, PermissionGate, QueryOutcome, RegistryError, SenderIdentity, TracingAudit, Wire,
};
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};
use uuid::Uuid;

use crate::catalog;
use crate::effects::{ClientEffects, ClientProperties, Overlay};
use crate::permission_file::SenderLedger;
use crate::transport::{PacketSink, TransportError, pump};

pub const DEFAULT_TICK: Duration = Duration::from_millis(50);

// -----------------------------------------------------------------------------
// State
// -----------------------------------------------------------------------------

/// Everything instruction and query handlers can touch. Lives on the client
/// main loop; nothing else holds a reference to it.
pub struct ClientState {
    pub(crate) effects: Box<dyn ClientEffects>,
    pub(crate) properties: Box<dyn ClientProperties>,
    pub(crate) overlays: LifecycleMap<Overlay>,
    pub(crate) screen: Option<String>,
    pub(crate) events_enabled: bool,
    pub(crate) gate: PermissionGate,
    outbox: mpsc::UnboundedSender<Frame>,
    ledger: Option<Arc<dyn SenderLedger>>,
}

impl ClientState {
    pub fn new(
        effects: Box<dyn ClientEffects>,
        properties: Box<dyn ClientProperties>,
        gate: PermissionGate,
        outbox: mpsc::UnboundedSender<Frame>,
    ) -> Self {
        Self {
            effects,
            properties,
            overlays: LifecycleMap::new(),
            screen: None,
            events_enabled: false,
            gate,
            outbox,
            ledger: None,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.overlays = LifecycleMap::with_clock(clock);
        self
    }

    pub fn with_ledger(mut self, ledger: Arc<dyn SenderLedger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn overlays(&self) -> &LifecycleMap<Overlay> {
        &self.overlays
    }

    pub fn screen(&self) -> Option<&str> {
        self.screen.as_deref()
    }

    pub fn events_enabled(&self) -> bool {
        self.events_enabled
    }

    /// Queue `event` for the server. Events stay local until the server has
    /// pinged; returns whether the event was queued.
    pub fn emit(&mut self, event: ClientEvent) -> bool {
        if !self.events_enabled {
            trace!(event = event.name(), "events not enabled yet, dropping");
            return false;
        }
        match event.to_frame() {
            Ok(frame) => self.send(frame),
            Err(err) => {
                error!(event = event.name(), "could not encode event: {err}");
                false
            }
        }
    }

    fn send(&self, frame: Frame) -> bool {
        if self.outbox.send(frame).is_err() {
            warn!("client writer is gone, frame dropped");
            return false;
        }
        true
    }
}

// -----------------------------------------------------------------------------
// Runtime on the main loop
// -----------------------------------------------------------------------------

/// The main-loop state: client state plus the dispatcher that acts on it.
pub struct ClientRuntime {
    pub state: ClientState,
    dispatcher: Dispatcher<ClientState>,
}

impl ClientRuntime {
    pub fn new(state: ClientState, dispatcher: Dispatcher<ClientState>) -> Self {
        Self { state, dispatcher }
    }

    pub fn dispatcher(&self) -> &Dispatcher<ClientState> {
        &self.dispatcher
    }

    fn remember(&self, sender: &SenderIdentity) {
        if let Some(ledger) = &self.state.ledger {
            ledger.remember(sender);
        }
    }

    pub fn on_instruction(&mut self, message: &Message, sender: &SenderIdentity) {
        self.remember(sender);
        let outcome = self.dispatcher.dispatch(&mut self.state, message, sender);
        trace!(logical_id = message.logical_id(), ?outcome, "instruction done");
    }

    /// Answer a query. Only an answered query produces a response frame.
    pub fn on_query(&mut self, request_id: Uuid, query: &Message, sender: &SenderIdentity) {
        self.remember(sender);
        match self.dispatcher.respond(&mut self.state, query, sender) {
            QueryOutcome::Answered(value) => match value.to_wire() {
                Ok(value) => {
                    self.state.send(Frame::QueryResponse { request_id, value });
                }
                Err(err) => error!(%request_id, "could not encode query response: {err}"),
            },
            QueryOutcome::Refused(outcome) => {
                debug!(%request_id, logical_id = query.logical_id(), ?outcome, "query left unanswered");
            }
        }
    }
}

impl MainState for ClientRuntime {
    fn tick(&mut self) {
        let state = &mut self.state;
        let effects = &mut state.effects;
        state.overlays.tick(|overlay| effects.draw(overlay));
    }
}

// -----------------------------------------------------------------------------
// Session wiring
// -----------------------------------------------------------------------------

/// Builds a [`ClientSession`].
pub struct ClientBuilder {
    effects: Box<dyn ClientEffects>,
    properties: Box<dyn ClientProperties>,
    gate: PermissionGate,
    audit: Arc<dyn AuditSink>,
    tick: Duration,
    clock: Option<Arc<dyn Clock>>,
    ledger: Option<Arc<dyn SenderLedger>>,
}

impl ClientBuilder {
    pub fn new(effects: impl ClientEffects + 'static, properties: impl ClientProperties + 'static) -> Self {
        Self {
            effects: Box::new(effects),
            properties: Box::new(properties),
            gate: PermissionGate::in_memory(),
            audit: Arc::new(TracingAudit),
            tick: DEFAULT_TICK,
            clock: None,
            ledger: None,
        }
    }

    pub fn gate(mut self, gate: PermissionGate) -> Self {
        self.gate = gate;
        self
    }

    pub fn audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    pub fn tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn ledger(mut self, ledger: Arc<dyn SenderLedger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    /// Start the main loop, the frame reader over `reader` and the writer
    /// onto `sink`. Host packets read from `reader` go to `host` untouched.
    pub fn spawn<R>(
        self,
        reader: R,
        sink: Arc<dyn PacketSink>,
        host: mpsc::UnboundedSender<Bytes>,
    ) -> Result<ClientSession, RegistryError>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let dispatcher = catalog::client_dispatcher(self.gate.clone(), self.audit)?;
        let (outbox, mut outbox_rx) = mpsc::unbounded_channel::<Frame>();

        let mut state = ClientState::new(self.effects, self.properties, self.gate, outbox);
        if let Some(clock) = self.clock {
            state = state.with_clock(clock);
        }
        if let Some(ledger) = self.ledger {
            state = state.with_ledger(ledger);
        }

        let (main, main_task) = MainLoop::spawn(ClientRuntime::new(state, dispatcher), Some(self.tick));

        let writer = tokio::spawn(async move {
            while let Some(frame) = outbox_rx.recv().await {
                match sink.send_frame(&frame).await {
                    Ok(()) => {}
                    Err(TransportError::PeerGone) => {
                        debug!("server is gone, client writer stopping");
                        break;
                    }
                    Err(err) => warn!(tag = ?frame.tag(), "could not send frame: {err}"),
                }
            }
        });

        let handle = main.clone();
        let reader = tokio::spawn(async move {
            let result = pump(reader, Multiplexer::client(), host, |frame| route(&handle, frame)).await;
            handle.shutdown();
            result
        });

        Ok(ClientSession {
            main,
            main_task,
            reader,
            writer,
        })
    }
}

/// Decode a frame off the wire and hand it to the main loop. Frames whose
/// blocks cannot be decoded are logged and dropped.
fn route(main: &MainLoopHandle<ClientRuntime>, frame: Frame) {
    let submitted = match frame {
        Frame::Instruction { message, sender } => match decode_pair(&message, &sender) {
            Some((message, sender)) => main.run_on_main_loop(move |rt| rt.on_instruction(&message, &sender)),
            None => return,
        },
        Frame::QueryRequest {
            request_id,
            query,
            sender,
        } => match decode_pair(&query, &sender) {
            Some((query, sender)) => main.run_on_main_loop(move |rt| rt.on_query(request_id, &query, &sender)),
            None => return,
        },
        other => {
            warn!(tag = ?other.tag(), "client received a server-bound frame");
            return;
        }
    };
    if submitted.is_err() {
        debug!("client main loop is closed, frame dropped");
    }
}

fn decode_pair(message: &Bytes, sender: &Bytes) -> Option<(Message, SenderIdentity)> {
    let message = Message::from_wire(message)
        .map_err(|err| error!("dropping frame: {err}"))
        .ok()?;
    let sender = SenderIdentity::from_wire(sender)
        .map_err(|err| error!(logical_id = message.logical_id(), "dropping frame: {err}"))
        .ok()?;
    Some((message, sender))
}

/// A running client.
pub struct ClientSession {
    main: MainLoopHandle<ClientRuntime>,
    main_task: JoinHandle<ClientRuntime>,
    reader: JoinHandle<Result<(), TransportError>>,
    writer: JoinHandle<()>,
}

impl ClientSession {
    pub fn handle(&self) -> &MainLoopHandle<ClientRuntime> {
        &self.main
    }

    /// Emit `event` from the main loop. `Ok(false)` means events are not enabled yet.
    pub async fn emit(&self, event: ClientEvent) -> Result<bool, MainLoopClosed> {
        self.main.call(move |rt| rt.state.emit(event)).await
    }

    /// Run `f` against the client state on the main loop.
    pub async fn inspect<F, R>(&self, f: F) -> Result<R, MainLoopClosed>
    where
        F: FnOnce(&mut ClientState) -> R + Send + 'static,
        R: Send + 'static,
    {
        self.main.call(move |rt| f(&mut rt.state)).await
    }

    /// Stop the main loop and wait for the reader to finish. The writer
    /// is dropped once the state, and with it the outbox, is gone.
    pub async fn shutdown(self) -> Result<(), TransportError> {
        self.main.shutdown();
        self.reader.abort();
        if let Err(err) = self.main_task.await {
            error!("client main loop task failed: {err}");
        }
        if let Err(err) = self.writer.await {
            error!("client writer task failed: {err}");
        }
        match self.reader.await {
            Ok(result) => result,
            Err(err) if err.is_cancelled() => Ok(()),
            Err(err) => {
                error!("client reader task failed: {err}");
                Ok(())
            }
        }
    }

    /// Wait until the host connection closes on its own.
    pub async fn closed(self) -> Result<(), TransportError> {
        let result = match self.reader.await {
            Ok(result) => result,
            Err(err) => {
                error!("client reader task failed: {err}");
                Ok(())
            }
        };
        self.main.shutdown();
        let _ = self.main_task.await;
        let _ = self.writer.await;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::effects::{Effect, RecordingEffects, StaticProperties};
    use sidechannel_protocol::{AuditOutcome, Capability, ManualClock, MemoryAudit, ParamValue};

    fn plugin_a() -> SenderIdentity {
        SenderIdentity::new("pluginA", "Plugin A", "1.0")
    }

    fn runtime(
        effects: RecordingEffects,
        clock: Arc<ManualClock>,
    ) -> (ClientRuntime, mpsc::UnboundedReceiver<Frame>, Arc<MemoryAudit>) {
        let gate = PermissionGate::in_memory();
        let audit = Arc::new(MemoryAudit::new());
        let (tx, rx) = mpsc::unbounded_channel();
        let state = ClientState::new(Box::new(effects), Box::new(StaticProperties::default()), gate.clone(), tx)
            .with_clock(clock);
        let dispatcher = catalog::client_dispatcher(gate, audit.clone()).unwrap();
        (ClientRuntime::new(state, dispatcher), rx, audit)
    }

    fn draw(text: &str, duration_millis: i64) -> Message {
        Message::new(
            catalog::DRAW_TEXT,
            vec![text.into(), 4.into(), 8.into(), 0xffffff.into(), duration_millis.into()],
        )
    }

    #[test]
    fn overlays_are_redrawn_until_they_expire() {
        let effects = RecordingEffects::new();
        let clock = ManualClock::new(0);
        let (mut rt, _rx, _) = runtime(effects.clone(), clock.clone());

        rt.on_instruction(&draw("short", 100), &plugin_a());
        rt.on_instruction(&draw("sticky", -1), &plugin_a());

        rt.tick();
        assert_eq!(effects.count(|e| matches!(e, Effect::Drew(_))), 2);

        clock.advance(Duration::from_millis(150));
        rt.tick();
        let drawn = effects.count(|e| matches!(e, Effect::Drew(Overlay::Text { text, .. }) if text == "short"));
        assert_eq!(drawn, 1);
        assert_eq!(rt.state.overlays().len(), 1);

        rt.on_instruction(&Message::bare(catalog::CLEAR_OVERLAYS), &plugin_a());
        assert!(rt.state.overlays().is_empty());
    }

    #[test]
    fn events_wait_for_ping() {
        let (mut rt, mut rx, _) = runtime(RecordingEffects::new(), ManualClock::new(0));

        rt.on_instruction(&Message::new(catalog::OPEN_SCREEN, vec!["inventory".into()]), &plugin_a());
        assert!(rx.try_recv().is_err());
        assert_eq!(rt.state.screen(), Some("inventory"));

        rt.on_instruction(&Message::bare(catalog::PING), &plugin_a());
        assert!(rt.state.events_enabled());
        rt.on_instruction(&Message::bare(catalog::CLOSE_SCREEN), &plugin_a());

        let Frame::ClientEvent { event_id, params } = rx.try_recv().unwrap() else {
            panic!("expected an event frame");
        };
        assert_eq!(
            ClientEvent::decode(event_id, &params).unwrap(),
            ClientEvent::ScreenChanged {
                old: Some("inventory".to_string()),
                new: None
            }
        );
    }

    #[test]
    fn answered_queries_respond_and_denied_ones_stay_silent() {
        let (mut rt, mut rx, audit) = runtime(RecordingEffects::new(), ManualClock::new(0));
        let id = Uuid::new_v4();

        rt.on_query(id, &Message::bare(catalog::FPS), &plugin_a());
        let Frame::QueryResponse { request_id, value } = rx.try_recv().unwrap() else {
            panic!("expected a response");
        };
        assert_eq!(request_id, id);
        assert_eq!(ParamValue::from_wire(&value).unwrap(), ParamValue::Int(60));

        // off by default
        rt.on_query(Uuid::new_v4(), &Message::bare(catalog::FREE_MEMORY), &plugin_a());
        assert!(rx.try_recv().is_err());
        assert_eq!(audit.count(AuditOutcome::Denied), 1);
    }

    #[test]
    fn sender_permissions_reflect_the_gate() {
        let (mut rt, mut rx, _) = runtime(RecordingEffects::new(), ManualClock::new(0));
        rt.state.gate.set_granted(Some("pluginA"), Capability::Draw, false).unwrap();

        rt.on_query(Uuid::new_v4(), &Message::bare(catalog::SENDER_PERMISSIONS), &plugin_a());
        let Frame::QueryResponse { value, .. } = rx.try_recv().unwrap() else {
            panic!("expected a response");
        };
        let value = ParamValue::from_wire(&value).unwrap();
        let map = value.as_map().unwrap();
        assert_eq!(map["draw"], ParamValue::Bool(false));
        assert_eq!(map["audio"], ParamValue::Bool(true));
        assert_eq!(map["required"], ParamValue::Bool(true));
    }

    #[test]
    fn bad_parameters_fault_without_side_effects() {
        let effects = RecordingEffects::new();
        let (mut rt, _rx, audit) = runtime(effects.clone(), ManualClock::new(0));

        rt.on_instruction(&Message::new(catalog::OPEN_LINK, vec!["file:///etc/passwd".into()]), &plugin_a());
        rt.on_instruction(&Message::new(catalog::DRAW_TEXT, vec!["missing coords".into()]), &plugin_a());

        assert_eq!(audit.count(AuditOutcome::Faulted), 2);
        assert!(effects.effects().is_empty());
        assert!(rt.state.overlays().is_empty());
    }

    #[test]
    fn play_audio_defaults_volume_and_pitch() {
        let effects = RecordingEffects::new();
        let (mut rt, _rx, _) = runtime(effects.clone(), ManualClock::new(0));

        rt.on_instruction(&Message::new(catalog::PLAY_AUDIO, vec!["click".into()]), &plugin_a());
        rt.on_instruction(&Message::new(catalog::PLAY_AUDIO, vec!["bell".into(), 0.5.into(), 2.into()]), &plugin_a());

        assert_eq!(
            effects.effects(),
            vec![
                Effect::PlayedAudio { sound: "click".to_string(), volume: 1.0, pitch: 1.0 },
                Effect::PlayedAudio { sound: "bell".to_string(), volume: 0.5, pitch: 2.0 },
            ]
        );
    }
}
