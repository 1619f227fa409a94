use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use sidechannel::catalog;
use sidechannel::client::ClientBuilder;
use sidechannel::demo::Loopback;
use sidechannel::effects::{Effect, Overlay, RecordingEffects, StaticProperties};
use sidechannel::permission_file::FilePermissionStore;
use sidechannel::server::{Delivery, ServerSession, SessionError};
use sidechannel::protocol::envelope::write_var_int;
use sidechannel::protocol::{
    AuditOutcome, Capability, ClientEvent, ManualClock, MemoryAudit, Message, ParamValue, PermissionGate,
    SenderIdentity,
};
use tempfile::tempdir;
use tokio::sync::mpsc;
use tokio::time::timeout;

struct Harness {
    lb: Loopback,
    gate: PermissionGate,
    audit: Arc<MemoryAudit>,
    effects: RecordingEffects,
}

fn harness_with(client: impl FnOnce(ClientBuilder) -> ClientBuilder) -> Harness {
    let gate = PermissionGate::in_memory();
    let audit = Arc::new(MemoryAudit::new());
    let effects = RecordingEffects::new();
    let properties = StaticProperties {
        command_history: vec!["/time set day".into(), "/give @p torch".into(), "/spawn".into()],
        ..StaticProperties::default()
    };
    let builder = ClientBuilder::new(effects.clone(), properties)
        .gate(gate.clone())
        .audit(audit.clone());
    let server_audit = audit.clone();
    let lb = Loopback::connect(client(builder), move |sink| ServerSession::new(sink).with_audit(server_audit)).unwrap();
    Harness {
        lb,
        gate,
        audit,
        effects,
    }
}

fn harness() -> Harness {
    harness_with(|b| b)
}

fn plugin_a() -> SenderIdentity {
    SenderIdentity::new("pluginA", "Plugin A", "1.0")
}

fn draw(text: &str, duration_millis: i64) -> Message {
    Message::new(
        catalog::DRAW_TEXT,
        vec![text.into(), 1.into(), 2.into(), 0xff0000.into(), duration_millis.into()],
    )
}

fn count(audit: &MemoryAudit, outcome: AuditOutcome, id: &str) -> usize {
    audit
        .records()
        .iter()
        .filter(|r| r.outcome == outcome && r.logical_id == id)
        .count()
}

/// Everything the server sent before this has been handled by the client once
/// it returns: frames arrive in order and the client main loop is FIFO.
async fn barrier(server: &ServerSession) {
    let value = timeout(
        Duration::from_secs(5),
        server.query_value(&Message::bare(catalog::OPERATING_SYSTEM), &plugin_a()),
    )
    .await
    .expect("barrier query timed out")
    .unwrap();
    assert!(value.as_text().is_some());
}

fn host_packet(id: i32, body: &[u8]) -> Bytes {
    let mut buf = BytesMut::new();
    write_var_int(&mut buf, id);
    buf.extend_from_slice(body);
    buf.freeze()
}

#[tokio::test]
async fn granted_draw_is_audited_on_both_sides_then_denied_after_revocation() {
    let h = harness();
    let server = &h.lb.server;

    let delivery = server.send_instruction(&draw("first", -1), &plugin_a()).await.unwrap();
    assert_eq!(delivery, Delivery::Sent);
    barrier(server).await;

    assert_eq!(count(&h.audit, AuditOutcome::Sent, catalog::DRAW_TEXT), 1);
    assert_eq!(count(&h.audit, AuditOutcome::Received, catalog::DRAW_TEXT), 1);
    assert_eq!(h.lb.client.inspect(|s| s.overlays().len()).await.unwrap(), 1);

    h.gate.set_granted(Some("pluginA"), Capability::Draw, false).unwrap();

    // the server's cache has not been refreshed, so the client is the one refusing
    let delivery = server.send_instruction(&draw("second", -1), &plugin_a()).await.unwrap();
    assert_eq!(delivery, Delivery::Sent);
    barrier(server).await;

    assert_eq!(count(&h.audit, AuditOutcome::Denied, catalog::DRAW_TEXT), 1);
    assert_eq!(count(&h.audit, AuditOutcome::Received, catalog::DRAW_TEXT), 1);
    let texts = h
        .lb
        .client
        .inspect(|s| {
            s.overlays()
                .live()
                .filter_map(|o| match o {
                    Overlay::Text { text, .. } => Some(text.clone()),
                    _ => None,
                })
                .collect::<Vec<_>>()
        })
        .await
        .unwrap();
    assert_eq!(texts, vec!["first".to_string()]);
}

#[tokio::test]
async fn unknown_instruction_leaves_the_client_untouched() {
    let h = harness();
    let server = &h.lb.server;

    let delivery = server
        .send_instruction(&Message::new("teleport", vec![1.into(), 2.into()]), &plugin_a())
        .await
        .unwrap();
    assert_eq!(delivery, Delivery::Sent);
    barrier(server).await;

    assert_eq!(count(&h.audit, AuditOutcome::UnknownId, "teleport"), 1);
    let (overlays, screen, events) = h
        .lb
        .client
        .inspect(|s| (s.overlays().len(), s.screen().map(str::to_string), s.events_enabled()))
        .await
        .unwrap();
    assert_eq!(overlays, 0);
    assert_eq!(screen, None);
    assert!(!events);
    assert!(h.effects.effects().is_empty());

    // and the session keeps working
    server
        .send_instruction(&Message::new(catalog::OPEN_SCREEN, vec!["title".into()]), &plugin_a())
        .await
        .unwrap();
    barrier(server).await;
    assert_eq!(h.effects.effects(), vec![Effect::OpenedScreen("title".into())]);
}

#[tokio::test]
async fn queries_round_trip_with_their_values() {
    let h = harness();
    let server = &h.lb.server;

    let fps = server.query_value(&Message::bare(catalog::FPS), &plugin_a()).await.unwrap();
    assert_eq!(fps, ParamValue::Int(60));

    let history = server
        .query_value(&Message::new(catalog::COMMAND_HISTORY, vec![2.into()]), &plugin_a())
        .await
        .unwrap();
    assert_eq!(
        history,
        ParamValue::List(vec!["/give @p torch".into(), "/spawn".into()])
    );
    assert_eq!(server.bus().pending_count(), 0);
}

#[tokio::test]
async fn refused_query_is_never_answered() {
    let h = harness();
    let server = &h.lb.server;
    h.gate
        .set_granted(Some("pluginA"), Capability::ReadDisplayProperties, false)
        .unwrap();

    let err = server
        .query_value_timeout(&Message::bare(catalog::FPS), &plugin_a(), Duration::from_millis(300))
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::TimedOut(_)), "got {err:?}");
    assert_eq!(server.bus().pending_count(), 0);
    assert_eq!(count(&h.audit, AuditOutcome::Denied, catalog::FPS), 1);
}

#[tokio::test]
async fn refreshed_permissions_let_the_server_skip_refused_instructions() {
    let h = harness();
    let server = &h.lb.server;
    h.gate.set_granted(Some("pluginA"), Capability::Audio, false).unwrap();

    let granted = server.refresh_permissions(&plugin_a()).await.unwrap();
    assert_eq!(granted.get(&Capability::Audio), Some(&false));
    assert_eq!(granted.get(&Capability::Draw), Some(&true));
    assert_eq!(granted.get(&Capability::ExternalApplications), Some(&false));

    let delivery = server
        .send_instruction(&Message::new(catalog::PLAY_AUDIO, vec!["bell".into()]), &plugin_a())
        .await
        .unwrap();
    assert_eq!(delivery, Delivery::SkippedDenied(Capability::Audio));
    barrier(server).await;
    assert_eq!(count(&h.audit, AuditOutcome::Sent, catalog::PLAY_AUDIO), 0);
    assert_eq!(count(&h.audit, AuditOutcome::Denied, catalog::PLAY_AUDIO), 0);
}

#[tokio::test]
async fn client_events_start_after_ping() {
    let h = harness();
    let server = &h.lb.server;
    let (tx, mut rx) = mpsc::unbounded_channel();
    server.on_event(move |e| {
        let _ = tx.send(e.clone());
    });

    // not enabled yet
    let emitted = h
        .lb
        .client
        .emit(ClientEvent::MouseMoved { x: 1.0, y: 2.0 })
        .await
        .unwrap();
    assert!(!emitted);

    server.send_instruction(&Message::bare(catalog::PING), &plugin_a()).await.unwrap();
    server
        .send_instruction(&Message::new(catalog::OPEN_SCREEN, vec!["inventory".into()]), &plugin_a())
        .await
        .unwrap();

    let event = timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
    assert_eq!(
        event,
        ClientEvent::ScreenChanged {
            old: None,
            new: Some("inventory".into())
        }
    );

    let clicked = ClientEvent::ButtonClicked {
        button: "craft".into(),
        screen: "inventory".into(),
    };
    assert!(h.lb.client.emit(clicked.clone()).await.unwrap());
    let event = timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
    assert_eq!(event, clicked);
}

#[tokio::test]
async fn host_packets_pass_through_both_ways_untouched() {
    let mut h = harness();

    let chunk = host_packet(0x26, b"chunk data");
    h.lb.server_sink.send_packet(chunk.clone()).await.unwrap();
    h.lb.server.send_instruction(&draw("between", 500), &plugin_a()).await.unwrap();
    let chat = host_packet(0x03, b"hello");
    h.lb.server_sink.send_packet(chat.clone()).await.unwrap();

    let keep_alive = host_packet(0x12, &[0, 0, 0, 42]);
    h.lb.client_sink.send_packet(keep_alive.clone()).await.unwrap();

    let first = timeout(Duration::from_secs(5), h.lb.client_host.recv()).await.unwrap().unwrap();
    let second = timeout(Duration::from_secs(5), h.lb.client_host.recv()).await.unwrap().unwrap();
    assert_eq!(first, chunk);
    assert_eq!(second, chat);

    let back = timeout(Duration::from_secs(5), h.lb.server_host.recv()).await.unwrap().unwrap();
    assert_eq!(back, keep_alive);

    barrier(&h.lb.server).await;
    assert!(h.lb.client_host.try_recv().is_err());
    assert!(h.lb.server_host.try_recv().is_err());
    assert_eq!(count(&h.audit, AuditOutcome::Received, catalog::DRAW_TEXT), 1);
}

#[tokio::test]
async fn overlays_expire_on_the_client_clock() {
    let clock = ManualClock::new(1_000);
    let h = harness_with({
        let clock = clock.clone();
        move |b| b.clock(clock)
    });
    let server = &h.lb.server;

    server.send_instruction(&draw("toast", 100), &plugin_a()).await.unwrap();
    barrier(server).await;

    let overlay = Overlay::Text {
        text: "toast".into(),
        x: 1,
        y: 2,
        color: 0xff0000,
    };
    let probe = overlay.clone();
    let remaining = h.lb.client.inspect(move |s| s.overlays().remaining_time(&probe)).await.unwrap();
    assert_eq!(remaining, 100);

    clock.advance(Duration::from_millis(150));
    let probe = overlay.clone();
    let live = h.lb.client.inspect(move |s| s.overlays().is_live(&probe)).await.unwrap();
    assert!(!live);

    // the next replay neither draws nor keeps it
    tokio::time::sleep(Duration::from_millis(120)).await;
    let drawn_before = h.effects.count(|e| matches!(e, Effect::Drew(_)));
    tokio::time::sleep(Duration::from_millis(120)).await;
    assert_eq!(h.effects.count(|e| matches!(e, Effect::Drew(_))), drawn_before);
    assert_eq!(h.lb.client.inspect(|s| s.overlays().len()).await.unwrap(), 0);
}

#[tokio::test]
async fn client_remembers_who_it_heard_from() {
    let dir = tempdir().unwrap();
    let store = Arc::new(FilePermissionStore::open(dir.path().join("permissions.json")).unwrap());
    let h = harness_with({
        let store = store.clone();
        move |b| b.gate(PermissionGate::new(store.clone())).ledger(store)
    });

    let sender = plugin_a().with_location_hint("plugins/plugin-a.jar");
    h.lb.server.send_instruction(&Message::bare(catalog::PING), &sender).await.unwrap();
    barrier(&h.lb.server).await;

    let known = store.known_senders();
    assert_eq!(known.len(), 1);
    assert_eq!(known[0].identity.display_name, "Plugin A");
    assert_eq!(known[0].identity.location_hint, "plugins/plugin-a.jar");

    let reopened = FilePermissionStore::open(dir.path().join("permissions.json")).unwrap();
    assert_eq!(reopened.known_senders().len(), 1);
}

#[tokio::test]
async fn shutdown_closes_the_session() {
    let h = harness();
    let Loopback { client, server, .. } = h.lb;
    client.shutdown().await.unwrap();

    // the client end is gone, so the query can never be answered
    let err = server
        .query_value_timeout(&Message::bare(catalog::FPS), &plugin_a(), Duration::from_millis(200))
        .await
        .unwrap_err();
    assert!(
        matches!(err, SessionError::TimedOut(_) | SessionError::Transport(_)),
        "got {err:?}"
    );
}
