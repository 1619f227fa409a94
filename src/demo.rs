//! A client and a server wired back to back over an in-memory connection.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use sidechannel_protocol::{ClientEvent, Message, PermissionGate, RegistryError, SenderIdentity};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

use crate::audit_log::FileAuditLog;
use crate::catalog;
use crate::client::{ClientBuilder, ClientSession};
use crate::config::Settings;
use crate::effects::{Effect, RecordingEffects, StaticProperties};
use crate::permission_file::FilePermissionStore;
use crate::server::{Delivery, ServerSession, SessionError};
use crate::transport::{FramedSink, PacketSink, TransportError};

const DUPLEX_CAPACITY: usize = 64 * 1024;
/// How long the report waits for one more queued event before it stops.
const EVENT_SETTLE: Duration = Duration::from_millis(100);

/// Both ends of one connection.
pub struct Loopback {
    pub client: ClientSession,
    pub server: ServerSession,
    /// Raw write side of the server end, for host packets.
    pub server_sink: Arc<dyn PacketSink>,
    /// Raw write side of the client end, for host packets.
    pub client_sink: Arc<dyn PacketSink>,
    /// Host packets that reached the client.
    pub client_host: mpsc::UnboundedReceiver<Bytes>,
    /// Host packets that reached the server.
    pub server_host: mpsc::UnboundedReceiver<Bytes>,
    pub server_reader: JoinHandle<Result<(), TransportError>>,
}

impl Loopback {
    /// Connect `client` to `server`, where `server` is handed the sink of its end.
    pub fn connect<F>(client: ClientBuilder, server: F) -> Result<Self, RegistryError>
    where
        F: FnOnce(Arc<dyn PacketSink>) -> ServerSession,
    {
        let (client_end, server_end) = tokio::io::duplex(DUPLEX_CAPACITY);
        let (client_read, client_write) = tokio::io::split(client_end);
        let (server_read, server_write) = tokio::io::split(server_end);

        let client_sink: Arc<dyn PacketSink> = Arc::new(FramedSink::new(client_write));
        let server_sink: Arc<dyn PacketSink> = Arc::new(FramedSink::new(server_write));

        let (client_host_tx, client_host) = mpsc::unbounded_channel();
        let (server_host_tx, server_host) = mpsc::unbounded_channel();

        let client = client.spawn(client_read, client_sink.clone(), client_host_tx)?;
        let server = server(server_sink.clone());
        let server_reader = server.spawn_reader(server_read, server_host_tx);

        Ok(Self {
            client,
            server,
            server_sink,
            client_sink,
            client_host,
            server_host,
            server_reader,
        })
    }
}

/// What the demo observed.
#[derive(Debug, Default)]
pub struct DemoReport {
    pub granted: Vec<String>,
    pub deliveries: Vec<(String, Delivery)>,
    pub answers: Vec<(String, String)>,
    pub events: Vec<ClientEvent>,
    pub effects: Vec<Effect>,
}

/// Run a scripted exchange using the permission store and audit directory
/// from `settings`.
pub async fn run(settings: &Settings) -> Result<DemoReport> {
    let store = Arc::new(
        FilePermissionStore::open(settings.permissions_file())
            .with_context(|| format!("could not open {}", settings.permissions_file().display()))?,
    );
    let audit = Arc::new(FileAuditLog::new(settings.audit_dir()));
    let effects = RecordingEffects::new();

    let client = ClientBuilder::new(effects.clone(), StaticProperties::default())
        .gate(PermissionGate::new(store.clone()))
        .audit(audit.clone())
        .ledger(store)
        .tick(settings.tick());
    let timeout = settings.query_timeout();
    let loopback = Loopback::connect(client, |sink| {
        ServerSession::new(sink)
            .with_audit(audit.clone())
            .with_query_timeout(timeout)
    })?;

    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    loopback.server.on_event(move |e| {
        let _ = events_tx.send(e.clone());
    });

    let sender = SenderIdentity::new("sidechannel.demo", "Sidechannel Demo", env!("CARGO_PKG_VERSION"));
    let server = &loopback.server;
    let mut report = DemoReport::default();

    let granted = server.refresh_permissions(&sender).await?;
    report.granted = granted
        .iter()
        .filter(|(_, g)| **g)
        .map(|(c, _)| c.to_string())
        .collect();

    let script = [
        Message::bare(catalog::PING),
        Message::new(catalog::LOG_MESSAGE, vec!["info".into(), "hello from the server".into()]),
        Message::new(
            catalog::DRAW_TEXT,
            vec!["sidechannel".into(), 10.into(), 10.into(), 0x00ff00.into(), 1_000.into()],
        ),
        Message::new(catalog::OPEN_SCREEN, vec!["demo".into()]),
        Message::new(catalog::MAILTO, vec!["someone@example.com".into()]),
        Message::bare(catalog::CLOSE_SCREEN),
    ];
    for message in &script {
        let delivery = server.send_instruction(message, &sender).await?;
        report.deliveries.push((message.logical_id().to_string(), delivery));
    }

    for id in [catalog::OPERATING_SYSTEM, catalog::FPS, catalog::FREE_MEMORY] {
        let answer = match server.query_value(&Message::bare(id), &sender).await {
            Ok(value) => serde_json::to_string(&value)?,
            Err(err @ (SessionError::Denied { .. } | SessionError::TimedOut(_))) => format!("<{err}>"),
            Err(err) => return Err(err.into()),
        };
        report.answers.push((id.to_string(), answer));
    }

    // the client applies everything in order, so this runs after the script
    loopback.client.inspect(|_| ()).await?;
    report.effects = effects.effects();
    // listeners run on their own task, so events can trail the last answer
    while let Ok(Some(event)) = tokio::time::timeout(EVENT_SETTLE, events_rx.recv()).await {
        report.events.push(event);
    }

    let Loopback {
        client,
        server_reader,
        ..
    } = loopback;
    client.shutdown().await?;
    server_reader.abort();
    info!(deliveries = report.deliveries.len(), events = report.events.len(), "demo finished");
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn demo_runs_against_a_fresh_root() {
        let dir = tempdir().unwrap();
        let settings = Settings {
            root: dir.path().to_path_buf(),
            query_timeout_millis: 2_000,
            ..Settings::default()
        };

        let report = run(&settings).await.unwrap();

        assert!(report.granted.contains(&"draw".to_string()));
        assert!(!report.granted.contains(&"external_applications".to_string()));
        assert!(
            report
                .deliveries
                .iter()
                .any(|(id, d)| id == catalog::MAILTO && matches!(d, Delivery::SkippedDenied(_)))
        );
        assert!(report.effects.iter().any(|e| matches!(e, Effect::OpenedScreen(s) if s == "demo")));
        assert!(
            report
                .events
                .iter()
                .any(|e| matches!(e, ClientEvent::ScreenChanged { new: Some(s), .. } if s == "demo"))
        );
        assert!(settings.audit_dir().exists());
        assert!(settings.permissions_file().exists());
    }
}
