//! Built-in instructions and queries understood by the client.
//!
//! Each entry binds a logical id to one capability and one handler. The
//! tables are the only place ids are declared; the client registry and the
//! server's pre-check bindings are both derived from them.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use sidechannel_protocol::dispatcher::{InstructionHandler, QueryHandler};
use sidechannel_protocol::{
    AuditSink, Capability, ClientEvent, Dispatcher, Message, ParamValue, PermissionGate, Registry, RegistryError,
    SenderIdentity,
};
use strum::IntoEnumIterator;
use tracing::{debug, info};
use url::Url;

use crate::client::ClientState;
use crate::effects::Overlay;

pub const PING: &str = "ping";
pub const LOG_MESSAGE: &str = "log_message";
pub const DRAW_TEXT: &str = "draw_text";
pub const DRAW_SHAPE: &str = "draw_shape";
pub const CLEAR_OVERLAYS: &str = "clear_overlays";
pub const OPEN_SCREEN: &str = "open_screen";
pub const CLOSE_SCREEN: &str = "close_screen";
pub const PLAY_AUDIO: &str = "play_audio";
pub const OPEN_LINK: &str = "open_link";
pub const MAILTO: &str = "mailto";
pub const SET_PREFERENCE: &str = "set_preference";

pub const OPERATING_SYSTEM: &str = "operating_system";
pub const LAUNCH_VERSION: &str = "launch_version";
pub const SENDER_PERMISSIONS: &str = "sender_permissions";
pub const FPS: &str = "fps";
pub const PAUSED: &str = "paused";
pub const FREE_MEMORY: &str = "free_memory";
pub const AVAILABLE_PROCESSORS: &str = "available_processors";
pub const COMMAND_HISTORY: &str = "command_history";

pub fn instruction_table() -> Vec<(&'static str, Capability, InstructionHandler<ClientState>)> {
    vec![
        (PING, Capability::Required, Box::new(ping)),
        (LOG_MESSAGE, Capability::Required, Box::new(log_message)),
        (DRAW_TEXT, Capability::Draw, Box::new(draw_text)),
        (DRAW_SHAPE, Capability::Draw, Box::new(draw_shape)),
        (CLEAR_OVERLAYS, Capability::Draw, Box::new(clear_overlays)),
        (OPEN_SCREEN, Capability::Screens, Box::new(open_screen)),
        (CLOSE_SCREEN, Capability::Screens, Box::new(close_screen)),
        (PLAY_AUDIO, Capability::Audio, Box::new(play_audio)),
        (OPEN_LINK, Capability::OpenLinks, Box::new(open_link)),
        (MAILTO, Capability::ExternalApplications, Box::new(mailto)),
        (SET_PREFERENCE, Capability::ChangePreferences, Box::new(set_preference)),
    ]
}

pub fn query_table() -> Vec<(&'static str, Capability, QueryHandler<ClientState>)> {
    vec![
        (OPERATING_SYSTEM, Capability::Required, Box::new(operating_system)),
        (LAUNCH_VERSION, Capability::Required, Box::new(launch_version)),
        (SENDER_PERMISSIONS, Capability::Required, Box::new(sender_permissions)),
        (FPS, Capability::ReadDisplayProperties, Box::new(fps)),
        (PAUSED, Capability::ReadDisplayProperties, Box::new(paused)),
        (FREE_MEMORY, Capability::ReadSystemProperties, Box::new(free_memory)),
        (AVAILABLE_PROCESSORS, Capability::ReadSystemProperties, Box::new(available_processors)),
        (COMMAND_HISTORY, Capability::ReadClientProperties, Box::new(command_history)),
    ]
}

/// The client's dispatcher with every built-in registered.
pub fn client_dispatcher(
    gate: PermissionGate,
    audit: Arc<dyn AuditSink>,
) -> Result<Dispatcher<ClientState>, RegistryError> {
    Ok(Dispatcher::new(gate)
        .with_audit(audit)
        .with_instructions(Registry::from_table(instruction_table())?)
        .with_queries(Registry::from_table(query_table())?))
}

/// `logical_id -> capability` for every built-in, used by the server's pre-check.
pub fn bindings() -> HashMap<String, Capability> {
    instruction_table()
        .into_iter()
        .map(|(id, cap, _)| (id.to_string(), cap))
        .chain(query_table().into_iter().map(|(id, cap, _)| (id.to_string(), cap)))
        .collect()
}

// -----------------------------------------------------------------------------
// Instructions
// -----------------------------------------------------------------------------

fn ping(state: &mut ClientState, _: &Message, sender: &SenderIdentity) -> Result<()> {
    if !state.events_enabled {
        info!(%sender, "server pinged, client events enabled");
    }
    state.events_enabled = true;
    Ok(())
}

fn log_message(state: &mut ClientState, msg: &Message, _: &SenderIdentity) -> Result<()> {
    state.effects.log(msg.text(0)?, msg.text(1)?);
    Ok(())
}

/// Negative durations keep the overlay until it is cleared.
fn keep(state: &mut ClientState, overlay: Overlay, duration_millis: i64) {
    if duration_millis < 0 {
        state.overlays.store_infinite(overlay);
    } else {
        state
            .overlays
            .store(overlay, Duration::from_millis(duration_millis as u64));
    }
}

/// `[text, x, y, color, duration_millis]`
fn draw_text(state: &mut ClientState, msg: &Message, _: &SenderIdentity) -> Result<()> {
    let overlay = Overlay::Text {
        text: msg.text(0)?.to_string(),
        x: msg.int(1)?,
        y: msg.int(2)?,
        color: msg.int(3)?,
    };
    keep(state, overlay, msg.int(4)?);
    Ok(())
}

/// `[shape, x, y, width, height, color, duration_millis]`
fn draw_shape(state: &mut ClientState, msg: &Message, _: &SenderIdentity) -> Result<()> {
    let (width, height) = (msg.int(3)?, msg.int(4)?);
    if width < 0 || height < 0 {
        bail!("shape size {width}x{height} is negative");
    }
    let overlay = Overlay::Shape {
        shape: msg.text(0)?.to_string(),
        x: msg.int(1)?,
        y: msg.int(2)?,
        width,
        height,
        color: msg.int(5)?,
    };
    keep(state, overlay, msg.int(6)?);
    Ok(())
}

fn clear_overlays(state: &mut ClientState, _: &Message, _: &SenderIdentity) -> Result<()> {
    state.overlays.clear();
    state.effects.clear_overlays();
    Ok(())
}

fn open_screen(state: &mut ClientState, msg: &Message, _: &SenderIdentity) -> Result<()> {
    let screen = msg.text(0)?.to_string();
    state.effects.open_screen(&screen)?;
    let old = state.screen.replace(screen.clone());
    state.emit(ClientEvent::ScreenChanged { old, new: Some(screen) });
    Ok(())
}

fn close_screen(state: &mut ClientState, _: &Message, _: &SenderIdentity) -> Result<()> {
    state.effects.close_screen();
    if let Some(old) = state.screen.take() {
        state.emit(ClientEvent::ScreenChanged { old: Some(old), new: None });
    }
    Ok(())
}

/// `[sound, volume?, pitch?]`
fn play_audio(state: &mut ClientState, msg: &Message, _: &SenderIdentity) -> Result<()> {
    let volume = if msg.parameters().len() > 1 { msg.float(1)? } else { 1.0 };
    let pitch = if msg.parameters().len() > 2 { msg.float(2)? } else { 1.0 };
    state.effects.play_audio(msg.text(0)?, volume, pitch)
}

fn open_link(state: &mut ClientState, msg: &Message, _: &SenderIdentity) -> Result<()> {
    let raw = msg.text(0)?;
    let url = Url::parse(raw).with_context(|| format!("`{raw}` is not a valid link"))?;
    if !matches!(url.scheme(), "http" | "https") {
        bail!("refusing to open `{}` link", url.scheme());
    }
    state.effects.open_link(&url)
}

fn mailto(state: &mut ClientState, msg: &Message, _: &SenderIdentity) -> Result<()> {
    let address = msg.text(0)?;
    if !address.contains('@') {
        bail!("`{address}` is not an email address");
    }
    state.effects.mailto(address)
}

fn set_preference(state: &mut ClientState, msg: &Message, sender: &SenderIdentity) -> Result<()> {
    let (key, value) = (msg.text(0)?, msg.text(1)?);
    debug!(%sender, key, value, "changing client preference");
    state.effects.set_preference(key, value)
}

// -----------------------------------------------------------------------------
// Queries
// -----------------------------------------------------------------------------

fn operating_system(state: &mut ClientState, _: &Message, _: &SenderIdentity) -> Result<ParamValue> {
    Ok(state.properties.operating_system().into())
}

fn launch_version(state: &mut ClientState, _: &Message, _: &SenderIdentity) -> Result<ParamValue> {
    Ok(state.properties.launch_version().into())
}

fn fps(state: &mut ClientState, _: &Message, _: &SenderIdentity) -> Result<ParamValue> {
    Ok(state.properties.fps().into())
}

fn paused(state: &mut ClientState, _: &Message, _: &SenderIdentity) -> Result<ParamValue> {
    Ok(state.properties.paused().into())
}

fn free_memory(state: &mut ClientState, _: &Message, _: &SenderIdentity) -> Result<ParamValue> {
    Ok(state.properties.free_memory().into())
}

fn available_processors(state: &mut ClientState, _: &Message, _: &SenderIdentity) -> Result<ParamValue> {
    Ok(state.properties.available_processors().into())
}

/// What the asking sender is currently allowed to do, keyed by capability.
fn sender_permissions(state: &mut ClientState, _: &Message, sender: &SenderIdentity) -> Result<ParamValue> {
    let map: BTreeMap<String, ParamValue> = Capability::iter()
        .map(|cap| (cap.to_string(), state.gate.is_granted(Some(sender), cap).into()))
        .collect();
    Ok(map.into())
}

/// `[limit?]` most recent commands, oldest first.
fn command_history(state: &mut ClientState, msg: &Message, _: &SenderIdentity) -> Result<ParamValue> {
    let mut history = state.properties.command_history();
    if !msg.parameters().is_empty() {
        let limit = usize::try_from(msg.int(0)?).context("limit must not be negative")?;
        if history.len() > limit {
            history.drain(..history.len() - limit);
        }
    }
    Ok(ParamValue::List(history.into_iter().map(ParamValue::Text).collect()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tables_have_no_duplicates() {
        let gate = PermissionGate::in_memory();
        let dispatcher = client_dispatcher(gate, Arc::new(sidechannel_protocol::MemoryAudit::new())).unwrap();
        assert_eq!(dispatcher.instructions().len(), instruction_table().len());
        assert_eq!(dispatcher.queries().len(), query_table().len());
        assert_eq!(bindings().len(), instruction_table().len() + query_table().len());
    }

    #[test]
    fn every_capability_gates_something() {
        let used: std::collections::HashSet<_> = bindings().into_values().collect();
        for cap in Capability::iter() {
            assert!(used.contains(&cap), "{cap} is not bound to any id");
        }
    }

    #[test]
    fn handshake_is_required() {
        let b = bindings();
        assert_eq!(b[PING], Capability::Required);
        assert_eq!(b[SENDER_PERMISSIONS], Capability::Required);
        assert_eq!(b[DRAW_TEXT], Capability::Draw);
        assert_eq!(b[FREE_MEMORY], Capability::ReadSystemProperties);
    }
}
