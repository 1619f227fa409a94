use std::sync::{Arc, Mutex};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use url::Url;

/// A transient drawing kept alive by the client's lifecycle map and redrawn
/// on every tick until it expires.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Overlay {
    Text {
        text: String,
        x: i64,
        y: i64,
        color: i64,
    },
    Shape {
        shape: String,
        x: i64,
        y: i64,
        width: i64,
        height: i64,
        color: i64,
    },
}

/// Side effects the client performs on behalf of instructions. Rendering and
/// UI live behind this trait; the protocol never looks inside.
pub trait ClientEffects: Send {
    /// Called once per tick for every live overlay.
    fn draw(&mut self, overlay: &Overlay);
    fn clear_overlays(&mut self);
    fn open_screen(&mut self, screen: &str) -> anyhow::Result<()>;
    fn close_screen(&mut self);
    fn log(&mut self, level: &str, text: &str);
    fn play_audio(&mut self, sound: &str, volume: f64, pitch: f64) -> anyhow::Result<()>;
    fn open_link(&mut self, url: &Url) -> anyhow::Result<()>;
    fn mailto(&mut self, address: &str) -> anyhow::Result<()>;
    fn set_preference(&mut self, key: &str, value: &str) -> anyhow::Result<()>;
}

/// Read-only client state answered through queries.
pub trait ClientProperties: Send {
    fn operating_system(&self) -> String {
        std::env::consts::OS.to_string()
    }
    fn launch_version(&self) -> String;
    fn fps(&self) -> i64;
    fn paused(&self) -> bool;
    fn free_memory(&self) -> i64;
    fn available_processors(&self) -> i64 {
        std::thread::available_parallelism().map(|n| n.get() as i64).unwrap_or(1)
    }
    fn command_history(&self) -> Vec<String>;
}

// -----------------------------------------------------------------------------
// Recording implementations
// -----------------------------------------------------------------------------

/// One call made on [`RecordingEffects`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Effect {
    Drew(Overlay),
    Cleared,
    OpenedScreen(String),
    ClosedScreen,
    Logged { level: String, text: String },
    PlayedAudio { sound: String, volume: f64, pitch: f64 },
    OpenedLink(String),
    Mailed(String),
    SetPreference { key: String, value: String },
}

/// Effects that only record what was asked of them. Clones share the log.
#[derive(Debug, Clone, Default)]
pub struct RecordingEffects {
    log: Arc<Mutex<Vec<Effect>>>,
}

impl RecordingEffects {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn effects(&self) -> Vec<Effect> {
        self.log.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn count(&self, pred: impl Fn(&Effect) -> bool) -> usize {
        self.log
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .filter(|e| pred(e))
            .count()
    }

    fn push(&self, effect: Effect) {
        self.log.lock().unwrap_or_else(|p| p.into_inner()).push(effect);
    }
}

impl ClientEffects for RecordingEffects {
    fn draw(&mut self, overlay: &Overlay) {
        self.push(Effect::Drew(overlay.clone()));
    }

    fn clear_overlays(&mut self) {
        self.push(Effect::Cleared);
    }

    fn open_screen(&mut self, screen: &str) -> anyhow::Result<()> {
        self.push(Effect::OpenedScreen(screen.to_string()));
        Ok(())
    }

    fn close_screen(&mut self) {
        self.push(Effect::ClosedScreen);
    }

    fn log(&mut self, level: &str, text: &str) {
        self.push(Effect::Logged {
            level: level.to_string(),
            text: text.to_string(),
        });
    }

    fn play_audio(&mut self, sound: &str, volume: f64, pitch: f64) -> anyhow::Result<()> {
        self.push(Effect::PlayedAudio {
            sound: sound.to_string(),
            volume,
            pitch,
        });
        Ok(())
    }

    fn open_link(&mut self, url: &Url) -> anyhow::Result<()> {
        self.push(Effect::OpenedLink(url.to_string()));
        Ok(())
    }

    fn mailto(&mut self, address: &str) -> anyhow::Result<()> {
        self.push(Effect::Mailed(address.to_string()));
        Ok(())
    }

    fn set_preference(&mut self, key: &str, value: &str) -> anyhow::Result<()> {
        self.push(Effect::SetPreference {
            key: key.to_string(),
            value: value.to_string(),
        });
        Ok(())
    }
}

/// Fixed property values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct StaticProperties {
    pub launch_version: String,
    pub fps: i64,
    pub paused: bool,
    pub free_memory: i64,
    pub command_history: Vec<String>,
}

impl Default for StaticProperties {
    fn default() -> Self {
        Self {
            launch_version: env!("CARGO_PKG_VERSION").to_string(),
            fps: 60,
            paused: false,
            free_memory: 512 * 1024 * 1024,
            command_history: Vec::new(),
        }
    }
}

impl ClientProperties for StaticProperties {
    fn launch_version(&self) -> String {
        self.launch_version.clone()
    }

    fn fps(&self) -> i64 {
        self.fps
    }

    fn paused(&self) -> bool {
        self.paused
    }

    fn free_memory(&self) -> i64 {
        self.free_memory
    }

    fn command_history(&self) -> Vec<String> {
        self.command_history.clone()
    }
}
