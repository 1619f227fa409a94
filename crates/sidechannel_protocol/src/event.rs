use std::collections::BTreeMap;

use bytes::Bytes;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumIter};
use thiserror::Error;

use crate::envelope::Frame;
use crate::message::{CodecError, ParamValue, Wire};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, AsRefStr, Display, EnumIter)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum InputAction {
    Release,
    Press,
    Repeat,
}

impl InputAction {
    fn code(self) -> i64 {
        self as i64
    }

    fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(InputAction::Release),
            1 => Some(InputAction::Press),
            2 => Some(InputAction::Repeat),
            _ => None,
        }
    }
}

/// Notifications the client pushes to the server once events are enabled.
///
/// On the wire each variant is a small integer id plus a map of named
/// parameters. The ids are fixed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ClientEvent {
    KeyPressed { key: i64, flags: i64, action: InputAction },
    MouseMoved { x: f64, y: f64 },
    MouseScrolled { x: f64, y: f64 },
    MouseClicked { button: i64, action: InputAction, mods: i64 },
    ScreenChanged { old: Option<String>, new: Option<String> },
    ButtonClicked { button: String, screen: String },
    CheckboxToggled { button: String, screen: String, state: bool },
    TextEdited { widget: String, screen: String, text: String },
    ButtonCycled { button: String, screen: String, value: ParamValue },
}

#[derive(Debug, Error)]
pub enum EventError {
    #[error("unknown client event id {0}")]
    UnknownId(i32),

    #[error("client event {id} is missing or has a bad `{field}` parameter")]
    BadParam { id: i32, field: &'static str },

    #[error(transparent)]
    Codec(#[from] CodecError),
}

type Params = BTreeMap<String, ParamValue>;

impl ClientEvent {
    pub fn id(&self) -> i32 {
        match self {
            ClientEvent::KeyPressed { .. } => 0,
            ClientEvent::MouseMoved { .. } => 1,
            ClientEvent::MouseScrolled { .. } => 2,
            ClientEvent::MouseClicked { .. } => 3,
            ClientEvent::ScreenChanged { .. } => 4,
            ClientEvent::ButtonClicked { .. } => 5,
            ClientEvent::CheckboxToggled { .. } => 6,
            ClientEvent::TextEdited { .. } => 7,
            ClientEvent::ButtonCycled { .. } => 8,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::KeyPressed { .. } => "key_pressed",
            ClientEvent::MouseMoved { .. } => "mouse_moved",
            ClientEvent::MouseScrolled { .. } => "mouse_scrolled",
            ClientEvent::MouseClicked { .. } => "mouse_clicked",
            ClientEvent::ScreenChanged { .. } => "screen_changed",
            ClientEvent::ButtonClicked { .. } => "button_clicked",
            ClientEvent::CheckboxToggled { .. } => "checkbox_toggled",
            ClientEvent::TextEdited { .. } => "text_edited",
            ClientEvent::ButtonCycled { .. } => "button_cycled",
        }
    }

    pub fn params(&self) -> Params {
        let mut p = Params::new();
        let mut put = |k: &str, v: ParamValue| {
            p.insert(k.to_string(), v);
        };
        let opt = |s: &Option<String>| s.clone().map(ParamValue::Text).unwrap_or(ParamValue::Null);
        match self {
            ClientEvent::KeyPressed { key, flags, action } => {
                put("key", (*key).into());
                put("flags", (*flags).into());
                put("action", action.code().into());
            }
            ClientEvent::MouseMoved { x, y } | ClientEvent::MouseScrolled { x, y } => {
                put("x", (*x).into());
                put("y", (*y).into());
            }
            ClientEvent::MouseClicked { button, action, mods } => {
                put("button", (*button).into());
                put("action", action.code().into());
                put("mods", (*mods).into());
            }
            ClientEvent::ScreenChanged { old, new } => {
                put("old", opt(old));
                put("new", opt(new));
            }
            ClientEvent::ButtonClicked { button, screen } => {
                put("button", button.as_str().into());
                put("screen", screen.as_str().into());
            }
            ClientEvent::CheckboxToggled { button, screen, state } => {
                put("button", button.as_str().into());
                put("screen", screen.as_str().into());
                put("state", (*state).into());
            }
            ClientEvent::TextEdited { widget, screen, text } => {
                put("widget", widget.as_str().into());
                put("screen", screen.as_str().into());
                put("text", text.as_str().into());
            }
            ClientEvent::ButtonCycled { button, screen, value } => {
                put("button", button.as_str().into());
                put("screen", screen.as_str().into());
                put("value", value.clone());
            }
        }
        p
    }

    pub fn to_frame(&self) -> Result<Frame, CodecError> {
        Ok(Frame::ClientEvent {
            event_id: self.id(),
            params: ParamValue::Map(self.params()).to_wire()?,
        })
    }

    pub fn decode(event_id: i32, params: &Bytes) -> Result<Self, EventError> {
        let value = ParamValue::from_wire(params)?;
        let empty = Params::new();
        let p = value.as_map().unwrap_or(&empty);
        Self::from_params(event_id, p)
    }

    pub fn from_params(id: i32, p: &Params) -> Result<Self, EventError> {
        let bad = |field| EventError::BadParam { id, field };
        let int = |field: &'static str| p.get(field).and_then(ParamValue::as_int).ok_or_else(|| bad(field));
        let float = |field: &'static str| p.get(field).and_then(ParamValue::as_float).ok_or_else(|| bad(field));
        let text = |field: &'static str| {
            p.get(field)
                .and_then(ParamValue::as_text)
                .map(str::to_string)
                .ok_or_else(|| bad(field))
        };
        let action = |field: &'static str| {
            p.get(field)
                .and_then(ParamValue::as_int)
                .and_then(InputAction::from_code)
                .ok_or_else(|| bad(field))
        };
        let opt_text = |field: &'static str| p.get(field).and_then(ParamValue::as_text).map(str::to_string);

        let event = match id {
            0 => ClientEvent::KeyPressed {
                key: int("key")?,
                flags: int("flags")?,
                action: action("action")?,
            },
            1 => ClientEvent::MouseMoved { x: float("x")?, y: float("y")? },
            2 => ClientEvent::MouseScrolled { x: float("x")?, y: float("y")? },
            3 => ClientEvent::MouseClicked {
                button: int("button")?,
                action: action("action")?,
                mods: int("mods")?,
            },
            4 => ClientEvent::ScreenChanged {
                old: opt_text("old"),
                new: opt_text("new"),
            },
            5 => ClientEvent::ButtonClicked {
                button: text("button")?,
                screen: text("screen")?,
            },
            6 => ClientEvent::CheckboxToggled {
                button: text("button")?,
                screen: text("screen")?,
                state: p.get("state").and_then(ParamValue::as_bool).ok_or_else(|| bad("state"))?,
            },
            7 => ClientEvent::TextEdited {
                widget: text("widget")?,
                screen: text("screen")?,
                text: text("text")?,
            },
            8 => ClientEvent::ButtonCycled {
                button: text("button")?,
                screen: text("screen")?,
                value: p.get("value").cloned().unwrap_or(ParamValue::Null),
            },
            other => return Err(EventError::UnknownId(other)),
        };
        Ok(event)
    }
}
