use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumIter, EnumString};

/// A named permission that gates one or more logical ids.
///
/// The string forms are persisted and typed on the command line, so they are
/// part of the public surface and must stay stable.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    JsonSchema,
    EnumString,
    AsRefStr,
    Display,
    EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Capability {
    /// The minimal handshake the channel needs to work at all. Never changeable.
    Required,
    Draw,
    Screens,
    Audio,
    OpenLinks,
    ExternalApplications,
    ReadSystemProperties,
    ReadDisplayProperties,
    ReadClientProperties,
    ChangePreferences,
}

impl Capability {
    pub const fn default_granted(self) -> bool {
        match self {
            Capability::Required
            | Capability::Draw
            | Capability::Screens
            | Capability::Audio
            | Capability::OpenLinks
            | Capability::ReadDisplayProperties
            | Capability::ReadClientProperties => true,
            Capability::ExternalApplications
            | Capability::ReadSystemProperties
            | Capability::ChangePreferences => false,
        }
    }

    pub const fn user_changeable(self) -> bool {
        !matches!(self, Capability::Required)
    }
}
