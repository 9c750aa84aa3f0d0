//! Grimoire value types carried by the game channel and shipped to viewers.
//!
//! All types are plain owned data: they are deserialized once at the inbound
//! boundary and never hold references into the observed page.

use serde::{Deserialize, Serialize};

/// Pixel rectangle in page coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub left: f64,
    pub top: f64,
    pub width: f64,
    pub height: f64,
}

/// Fractional insets of the overlay relative to the video frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Offsets {
    pub top: f64,
    pub right: f64,
    pub bottom: f64,
    pub left: f64,
}

impl Offsets {
    /// Insets used before the broadcaster has calibrated anything.
    pub const DEFAULT: Offsets = Offsets {
        top: 0.0,
        right: 0.22,
        bottom: 0.0,
        left: 0.22,
    };
}

impl Default for Offsets {
    fn default() -> Self {
        Self::DEFAULT
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CharacterType {
    Townsfolk,
    Outsider,
    Minion,
    Demon,
    Traveler,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CharacterAlignment {
    Good,
    Evil,
    #[serde(other)]
    Unknown,
}

/// A character on the script sheet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Character {
    pub id: String,
    pub name: String,
    pub ability: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wiki_url: Option<String>,
    #[serde(rename = "type")]
    pub kind: CharacterType,
    pub alignment: CharacterAlignment,
}

/// The script currently loaded in the grimoire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Script {
    pub name: String,
    pub author: String,
    pub characters: Vec<Character>,
}

/// The character token sitting in front of a seat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerCharacter {
    pub id: String,
    /// Raw alignment marker from the page (`"g"`, `"e"` or absent).
    #[serde(default)]
    pub alignment: Option<String>,
    pub team: CharacterType,
}

/// One seat around the town square, in seating order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Seat {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<PlayerCharacter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pos: Option<Bounds>,
    pub is_dead: bool,
    pub is_voteless: bool,
    pub revealed: bool,
}

/// Grimoire geometry and display mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Grimoire {
    pub pos: Bounds,
    pub container: Bounds,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
}

impl Grimoire {
    pub fn is_reveal(&self) -> bool {
        self.mode.as_deref() == Some("reveal")
    }

    pub fn is_grimoire(&self) -> bool {
        self.mode.as_deref() == Some("grimoire")
    }
}

/// Overlay placement as shown to viewers.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OverlayPosition {
    pub pos: Offsets,
}

/// Coarse phase of the game, derived from page signals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "lowercase")]
pub enum GamePhase {
    #[default]
    Inactive,
    Running { count: u32 },
    Reveal,
}

impl GamePhase {
    /// Advance from `self` towards `target`.
    ///
    /// `running` and `reveal` are always accepted. Any other target is only
    /// accepted while revealing, so a stray `inactive` cannot end a live game.
    pub fn step(self, target: GamePhase) -> GamePhase {
        match (self, target) {
            (_, GamePhase::Running { .. }) | (_, GamePhase::Reveal) => target,
            (GamePhase::Reveal, _) => target,
            _ => self,
        }
    }
}
