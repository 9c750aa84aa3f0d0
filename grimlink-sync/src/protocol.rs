//! JSON message protocol spoken on the game and control channels, plus the
//! payloads shipped to extension viewers.
//!
//! Game channel frames are either the bare keepalive token `ping` or an
//! object of the form:
//! ```text
//! { "type": "<kind>", "payload": <kind-specific JSON> }
//! ```
//! The `type` discriminant is matched into [`InboundMessage`] explicitly;
//! anything that is not an object with a string `type` and a `payload` key
//! is rejected before it can reach the state store.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::diff::StateDiff;
use crate::model::{GamePhase, Grimoire, Offsets, Script, Seat};

/// Keepalive token sent periodically by the data source.
pub const PING: &str = "ping";

/// Protocol errors. Every variant is a malformed message: it is logged and
/// dropped, never applied.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Invalid JSON: {0}")]
    InvalidJson(#[source] serde_json::Error),
    #[error("Message is not an object")]
    NotAnObject,
    #[error("Message has no string `type`")]
    MissingType,
    #[error("Message has no `payload`")]
    MissingPayload,
    #[error("Invalid payload for `{kind}`: {reason}")]
    InvalidPayload { kind: String, reason: String },
}

/// `navigate` payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NavigateDetail {
    #[serde(default)]
    pub page: Option<String>,
}

/// `overlayOffsets` payload.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OverlayOffsets {
    pub offsets: Offsets,
}

/// `gameState` payload, as read from the page's game store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameState {
    pub phase: u32,
    pub is_running: bool,
    pub is_night: bool,
}

impl GameState {
    /// The phase this state asks for, if any.
    pub fn requested_phase(&self) -> Option<GamePhase> {
        self.is_running
            .then_some(GamePhase::Running { count: self.phase })
    }
}

/// A validated game channel message.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    Navigate(NavigateDetail),
    ScriptChanged(Script),
    PlayersChanged(Vec<Seat>),
    Size(Grimoire),
    OverlayOffsets(OverlayOffsets),
    StartCalibration,
    EndCalibration,
    GameState(GameState),
}

impl InboundMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            InboundMessage::Navigate(_) => "navigate",
            InboundMessage::ScriptChanged(_) => "scriptChanged",
            InboundMessage::PlayersChanged(_) => "playersChanged",
            InboundMessage::Size(_) => "size",
            InboundMessage::OverlayOffsets(_) => "overlayOffsets",
            InboundMessage::StartCalibration => "startCalibration",
            InboundMessage::EndCalibration => "endCalibration",
            InboundMessage::GameState(_) => "gameState",
        }
    }
}

/// One decoded game channel frame.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    /// Keepalive only.
    Ping,
    Message(InboundMessage),
    /// Well-formed, but of a `type` we do not handle.
    Unrecognized(String),
}

/// Parse a raw text frame from the game channel.
///
/// Accepts the keepalive as either bare `ping` or the JSON string `"ping"`.
pub fn parse_inbound(text: &str) -> Result<InboundFrame, ProtocolError> {
    if text.trim() == PING {
        return Ok(InboundFrame::Ping);
    }

    let value: Value = serde_json::from_str(text).map_err(ProtocolError::InvalidJson)?;
    if value.as_str() == Some(PING) {
        return Ok(InboundFrame::Ping);
    }

    let (kind, payload) = split_envelope(value)?;
    let message = match kind.as_str() {
        "navigate" => InboundMessage::Navigate(payload_as(&kind, payload)?),
        "scriptChanged" => InboundMessage::ScriptChanged(payload_as(&kind, payload)?),
        "playersChanged" => InboundMessage::PlayersChanged(payload_as(&kind, payload)?),
        "size" => InboundMessage::Size(payload_as(&kind, payload)?),
        "overlayOffsets" => InboundMessage::OverlayOffsets(payload_as(&kind, payload)?),
        "startCalibration" => InboundMessage::StartCalibration,
        "endCalibration" => InboundMessage::EndCalibration,
        "gameState" => InboundMessage::GameState(payload_as(&kind, payload)?),
        _ => return Ok(InboundFrame::Unrecognized(kind)),
    };
    Ok(InboundFrame::Message(message))
}

/// Check the `{type, payload}` shape and pull both out.
fn split_envelope(value: Value) -> Result<(String, Value), ProtocolError> {
    let Value::Object(mut object) = value else {
        return Err(ProtocolError::NotAnObject);
    };
    let kind = match object.remove("type") {
        Some(Value::String(kind)) => kind,
        _ => return Err(ProtocolError::MissingType),
    };
    let payload = object.remove("payload").ok_or(ProtocolError::MissingPayload)?;
    Ok((kind, payload))
}

fn payload_as<T: DeserializeOwned>(kind: &str, payload: Value) -> Result<T, ProtocolError> {
    serde_json::from_value(payload).map_err(|e| ProtocolError::InvalidPayload {
        kind: kind.to_string(),
        reason: e.to_string(),
    })
}

/// Messages sent to the data source over the game channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum OutboundMessage {
    StartCalibration,
    EndCalibration,
}

impl OutboundMessage {
    pub fn to_text(&self) -> String {
        match self {
            OutboundMessage::StartCalibration => r#"{"type":"startCalibration"}"#,
            OutboundMessage::EndCalibration => r#"{"type":"endCalibration"}"#,
        }
        .to_string()
    }
}

/// Messages delivered to extension viewers over PubSub.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ViewerMessage {
    /// Batched field changes since the previous flush.
    BulkUpdateState { payload: StateDiff },
    /// Ask the broadcaster's own viewer to show the calibration overlay.
    StartCalibration {
        calibration_id: String,
        inset: f64,
        existing_bounds: Offsets,
    },
    EndCalibration { calibration_id: String },
}

/// Messages accepted on the control channel (the popup's side of the relay).
#[derive(Debug, Clone, PartialEq)]
pub enum ControlMessage {
    GetState,
    StartCalibration,
    EndCalibration,
    OverlayOffsets(OverlayOffsets),
    /// Sign-in state changed; `None` signs out.
    Identity(Option<String>),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IdentityPayload {
    #[serde(default)]
    broadcaster_id: Option<String>,
}

/// Parse a raw text frame from the control channel.
///
/// Commands are bare words (`getState`, optionally JSON-quoted); data-bearing
/// messages use the `{type, payload}` envelope.
pub fn parse_control(text: &str) -> Result<Option<ControlMessage>, ProtocolError> {
    let value: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(_) => Value::String(text.trim().to_string()),
    };

    if let Value::String(command) = &value {
        return Ok(match command.as_str() {
            "getState" => Some(ControlMessage::GetState),
            "startCalibration" => Some(ControlMessage::StartCalibration),
            "endCalibration" => Some(ControlMessage::EndCalibration),
            _ => None,
        });
    }

    let (kind, payload) = split_envelope(value)?;
    Ok(match kind.as_str() {
        "overlayOffsets" => Some(ControlMessage::OverlayOffsets(payload_as(&kind, payload)?)),
        "identity" => {
            let identity: IdentityPayload = payload_as(&kind, payload)?;
            Some(ControlMessage::Identity(identity.broadcaster_id))
        }
        _ => None,
    })
}
