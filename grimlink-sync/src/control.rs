//! The broadcaster-facing side of the relay: state queries, calibration,
//! overlay offsets and sign-in, as sent by the extension popup.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use uuid::Uuid;

use crate::broadcast::{BroadcastClient, BroadcasterId};
use crate::model::Offsets;
use crate::overlay::OverlayStore;
use crate::protocol::{parse_control, ControlMessage, OutboundMessage, ViewerMessage};
use crate::state::StateSnapshot;
use crate::supervisor::SupervisorCommand;

/// Inset of the calibration frame shown to the broadcaster.
pub const CALIBRATION_INSET: f64 = 0.2;

/// Reply to `getState`.
#[derive(Debug, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "camelCase")]
pub enum ControlReply {
    State(StateSnapshot),
}

#[derive(Debug, Clone)]
pub struct ControlPlane {
    commands: mpsc::UnboundedSender<SupervisorCommand>,
    identity: Arc<watch::Sender<Option<BroadcasterId>>>,
    client: BroadcastClient,
    overlay: OverlayStore,
    calibration: Arc<Mutex<Option<String>>>,
}

impl ControlPlane {
    pub fn new(
        commands: mpsc::UnboundedSender<SupervisorCommand>,
        identity: watch::Sender<Option<BroadcasterId>>,
        client: BroadcastClient,
        overlay: OverlayStore,
    ) -> Self {
        Self {
            commands,
            identity: Arc::new(identity),
            client,
            overlay,
            calibration: Arc::new(Mutex::new(None)),
        }
    }

    pub fn identity(&self) -> Option<BroadcasterId> {
        self.identity.borrow().clone()
    }

    /// Handle one control frame, returning the reply to send back, if any.
    pub async fn handle(&self, text: &str) -> Option<String> {
        let message = match parse_control(text) {
            Ok(Some(message)) => message,
            Ok(None) => {
                log::debug!("Ignoring unknown control message");
                return None;
            }
            Err(e) => {
                log::warn!("Dropping malformed control message: {e}");
                return None;
            }
        };

        match message {
            ControlMessage::GetState => self.state().await,
            ControlMessage::StartCalibration => {
                self.start_calibration().await;
                None
            }
            ControlMessage::EndCalibration => {
                self.end_calibration().await;
                None
            }
            ControlMessage::OverlayOffsets(overlay) => {
                self.set_offsets(overlay.offsets).await;
                None
            }
            ControlMessage::Identity(id) => {
                let id = id.filter(|id| !id.is_empty()).map(BroadcasterId::new);
                match &id {
                    Some(id) => log::info!("Signed in as broadcaster {id}"),
                    None => log::info!("Signed out"),
                }
                self.identity.send_replace(id);
                None
            }
        }
    }

    async fn state(&self) -> Option<String> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command(SupervisorCommand::Snapshot(reply_tx));
        let snapshot = reply_rx.await.ok()?;
        match serde_json::to_string(&ControlReply::State(snapshot)) {
            Ok(json) => Some(json),
            Err(e) => {
                log::error!("Failed to serialize state: {e}");
                None
            }
        }
    }

    async fn start_calibration(&self) {
        let Some(broadcaster) = self.identity() else {
            log::warn!("Calibration requested without a broadcaster identity");
            return;
        };
        let calibration_id = Uuid::new_v4().to_string();
        *self.calibration.lock().await = Some(calibration_id.clone());

        let message = ViewerMessage::StartCalibration {
            calibration_id,
            inset: CALIBRATION_INSET,
            existing_bounds: self.overlay.existing_bounds().await,
        };
        self.client
            .whisper(&broadcaster, &broadcaster.opaque_user_id(), &message)
            .await;
        self.command(SupervisorCommand::Send(OutboundMessage::StartCalibration));
    }

    async fn end_calibration(&self) {
        let Some(broadcaster) = self.identity() else {
            log::warn!("Calibration end requested without a broadcaster identity");
            return;
        };
        let calibration_id = self
            .calibration
            .lock()
            .await
            .take()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let message = ViewerMessage::EndCalibration { calibration_id };
        self.client
            .whisper(&broadcaster, &broadcaster.opaque_user_id(), &message)
            .await;
        self.command(SupervisorCommand::Send(OutboundMessage::EndCalibration));
    }

    async fn set_offsets(&self, offsets: Offsets) {
        if let Err(e) = self.overlay.set(offsets).await {
            log::error!("Failed to store overlay offsets: {e}");
        }
        self.command(SupervisorCommand::SetOverlay(offsets));
    }

    fn command(&self, command: SupervisorCommand) {
        if self.commands.send(command).is_err() {
            log::warn!("Supervisor is not running");
        }
    }
}
