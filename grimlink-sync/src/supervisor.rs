//! Supervision of the single game channel.
//!
//! ```text
//!              open                 close               grace expired
//! Disconnected ────► Connected(ch) ──────► Waiting(ch) ─────────────► Disconnected
//!                        ▲                     │
//!                        └──── open (new) ─────┘
//! ```
//!
//! The data source lives in a browser tab and drops its socket on every
//! navigation. A close only moves to `Waiting`; `disconnected` is emitted
//! once the grace period runs out with no replacement channel. Events from
//! superseded channels are ignored.

use std::fmt;

use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{Duration, Instant};
use uuid::Uuid;

use crate::diff::FieldUpdate;
use crate::model::{GamePhase, Offsets, OverlayPosition};
use crate::protocol::{parse_inbound, InboundFrame, InboundMessage, OutboundMessage};
use crate::state::{StateSnapshot, StateStore};
use crate::throttle::sleep_until;

/// Default time a closed channel may be replaced before `disconnected`.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_millis(5000);

/// Capacity of the supervisor event channel.
const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId(Uuid);

impl ChannelId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ChannelId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Instruction for the task owning a channel's socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelCommand {
    Send(OutboundMessage),
    Close,
}

/// Handle to one data-source connection.
#[derive(Debug, Clone)]
pub struct Channel {
    id: ChannelId,
    tx: mpsc::UnboundedSender<ChannelCommand>,
}

impl Channel {
    /// Create a channel handle and the command stream its socket task drains.
    pub fn open() -> (Self, mpsc::UnboundedReceiver<ChannelCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { id: ChannelId::new(), tx }, rx)
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    fn send(&self, message: OutboundMessage) -> bool {
        self.tx.send(ChannelCommand::Send(message)).is_ok()
    }

    fn close(&self) {
        let _ = self.tx.send(ChannelCommand::Close);
    }
}

#[derive(Debug)]
enum Connection {
    Disconnected,
    Connected { channel: Channel },
    Waiting { channel: Channel, grace_deadline: Instant },
}

impl Connection {
    fn channel(&self) -> Option<&Channel> {
        match self {
            Connection::Disconnected => None,
            Connection::Connected { channel } | Connection::Waiting { channel, .. } => {
                Some(channel)
            }
        }
    }
}

/// Externally visible connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Disconnected,
    Connected,
    Waiting,
}

/// Input from the channel server.
#[derive(Debug)]
pub enum ChannelEvent {
    Opened(Channel),
    Message { channel: ChannelId, text: String },
    Closed(ChannelId),
}

/// Input from the control plane.
#[derive(Debug)]
pub enum SupervisorCommand {
    Send(OutboundMessage),
    SetOverlay(Offsets),
    Snapshot(oneshot::Sender<StateSnapshot>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalibrationSignal {
    Start,
    End,
}

/// Published to every subscriber.
#[derive(Debug, Clone, PartialEq)]
pub enum SupervisorEvent {
    Lifecycle(ConnectionStatus),
    /// Offsets reported by the data source; config only, never diffed.
    OverlayOffsets(Offsets),
    Calibration(CalibrationSignal),
}

pub struct ConnectionSupervisor {
    connection: Connection,
    grace_period: Duration,
    store: StateStore,
    events: broadcast::Sender<SupervisorEvent>,
}

impl ConnectionSupervisor {
    pub fn new(store: StateStore, grace_period: Duration) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            connection: Connection::Disconnected,
            grace_period,
            store,
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.events.subscribe()
    }

    pub fn status(&self) -> ConnectionStatus {
        match self.connection {
            Connection::Disconnected => ConnectionStatus::Disconnected,
            Connection::Connected { .. } => ConnectionStatus::Connected,
            Connection::Waiting { .. } => ConnectionStatus::Waiting,
        }
    }

    pub fn snapshot(&self) -> &StateSnapshot {
        self.store.snapshot()
    }

    pub fn grace_deadline(&self) -> Option<Instant> {
        match self.connection {
            Connection::Waiting { grace_deadline, .. } => Some(grace_deadline),
            _ => None,
        }
    }

    fn publish(&self, event: SupervisorEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    fn is_current(&self, id: ChannelId) -> bool {
        self.connection.channel().is_some_and(|channel| channel.id == id)
    }

    /// Adopt a new channel, superseding any previous one.
    pub fn connect(&mut self, channel: Channel) {
        let previous = std::mem::replace(
            &mut self.connection,
            Connection::Connected {
                channel: channel.clone(),
            },
        );
        match previous {
            Connection::Waiting { channel: old, .. } => {
                log::info!("Game channel {} replaced {} within grace period", channel.id, old.id);
                old.close();
            }
            Connection::Connected { channel: old } if old.id != channel.id => {
                log::info!("Game channel {} supersedes {}", channel.id, old.id);
                old.close();
            }
            _ => log::info!("Game channel {} connected", channel.id),
        }
        self.publish(SupervisorEvent::Lifecycle(ConnectionStatus::Connected));
    }

    /// The socket behind `id` went away.
    pub fn channel_closed(&mut self, id: ChannelId, now: Instant) {
        let Connection::Connected { channel } = &self.connection else {
            log::debug!("Ignoring close of channel {id} while {:?}", self.status());
            return;
        };
        if channel.id != id {
            log::debug!("Ignoring close of superseded channel {id}");
            return;
        }

        let grace_deadline = now + self.grace_period;
        log::info!("Game channel {id} closed, waiting {:?} for reconnect", self.grace_period);
        self.connection = Connection::Waiting {
            channel: channel.clone(),
            grace_deadline,
        };
        self.publish(SupervisorEvent::Lifecycle(ConnectionStatus::Waiting));
    }

    /// End the grace period if it has run out.
    pub fn expire(&mut self, now: Instant) {
        match self.connection {
            Connection::Waiting { grace_deadline, .. } if grace_deadline <= now => {
                log::info!("No reconnect within grace period, game disconnected");
                self.connection = Connection::Disconnected;
                self.publish(SupervisorEvent::Lifecycle(ConnectionStatus::Disconnected));
            }
            _ => {}
        }
    }

    /// Deliver a message to the data source, if a channel is held.
    pub fn send(&self, message: OutboundMessage) -> bool {
        match self.connection.channel() {
            Some(channel) => {
                let delivered = channel.send(message);
                if !delivered {
                    log::debug!("Channel {} gone, dropped {:?}", channel.id, message);
                }
                delivered
            }
            None => {
                log::debug!("No game channel, dropped {message:?}");
                false
            }
        }
    }

    /// Handle one raw frame from the data source.
    pub fn dispatch(&mut self, text: &str) {
        match parse_inbound(text) {
            Ok(InboundFrame::Ping) => log::trace!("Keepalive"),
            Ok(InboundFrame::Unrecognized(kind)) => log::debug!("Ignoring message of type {kind}"),
            Ok(InboundFrame::Message(message)) => {
                log::debug!("Applying {}", message.kind());
                self.apply(message);
            }
            Err(e) => log::warn!("Dropping malformed message: {e}"),
        }
    }

    fn apply(&mut self, message: InboundMessage) {
        match message {
            InboundMessage::Navigate(detail) => {
                self.store.set_field(FieldUpdate::Page(detail.page))
            }
            InboundMessage::ScriptChanged(script) => {
                self.store.set_field(FieldUpdate::Script(Some(script)));
                self.store.step_phase(GamePhase::Inactive);
            }
            InboundMessage::PlayersChanged(seats) => {
                self.store.set_field(FieldUpdate::Seats(Some(seats)))
            }
            InboundMessage::Size(grim) => {
                if grim.is_reveal() {
                    self.store.step_phase(GamePhase::Reveal);
                } else if grim.is_grimoire() && self.store.phase() == GamePhase::Reveal {
                    self.store.step_phase(GamePhase::Inactive);
                }
                self.store.set_field(FieldUpdate::Grim(Some(grim)));
            }
            InboundMessage::OverlayOffsets(overlay) => {
                self.publish(SupervisorEvent::OverlayOffsets(overlay.offsets));
            }
            InboundMessage::StartCalibration => {
                self.publish(SupervisorEvent::Calibration(CalibrationSignal::Start));
            }
            InboundMessage::EndCalibration => {
                self.publish(SupervisorEvent::Calibration(CalibrationSignal::End));
            }
            InboundMessage::GameState(state) => {
                if let Some(phase) = state.requested_phase() {
                    self.store.step_phase(phase);
                }
            }
        }
    }

    fn handle_event(&mut self, event: ChannelEvent, now: Instant) {
        match event {
            ChannelEvent::Opened(channel) => self.connect(channel),
            ChannelEvent::Closed(id) => self.channel_closed(id, now),
            ChannelEvent::Message { channel, text } => {
                if self.is_current(channel) {
                    self.dispatch(&text);
                } else {
                    log::debug!("Ignoring message from superseded channel {channel}");
                }
            }
        }
    }

    fn handle_command(&mut self, command: SupervisorCommand) {
        match command {
            SupervisorCommand::Send(message) => {
                self.send(message);
            }
            SupervisorCommand::SetOverlay(offsets) => {
                self.store
                    .set_field(FieldUpdate::Overlay(Some(OverlayPosition { pos: offsets })));
            }
            SupervisorCommand::Snapshot(reply) => {
                let _ = reply.send(self.store.snapshot().clone());
            }
        }
    }

    /// Drive the supervisor until the channel server goes away.
    pub async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<ChannelEvent>,
        mut commands: mpsc::UnboundedReceiver<SupervisorCommand>,
    ) {
        let mut commands_open = true;
        loop {
            let deadline = self.grace_deadline();
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event, Instant::now()),
                    None => break,
                },
                command = commands.recv(), if commands_open => match command {
                    Some(command) => self.handle_command(command),
                    None => commands_open = false,
                },
                _ = sleep_until(deadline) => self.expire(Instant::now()),
            }
        }
        log::debug!("Supervisor stopped");
    }
}
