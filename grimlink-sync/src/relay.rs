//! Assembly of the full relay from a [`RelayConfig`].

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use crate::broadcast::{BroadcastClient, ErrorReporter, ExtensionApi};
use crate::config::RelayConfig;
use crate::control::ControlPlane;
use crate::overlay::{OverlayError, OverlayStore};
use crate::server::ChannelServer;
use crate::state::StateStore;
use crate::supervisor::{ConnectionStatus, ConnectionSupervisor, SupervisorCommand, SupervisorEvent};
use crate::sync::BatchSynchronizer;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("Server I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Overlay store unavailable: {0}")]
    Overlay(#[from] OverlayError),
    #[error("Server task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

pub struct Relay {
    config: RelayConfig,
    api: Arc<dyn ExtensionApi>,
    reporter: Option<Arc<dyn ErrorReporter>>,
}

/// A started relay.
pub struct RunningRelay {
    local_addr: SocketAddr,
    events: broadcast::Receiver<SupervisorEvent>,
    server: JoinHandle<io::Result<()>>,
}

impl RunningRelay {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Supervisor events (lifecycle, calibration, overlay reports).
    pub fn events(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.events.resubscribe()
    }

    /// Wait for the server to stop.
    pub async fn wait(self) -> Result<(), RelayError> {
        self.server.await??;
        Ok(())
    }

    pub fn shutdown(self) {
        self.server.abort();
    }
}

impl Relay {
    pub fn new(config: RelayConfig, api: Arc<dyn ExtensionApi>) -> Self {
        Self {
            config,
            api,
            reporter: None,
        }
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn ErrorReporter>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    /// Bind the channel server and start every task.
    pub async fn spawn(self) -> Result<RunningRelay, RelayError> {
        let config = self.config;

        let overlay = match &config.overlay_path {
            Some(path) => OverlayStore::open(path).await?,
            None => OverlayStore::in_memory(),
        };

        let mut client = BroadcastClient::new(self.api);
        if let Some(reporter) = self.reporter {
            client = client.with_reporter(reporter);
        }

        let (identity_tx, identity_rx) = watch::channel(config.broadcaster_id.clone());
        let (updates_tx, updates_rx) = mpsc::unbounded_channel();
        let synchronizer =
            BatchSynchronizer::new(config.sync_config(), client.clone(), identity_rx);
        tokio::spawn(synchronizer.run(updates_rx));

        let supervisor =
            ConnectionSupervisor::new(StateStore::new(updates_tx), config.grace_period());
        let events = supervisor.subscribe();
        let presence = supervisor.subscribe();
        let (channel_tx, channel_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        tokio::spawn(supervisor.run(channel_rx, commands_rx));
        tokio::spawn(watch_supervisor(presence, overlay.clone(), commands_tx.clone()));

        let control = ControlPlane::new(commands_tx, identity_tx, client, overlay);
        let server = ChannelServer::bind(config.bind_addr, channel_tx, control)
            .await
            .map_err(|source| RelayError::Bind {
                addr: config.bind_addr,
                source,
            })?;
        let local_addr = server.local_addr()?;

        match &config.broadcaster_id {
            Some(id) => log::info!("Relay ready on {local_addr} for broadcaster {id}"),
            None => log::info!("Relay ready on {local_addr}, waiting for broadcaster sign-in"),
        }

        Ok(RunningRelay {
            local_addr,
            events,
            server: tokio::spawn(server.run()),
        })
    }

    /// Start the relay and run until the server stops.
    pub async fn run(self) -> Result<(), RelayError> {
        self.spawn().await?.wait().await
    }
}

/// React to supervisor events: presence logging, overlay persistence and
/// re-applying the stored overlay whenever the game reconnects.
async fn watch_supervisor(
    mut events: broadcast::Receiver<SupervisorEvent>,
    overlay: OverlayStore,
    commands: mpsc::UnboundedSender<SupervisorCommand>,
) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                log::warn!("Presence watcher lagged, missed {missed} events");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        match event {
            SupervisorEvent::Lifecycle(status) => {
                log::info!("Game {status:?}");
                if status == ConnectionStatus::Connected {
                    if let Some(offsets) = overlay.get().await {
                        let _ = commands.send(SupervisorCommand::SetOverlay(offsets));
                    }
                }
            }
            SupervisorEvent::OverlayOffsets(offsets) => {
                if let Err(e) = overlay.set(offsets).await {
                    log::error!("Failed to store overlay offsets: {e}");
                }
            }
            SupervisorEvent::Calibration(signal) => {
                log::info!("Game reported calibration {signal:?}")
            }
        }
    }
}
