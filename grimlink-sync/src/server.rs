//! WebSocket server carrying the game and control channels.
//!
//! ```text
//! content script ── ws://host/game ────► socket task ── ChannelEvent ──► ConnectionSupervisor
//!                                             ▲                                │
//!                                             └──── ChannelCommand ────────────┘
//!
//! popup ─────────── ws://host/control ─► socket task ──► ControlPlane
//! ```
//!
//! Each accepted socket gets its own task. Game sockets never touch state
//! directly: they only forward frames to the supervisor and execute the
//! commands it sends back.

use std::io;
use std::net::SocketAddr;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::control::ControlPlane;
use crate::supervisor::{Channel, ChannelCommand, ChannelEvent};

type ConnectionResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// Which channel a socket carries, by request path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Game,
    Control,
}

impl Route {
    pub fn from_path(path: &str) -> Option<Route> {
        match path.trim_end_matches('/') {
            "" | "/game" => Some(Route::Game),
            "/control" => Some(Route::Control),
            _ => None,
        }
    }
}

pub struct ChannelServer {
    listener: TcpListener,
    events: mpsc::UnboundedSender<ChannelEvent>,
    control: ControlPlane,
}

impl ChannelServer {
    pub async fn bind(
        addr: SocketAddr,
        events: mpsc::UnboundedSender<ChannelEvent>,
        control: ControlPlane,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            events,
            control,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until the listener fails.
    pub async fn run(self) -> io::Result<()> {
        log::info!("Channel server listening on {}", self.local_addr()?);

        loop {
            let (stream, addr) = self.listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let events = self.events.clone();
            let control = self.control.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, events, control).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        events: mpsc::UnboundedSender<ChannelEvent>,
        control: ControlPlane,
    ) -> ConnectionResult {
        let mut route = None;
        let router = |request: &Request, response: Response| {
            route = Route::from_path(request.uri().path());
            if route.is_some() {
                return Ok(response);
            }
            let mut rejection = ErrorResponse::new(Some("unknown channel".to_string()));
            *rejection.status_mut() = StatusCode::NOT_FOUND;
            Err(rejection)
        };
        let ws_stream = tokio_tungstenite::accept_hdr_async(stream, router).await?;

        match route {
            Some(Route::Game) => Self::serve_game(ws_stream, addr, events).await,
            Some(Route::Control) => Self::serve_control(ws_stream, addr, control).await,
            None => Ok(()),
        }
    }

    async fn serve_game(
        ws_stream: WebSocketStream<TcpStream>,
        addr: SocketAddr,
        events: mpsc::UnboundedSender<ChannelEvent>,
    ) -> ConnectionResult {
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let (channel, mut commands) = Channel::open();
        let id = channel.id();
        log::info!("Game channel {id} opened from {addr}");
        events.send(ChannelEvent::Opened(channel))?;

        let result: ConnectionResult = loop {
            tokio::select! {
                msg = ws_receiver.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        let text = text.as_str().to_owned();
                        if events.send(ChannelEvent::Message { channel: id, text }).is_err() {
                            break Ok(());
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break Ok(()),
                    Some(Ok(Message::Binary(_))) => {
                        log::debug!("Ignoring binary frame on game channel {id}")
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break Err(e.into()),
                },
                command = commands.recv() => match command {
                    Some(ChannelCommand::Send(message)) => {
                        let frame = Message::Text(message.to_text().into());
                        if let Err(e) = ws_sender.send(frame).await {
                            break Err(e.into());
                        }
                    }
                    Some(ChannelCommand::Close) | None => {
                        log::debug!("Closing game channel {id}");
                        let _ = ws_sender.close().await;
                        break Ok(());
                    }
                },
            }
        };

        log::info!("Game channel {id} from {addr} closed");
        let _ = events.send(ChannelEvent::Closed(id));
        result
    }

    async fn serve_control(
        ws_stream: WebSocketStream<TcpStream>,
        addr: SocketAddr,
        control: ControlPlane,
    ) -> ConnectionResult {
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        log::info!("Control channel opened from {addr}");

        while let Some(msg) = ws_receiver.next().await {
            match msg? {
                Message::Text(text) => {
                    if let Some(reply) = control.handle(text.as_str()).await {
                        ws_sender.send(Message::Text(reply.into())).await?;
                    }
                }
                Message::Close(_) => break,
                _ => {}
            }
        }

        log::info!("Control channel from {addr} closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_routes() {
        assert_eq!(Route::from_path("/"), Some(Route::Game));
        assert_eq!(Route::from_path("/game"), Some(Route::Game));
        assert_eq!(Route::from_path("/game/"), Some(Route::Game));
        assert_eq!(Route::from_path("/control"), Some(Route::Control));
        assert_eq!(Route::from_path("/admin"), None);
    }
}
