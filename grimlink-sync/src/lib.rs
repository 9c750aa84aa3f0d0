//! # grimlink-sync: Grimoire to Twitch extension relay
//!
//! Supervises the channel opened by the grimoire content script and ships
//! batched, compressed state changes to extension viewers through PubSub.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  ws /game   ┌──────────────────────┐   FieldUpdate   ┌────────────────────┐
//! │ content      │ ──────────► │ ConnectionSupervisor │ ──────────────► │ BatchSynchronizer  │
//! │ script       │ ◄────────── │ + StateStore         │     (mpsc)      │ diff + 2 gates     │
//! └──────────────┘             └──────────┬───────────┘                 └─────────┬──────────┘
//!                                         │ SupervisorCommand                     │ codec
//! ┌──────────────┐  ws /control ┌─────────┴────┐                        ┌─────────▼──────────┐
//! │ popup        │ ───────────► │ ControlPlane │ ─────── whisper ─────► │ BroadcastClient    │
//! └──────────────┘              └──────────────┘                        │ → Helix PubSub     │
//!                                                                       └────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`model`]: grimoire value types
//! - [`protocol`]: game/control channel messages and viewer payloads
//! - [`codec`]: JSON → LZ4 → base64 string codec
//! - [`diff`]: field updates and the pending diff
//! - [`state`]: the state store
//! - [`throttle`]: burst coalescer and rate limiter gates
//! - [`sync`]: the batch synchronizer loop
//! - [`broadcast`]: extension API seam, Helix client, delivery policy
//! - [`supervisor`]: connection state machine and message dispatch
//! - [`control`]: popup commands (state, calibration, offsets, identity)
//! - [`overlay`]: stored overlay calibration
//! - [`server`]: WebSocket channel server
//! - [`config`]: layered configuration
//! - [`relay`]: wiring it all together

pub mod broadcast;
pub mod codec;
pub mod config;
pub mod control;
pub mod diff;
pub mod model;
pub mod overlay;
pub mod protocol;
pub mod relay;
pub mod server;
pub mod state;
pub mod supervisor;
pub mod sync;
pub mod throttle;

// Re-exports for convenience
pub use broadcast::{
    ApiError, BroadcastClient, BroadcasterId, Delivery, ErrorReporter, ExtensionApi,
    ExtensionCredentials, HelixApi, LogReporter, PubSubTarget,
};
pub use codec::{decode, encode, CodecError};
pub use config::{ConfigError, RelayConfig};
pub use diff::{DiffAccumulator, Field, FieldUpdate, StateDiff};
pub use model::{GamePhase, Offsets};
pub use protocol::{InboundMessage, OutboundMessage, ProtocolError, ViewerMessage};
pub use relay::{Relay, RelayError, RunningRelay};
pub use state::{StateSnapshot, StateStore};
pub use supervisor::{ConnectionStatus, ConnectionSupervisor, SupervisorEvent};
pub use sync::{BatchSynchronizer, SyncConfig};
pub use throttle::{BurstCoalescer, Gate, RateLimiter, Trigger};
