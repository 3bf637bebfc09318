//! # Climb Queue Core
//!
//! Shared queue logic for climbing sessions: the queue model, deltas and
//! the reducer every replica runs, the authority that versions changes,
//! the transport abstraction and the client synchronization agent.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │                 queue-core                  │
//! ├─────────────────────────────────────────────┤
//! │  Model / Delta    │  Reducer               │
//! │  - QueueItem      │  - apply / apply_mut   │
//! │  - QueueState     │  - sequence + hash     │
//! ├─────────────────────────────────────────────┤
//! │  QueueAuthority   │  Transport             │
//! │  - versions       │  - session mode        │
//! │  - commits        │  - peer mesh           │
//! ├─────────────────────────────────────────────┤
//! │  SyncAgent        │  DaemonBridge          │
//! │  - command log    │  - mesh <-> room relay │
//! │  - view only mode │                        │
//! └─────────────────────────────────────────────┘
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod agent;
pub mod authority;
pub mod command_log;
pub mod daemon;
pub mod delta;
pub mod error;
pub mod event;
pub mod hash;
pub mod mesh;
pub mod model;
pub mod protocol;
pub mod reducer;
pub mod retry;
pub mod transport;

pub use agent::{AgentError, ConnectionState, SessionView, SyncAgent};
pub use authority::{Commit, Origin, QueueAuthority};
pub use command_log::{CommandLog, PendingCommand};
pub use daemon::{BridgePhase, BridgeStats, DaemonBridge};
pub use delta::QueueDelta;
pub use error::{QueueError, QueueResult};
pub use event::{QueueEvent, SessionEvent};
pub use mesh::{PeerMesh, PeerTransport};
pub use model::{ClimbRef, QueueItem, QueueState, SessionUser, UserId};
pub use protocol::{current_timestamp, ClientMessage, ServerMessage};
pub use retry::{RetryConfig, MAX_RETRIES};
pub use transport::{
    view_only_mode, Authority, DataHandler, HandlerSet, Subscription, Transport, TransportEvent,
    TransportMode,
};

/// Queue core version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
