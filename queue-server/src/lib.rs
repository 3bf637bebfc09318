//! # Climb Queue Server Library
//!
//! Session server for shared climbing queues: rooms own each session's
//! authoritative queue and fan out queue and session events to every
//! connected participant over WebSocket. Also ships the session-mode
//! client transport used by the sync agent.
//!
//! This library is used by both the binary and integration tests.

use std::sync::Arc;

use axum::{routing::get, Router};

pub mod bus;
pub mod climb_data;
pub mod client;
pub mod config;
pub mod health;
pub mod identity;
pub mod metrics;
pub mod rate_limit;
pub mod registry;
pub mod room;
pub mod routes;
pub mod validation;
pub mod ws;

pub use bus::{BusEvent, BusSubscription, EventBus};
pub use climb_data::{BoardParams, ClimbDataError, ClimbDataSource, HttpClimbData};
pub use client::{ConnectionHealth, SessionTransport, SessionTransportConfig};
pub use config::{Args, ServerConfig};
pub use identity::{HeaderIdentity, Identity, IdentityResolver};
pub use rate_limit::{RateLimitConfig, RateLimiter};
pub use registry::{ConnectionContext, ConnectionRegistry, ContextUpdate};
pub use room::{JoinOutcome, JoinRequest, LeaveOutcome, RoomManager};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Session rooms.
    pub rooms: RoomManager,
    /// Open connections.
    pub registry: ConnectionRegistry,
    /// Resolves who a new connection belongs to.
    pub identity: Arc<dyn IdentityResolver>,
    /// Inbound frame limits per socket.
    pub rate_limit: RateLimitConfig,
}

impl AppState {
    /// Build the state for `config`.
    ///
    /// # Errors
    ///
    /// Returns [`ClimbDataError`] if the climb-data client cannot be built.
    pub fn from_config(config: &ServerConfig) -> Result<Self, ClimbDataError> {
        let registry = ConnectionRegistry::new();
        let bus = EventBus::with_capacity(config.event_capacity);
        let mut rooms = RoomManager::new(registry.clone(), bus);
        if let Some(url) = config.climb_data_url.as_deref() {
            let source = HttpClimbData::new(url, config.climb_fetch_timeout)?;
            tracing::info!("Refreshing climb stats from {}", url);
            rooms = rooms.with_climb_data(Arc::new(source), config.climb_fetch_timeout);
        }
        Ok(Self {
            rooms,
            registry,
            identity: Arc::new(HeaderIdentity::default()),
            rate_limit: config.rate_limit,
        })
    }

    /// Replace the identity collaborator.
    #[must_use]
    pub fn with_identity(mut self, identity: Arc<dyn IdentityResolver>) -> Self {
        self.identity = identity;
        self
    }
}

impl Default for AppState {
    fn default() -> Self {
        let registry = ConnectionRegistry::new();
        Self {
            rooms: RoomManager::new(registry.clone(), EventBus::new()),
            registry,
            identity: Arc::new(HeaderIdentity::default()),
            rate_limit: RateLimitConfig::default(),
        }
    }
}

/// Routes shared by the binary and the test harness.
pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/health/live", get(health::liveness))
        .route("/health/ready", get(health::readiness))
        .route("/health", get(health::readiness))
        .route("/ws", get(ws::ws_handler))
        .route(
            "/api/sessions/{session_id}/queue",
            get(routes::get_session_queue),
        )
        .with_state(state)
}
