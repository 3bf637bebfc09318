//! Connection Context Registry.
//!
//! Process-scoped table of open transport connections. A context is created
//! when a socket opens and removed when it closes; join and leave fill in
//! the session. Nothing is persisted, so a restart starts from an empty
//! registry and clients re-announce by rejoining.
//!
//! Only the socket handler writes to the registry. Rooms read it.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::Serialize;

use queue_core::{QueueError, QueueResult, UserId};

/// Identity and membership of one connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionContext {
    /// Transport-level id, stable for the connection's lifetime.
    pub connection_id: String,
    /// Joined session, if any.
    pub session_id: Option<String>,
    /// Authenticated user, if any.
    pub user_id: Option<UserId>,
    /// Whether the identity collaborator authenticated the connection.
    pub is_authenticated: bool,
}

/// Partial update applied by [`ConnectionRegistry::update`].
///
/// `None` leaves a field unchanged; `Some(None)` clears it.
#[derive(Debug, Clone, Default)]
pub struct ContextUpdate {
    /// New session membership.
    pub session_id: Option<Option<String>>,
    /// New user identity.
    pub user_id: Option<Option<UserId>>,
}

impl ContextUpdate {
    /// Update that sets the joined session.
    #[must_use]
    pub fn joined(session_id: impl Into<String>) -> Self {
        Self {
            session_id: Some(Some(session_id.into())),
            ..Self::default()
        }
    }

    /// Update that clears the joined session.
    #[must_use]
    pub fn left() -> Self {
        Self {
            session_id: Some(None),
            ..Self::default()
        }
    }
}

/// Shared map from connection id to context.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    contexts: Arc<RwLock<HashMap<String, ConnectionContext>>>,
}

impl ConnectionRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new connection.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::DuplicateConnection`] if the id is already
    /// registered; the caller must treat that as fatal for the connection.
    pub fn create(
        &self,
        connection_id: impl Into<String>,
        is_authenticated: bool,
        user_id: Option<UserId>,
    ) -> QueueResult<ConnectionContext> {
        let connection_id = connection_id.into();
        let mut contexts = self
            .contexts
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if contexts.contains_key(&connection_id) {
            return Err(QueueError::DuplicateConnection(connection_id));
        }
        let context = ConnectionContext {
            connection_id: connection_id.clone(),
            session_id: None,
            user_id,
            is_authenticated,
        };
        contexts.insert(connection_id, context.clone());
        Ok(context)
    }

    /// Look up a connection.
    #[must_use]
    pub fn get(&self, connection_id: &str) -> Option<ConnectionContext> {
        self.contexts
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(connection_id)
            .cloned()
    }

    /// Apply a partial update.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::NotFound`] if the connection was never created
    /// or was already removed. Missing contexts are never created here.
    pub fn update(&self, connection_id: &str, update: ContextUpdate) -> QueueResult<ConnectionContext> {
        let mut contexts = self
            .contexts
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let context = contexts
            .get_mut(connection_id)
            .ok_or_else(|| QueueError::NotFound(format!("connection {connection_id}")))?;
        if let Some(session_id) = update.session_id {
            context.session_id = session_id;
        }
        if let Some(user_id) = update.user_id {
            context.user_id = user_id;
        }
        Ok(context.clone())
    }

    /// Remove a connection, returning its last context.
    pub fn remove(&self, connection_id: &str) -> Option<ConnectionContext> {
        self.contexts
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(connection_id)
    }

    /// Number of open connections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.contexts
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    /// Whether no connection is open.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
