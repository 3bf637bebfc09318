//! Room Manager.
//!
//! One room per session owns the authoritative queue, the participant list
//! and leadership. Every mutation of a room runs under that room's async
//! mutex and publishes its events before releasing it, so subscribers see
//! events in commit order and leadership transfer is always sequenced after
//! a pending write. Sessions never share a lock.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::Mutex;

use queue_core::{
    ClimbRef, Commit, Origin, QueueAuthority, QueueDelta, QueueError, QueueItem, QueueResult,
    QueueState, RetryConfig, SessionEvent, SessionUser, UserId,
};

use crate::bus::EventBus;
use crate::climb_data::{BoardParams, ClimbDataSource};
use crate::metrics;
use crate::registry::ConnectionRegistry;
use crate::validation::{
    validate_angle, validate_board_path, validate_queue_len, validate_session_id,
    validate_username, ValidationError, MAX_ANGLE,
};

/// Angle used when the board path does not end in one.
pub const DEFAULT_ANGLE: u16 = 40;

/// Per-item timeout for climb-data lookups.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(5);

const DEFAULT_END_REASON: &str = "Session ended by leader";

/// Arguments of a join.
#[derive(Debug, Clone, Default)]
pub struct JoinRequest {
    /// Session to join. Replaced by a generated id on create.
    pub session_id: String,
    /// Board the session runs on.
    pub board_path: String,
    /// Display name; defaults to `User-<connection prefix>`.
    pub username: Option<String>,
    /// Avatar image URL.
    pub avatar_url: Option<String>,
    /// Queue to seed a brand new session with.
    pub initial_queue: Option<Vec<QueueItem>>,
    /// Current item to seed a brand new session with.
    pub initial_current_item: Option<QueueItem>,
    /// Display name of the session.
    pub session_name: Option<String>,
}

impl JoinRequest {
    /// Minimal join request.
    #[must_use]
    pub fn new(session_id: impl Into<String>, board_path: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            board_path: board_path.into(),
            ..Self::default()
        }
    }
}

/// Result of a successful join.
#[derive(Debug, Clone)]
pub struct JoinOutcome {
    /// Joined session.
    pub session_id: String,
    /// Client id of the joiner within the session.
    pub client_id: String,
    /// Whether the joiner leads the session.
    pub is_leader: bool,
    /// Participants in join order.
    pub users: Vec<SessionUser>,
    /// Display name of the session.
    pub session_name: Option<String>,
    /// Authoritative state at join time.
    pub state: QueueState,
}

/// Result of a leave that removed a participant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaveOutcome {
    /// Session that was left.
    pub session_id: String,
    /// Set only when leadership moved.
    pub new_leader_id: Option<String>,
}

#[derive(Debug, Clone)]
struct Participant {
    connection_id: String,
    user_id: Option<UserId>,
    username: String,
    avatar_url: Option<String>,
}

#[derive(Debug)]
struct Room {
    session_id: String,
    board_path: String,
    name: Option<String>,
    angle: u16,
    // Join order; the first entry is the earliest joiner.
    participants: Vec<Participant>,
    leader_id: Option<String>,
    authority: QueueAuthority,
    closed: bool,
}

impl Room {
    fn new(session_id: &str, board_path: &str, name: Option<String>) -> Self {
        Self {
            session_id: session_id.to_string(),
            board_path: board_path.to_string(),
            name,
            angle: angle_from_path(board_path),
            participants: Vec::new(),
            leader_id: None,
            authority: QueueAuthority::new(),
            closed: false,
        }
    }

    fn position(&self, connection_id: &str) -> Option<usize> {
        self.participants
            .iter()
            .position(|p| p.connection_id == connection_id)
    }

    fn is_leader(&self, connection_id: &str) -> bool {
        self.leader_id.as_deref() == Some(connection_id)
    }

    fn user(&self, participant: &Participant) -> SessionUser {
        SessionUser {
            id: participant.connection_id.clone(),
            user_id: participant.user_id.clone(),
            username: participant.username.clone(),
            avatar_url: participant.avatar_url.clone(),
            is_leader: self.is_leader(&participant.connection_id),
        }
    }

    fn users(&self) -> Vec<SessionUser> {
        self.participants.iter().map(|p| self.user(p)).collect()
    }
}

type Rooms = RwLock<HashMap<String, Arc<Mutex<Room>>>>;

/// Owner of every live session.
#[derive(Clone)]
pub struct RoomManager {
    rooms: Arc<Rooms>,
    registry: ConnectionRegistry,
    bus: EventBus,
    climb_data: Option<Arc<dyn ClimbDataSource>>,
    fetch_timeout: Duration,
    retry: RetryConfig,
}

impl RoomManager {
    /// Manager without a climb-data source.
    #[must_use]
    pub fn new(registry: ConnectionRegistry, bus: EventBus) -> Self {
        Self {
            rooms: Arc::new(RwLock::new(HashMap::new())),
            registry,
            bus,
            climb_data: None,
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
            retry: RetryConfig::default(),
        }
    }

    /// Refresh climb stats from `source` on angle changes.
    #[must_use]
    pub fn with_climb_data(mut self, source: Arc<dyn ClimbDataSource>, timeout: Duration) -> Self {
        self.climb_data = Some(source);
        self.fetch_timeout = timeout;
        self
    }

    /// Override the retry policy for version conflicts and climb lookups.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// The bus this manager publishes on.
    #[must_use]
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Join `request.session_id`, creating the room if needed.
    ///
    /// The first joiner leads and may seed the queue; later joiners receive
    /// the existing state and never overwrite it. Joining a session the
    /// connection is already in refreshes its profile.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::NotFound`] for an unregistered connection and
    /// [`QueueError::InvalidInput`] for a malformed request.
    pub async fn join_session(
        &self,
        connection_id: &str,
        request: JoinRequest,
    ) -> QueueResult<JoinOutcome> {
        validate_session_id(&request.session_id).map_err(invalid("session_id"))?;
        validate_board_path(&request.board_path).map_err(invalid("board_path"))?;
        if let Some(username) = request.username.as_deref() {
            validate_username(username).map_err(invalid("username"))?;
        }
        if let Some(queue) = request.initial_queue.as_ref() {
            validate_queue_len(queue.len()).map_err(invalid("queue_len"))?;
        }

        let context = self
            .registry
            .get(connection_id)
            .ok_or_else(|| QueueError::NotFound(format!("connection {connection_id}")))?;

        loop {
            let room = self.room_or_insert(&request);
            let mut room = room.lock().await;
            // Emptied and dropped while we waited; the next pass makes a new room.
            if room.closed {
                continue;
            }
            let outcome =
                self.join_locked(&mut room, connection_id, context.user_id.clone(), request)?;
            metrics::set_sessions_active(self.session_count());
            return Ok(outcome);
        }
    }

    fn join_locked(
        &self,
        room: &mut Room,
        connection_id: &str,
        user_id: Option<UserId>,
        request: JoinRequest,
    ) -> QueueResult<JoinOutcome> {
        let existing = room.position(connection_id);
        let leads = room.participants.is_empty() || room.is_leader(connection_id);

        if leads && room.authority.is_pristine() {
            let queue = request.initial_queue.unwrap_or_default();
            if !queue.is_empty() || request.initial_current_item.is_some() {
                room.authority
                    .update(queue, request.initial_current_item, None)?;
                tracing::info!(
                    session_id = %room.session_id,
                    items = room.authority.state().queue.len(),
                    "Seeded session from joiner's local queue"
                );
                self.bus
                    .publish_queue(&room.session_id, room.authority.snapshot());
            }
        }

        let username = request
            .username
            .unwrap_or_else(|| default_username(connection_id));
        let participant = Participant {
            connection_id: connection_id.to_string(),
            user_id,
            username,
            avatar_url: request.avatar_url,
        };
        match existing {
            Some(idx) => room.participants[idx] = participant.clone(),
            None => {
                if room.participants.is_empty() {
                    room.leader_id = Some(connection_id.to_string());
                }
                room.participants.push(participant.clone());
            }
        }
        if room.name.is_none() {
            room.name = request.session_name;
        }

        let user = room.user(&participant);
        self.bus
            .publish_session(&room.session_id, SessionEvent::UserJoined { user });

        tracing::info!(
            session_id = %room.session_id,
            connection_id = %connection_id,
            is_leader = room.is_leader(connection_id),
            participants = room.participants.len(),
            "Participant joined"
        );

        Ok(JoinOutcome {
            session_id: room.session_id.clone(),
            client_id: connection_id.to_string(),
            is_leader: room.is_leader(connection_id),
            users: room.users(),
            session_name: room.name.clone(),
            state: room.authority.state().clone(),
        })
    }

    /// Create a session with a fresh id and join it as leader.
    ///
    /// `request.session_id` is ignored.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Unauthenticated`] for an anonymous connection,
    /// otherwise see [`RoomManager::join_session`].
    pub async fn create_session(
        &self,
        connection_id: &str,
        mut request: JoinRequest,
    ) -> QueueResult<JoinOutcome> {
        let context = self
            .registry
            .get(connection_id)
            .ok_or_else(|| QueueError::NotFound(format!("connection {connection_id}")))?;
        if !context.is_authenticated {
            return Err(QueueError::Unauthenticated);
        }
        request.session_id = uuid::Uuid::new_v4().to_string();
        tracing::info!(
            session_id = %request.session_id,
            connection_id = %connection_id,
            "Creating session"
        );
        self.join_session(connection_id, request).await
    }

    /// Leave the session the connection is registered in.
    ///
    /// Returns `None` when there was nothing to leave; a repeated leave is
    /// a no-op.
    pub async fn leave_session(&self, connection_id: &str) -> Option<LeaveOutcome> {
        let session_id = self.registry.get(connection_id)?.session_id?;
        self.leave_room(&session_id, connection_id).await
    }

    /// Drop a disconnected client from its session.
    pub async fn remove_client(&self, connection_id: &str) -> Option<LeaveOutcome> {
        let outcome = self.leave_session(connection_id).await;
        if let Some(outcome) = outcome.as_ref() {
            tracing::debug!(
                session_id = %outcome.session_id,
                connection_id = %connection_id,
                "Removed disconnected client"
            );
        }
        outcome
    }

    async fn leave_room(&self, session_id: &str, connection_id: &str) -> Option<LeaveOutcome> {
        let room = self.room(session_id)?;
        let mut room = room.lock().await;
        let idx = room.position(connection_id)?;
        room.participants.remove(idx);
        self.bus.publish_session(
            session_id,
            SessionEvent::UserLeft {
                user_id: connection_id.to_string(),
            },
        );

        let mut new_leader_id = None;
        if room.is_leader(connection_id) {
            room.leader_id = room.participants.first().map(|p| p.connection_id.clone());
            if let Some(leader_id) = room.leader_id.clone() {
                tracing::info!(
                    session_id = %session_id,
                    leader_id = %leader_id,
                    "Leadership transferred"
                );
                self.bus.publish_session(
                    session_id,
                    SessionEvent::LeaderChanged {
                        leader_id: leader_id.clone(),
                    },
                );
                new_leader_id = Some(leader_id);
            }
        }

        tracing::info!(
            session_id = %session_id,
            connection_id = %connection_id,
            remaining = room.participants.len(),
            "Participant left"
        );

        if room.participants.is_empty() {
            self.close_locked(&mut room);
        }

        Some(LeaveOutcome {
            session_id: session_id.to_string(),
            new_leader_id,
        })
    }

    /// Replace the queue and current item.
    ///
    /// `expected_version` is the sequence the caller last observed; `None`
    /// skips the check. The new state is published as a full sync.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::VersionConflict`] on a stale version,
    /// [`QueueError::NotFound`] for an unknown session and
    /// [`QueueError::InvalidInput`] for an oversized or duplicated queue.
    pub async fn update_queue_state(
        &self,
        session_id: &str,
        queue: Vec<QueueItem>,
        current_item: Option<QueueItem>,
        expected_version: Option<u64>,
    ) -> QueueResult<QueueState> {
        validate_queue_len(queue.len()).map_err(invalid("queue_len"))?;
        let room = self.room(session_id).ok_or_else(|| session_not_found(session_id))?;
        let mut room = room.lock().await;
        if room.closed {
            return Err(session_not_found(session_id));
        }

        let state = match room.authority.update(queue, current_item, expected_version) {
            Ok(state) => state.clone(),
            Err(err) => {
                if matches!(err, QueueError::VersionConflict { .. }) {
                    metrics::record_version_conflict();
                }
                return Err(err);
            }
        };
        metrics::record_delta_applied("set_queue");
        self.bus.publish_queue(session_id, room.authority.snapshot());
        Ok(state)
    }

    /// Commit `delta` against exactly `expected`.
    ///
    /// # Errors
    ///
    /// See [`QueueAuthority::commit_delta`]; unknown sessions are
    /// [`QueueError::NotFound`].
    pub async fn commit_delta(
        &self,
        session_id: &str,
        delta: &QueueDelta,
        expected: u64,
        origin: &Origin,
    ) -> QueueResult<Commit> {
        let room = self.room(session_id).ok_or_else(|| session_not_found(session_id))?;
        let mut room = room.lock().await;
        if room.closed {
            return Err(session_not_found(session_id));
        }

        let commit = room.authority.commit_delta(delta, expected, origin)?;
        if let Some(event) = commit.event.clone() {
            metrics::record_delta_applied(delta.kind());
            self.bus.publish_queue(session_id, event);
        }
        Ok(commit)
    }

    /// Apply `delta`, refetching the version and retrying on conflicts.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::RetriesExhausted`] once the retry budget is
    /// spent, or the first non-conflict error.
    pub async fn apply_delta(
        &self,
        session_id: &str,
        delta: &QueueDelta,
        origin: &Origin,
    ) -> QueueResult<Commit> {
        for attempt in 0..self.retry.max_retries {
            let expected = self.sequence(session_id).await?;
            match self.commit_delta(session_id, delta, expected, origin).await {
                Err(QueueError::VersionConflict { expected, actual }) => {
                    metrics::record_version_conflict();
                    tracing::debug!(
                        session_id = %session_id,
                        attempt,
                        expected,
                        actual,
                        "Version conflict, retrying"
                    );
                    tokio::time::sleep(self.retry.delay_for_attempt(attempt)).await;
                }
                result => return result,
            }
        }

        metrics::record_retries_exhausted();
        tracing::warn!(
            session_id = %session_id,
            kind = delta.kind(),
            attempts = self.retry.max_retries,
            "Giving up on delta after repeated version conflicts"
        );
        Err(QueueError::RetriesExhausted {
            attempts: self.retry.max_retries,
        })
    }

    async fn sequence(&self, session_id: &str) -> QueueResult<u64> {
        let room = self.room(session_id).ok_or_else(|| session_not_found(session_id))?;
        let room = room.lock().await;
        Ok(room.authority.sequence())
    }

    /// Change a participant's display name and re-announce them.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::NotFound`] when the connection is not in a
    /// session and [`QueueError::InvalidInput`] for a bad username.
    pub async fn update_username(
        &self,
        connection_id: &str,
        username: &str,
        avatar_url: Option<String>,
    ) -> QueueResult<SessionUser> {
        validate_username(username).map_err(invalid("username"))?;
        let session_id = self
            .registry
            .get(connection_id)
            .and_then(|ctx| ctx.session_id)
            .ok_or_else(|| QueueError::NotFound(format!("connection {connection_id} has no session")))?;
        let room = self
            .room(&session_id)
            .ok_or_else(|| session_not_found(&session_id))?;
        let mut room = room.lock().await;
        let idx = room
            .position(connection_id)
            .ok_or_else(|| QueueError::NotFound(format!("participant {connection_id}")))?;

        let participant = &mut room.participants[idx];
        participant.username = username.to_string();
        participant.avatar_url = avatar_url;
        let participant = participant.clone();

        let user = room.user(&participant);
        self.bus.publish_session(
            &session_id,
            SessionEvent::UserJoined { user: user.clone() },
        );
        Ok(user)
    }

    /// Change the session angle and refresh every queued climb's stats.
    ///
    /// Lookups run in parallel, each under the configured timeout. A failed
    /// lookup keeps the item as it was. Refreshed items are committed as one
    /// state update.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::InvalidInput`] above 90 degrees and
    /// [`QueueError::NotFound`] for an unknown session.
    pub async fn update_session_angle(&self, session_id: &str, angle: u16) -> QueueResult<QueueState> {
        validate_angle(angle).map_err(invalid("angle"))?;
        let room_lock = self.room(session_id).ok_or_else(|| session_not_found(session_id))?;

        let (board, climbs) = {
            let mut room = room_lock.lock().await;
            if room.closed {
                return Err(session_not_found(session_id));
            }
            room.angle = angle;
            self.bus.publish_session(
                session_id,
                SessionEvent::AngleChanged {
                    angle,
                    board_path: room.board_path.clone(),
                },
            );
            let state = room.authority.state();
            let mut climbs: Vec<ClimbRef> = Vec::new();
            for item in state.queue.iter().chain(state.current_item.iter()) {
                if !climbs.iter().any(|c| c.uuid == item.climb.uuid) {
                    climbs.push(item.climb.clone());
                }
            }
            (BoardParams::new(room.board_path.clone()), climbs)
        };

        let refreshed = self.fetch_climbs(&board, angle, climbs).await;

        let mut room = room_lock.lock().await;
        if room.closed {
            return Err(session_not_found(session_id));
        }
        // A newer angle change owns the refresh.
        if room.angle != angle || refreshed.is_empty() {
            return Ok(room.authority.state().clone());
        }

        let current = room.authority.state().clone();
        let queue: Vec<QueueItem> = current
            .queue
            .iter()
            .map(|item| refresh_item(item, &refreshed))
            .collect();
        let current_item = current
            .current_item
            .as_ref()
            .map(|item| refresh_item(item, &refreshed));

        let candidate = QueueState::from_parts(queue.clone(), current_item.clone(), current.sequence);
        if candidate.same_content(&current) {
            return Ok(current);
        }

        let in_queue = current
            .current_uuid()
            .is_some_and(|uuid| current.contains(uuid));
        let state = if in_queue || current_item != current.current_item {
            room.authority.update(queue, current_item, None)?.clone()
        } else {
            room.authority.update_queue_only(queue, None)?.clone()
        };
        metrics::record_delta_applied("angle_refresh");
        self.bus.publish_queue(session_id, room.authority.snapshot());

        tracing::info!(
            session_id = %session_id,
            angle,
            refreshed = refreshed.len(),
            sequence = state.sequence,
            "Refreshed queue for new angle"
        );
        Ok(state)
    }

    async fn fetch_climbs(
        &self,
        board: &BoardParams,
        angle: u16,
        climbs: Vec<ClimbRef>,
    ) -> HashMap<String, ClimbRef> {
        let Some(source) = self.climb_data.clone() else {
            return HashMap::new();
        };
        let timeout = self.fetch_timeout;
        let retry = &self.retry;

        // Each item retries transient failures inside its own timeout.
        let fetches = climbs.into_iter().map(|climb| {
            let source = Arc::clone(&source);
            async move {
                let lookup = async {
                    let mut attempt = 0;
                    loop {
                        match source.climb_stats_at(&climb.uuid, board, angle).await {
                            Err(err) if err.is_retryable() && attempt + 1 < retry.max_retries => {
                                tracing::debug!(
                                    climb_uuid = %climb.uuid,
                                    attempt,
                                    "Climb lookup failed, retrying: {}",
                                    err
                                );
                                metrics::record_climb_fetch("retry");
                                tokio::time::sleep(retry.delay_for_attempt(attempt)).await;
                                attempt += 1;
                            }
                            result => return result,
                        }
                    }
                };
                let result = tokio::time::timeout(timeout, lookup).await;
                (climb.uuid, result)
            }
        });

        let mut refreshed = HashMap::new();
        for (uuid, result) in join_all(fetches).await {
            let reason = match result {
                Ok(Ok(climb)) => {
                    metrics::record_climb_fetch("success");
                    refreshed.insert(uuid, climb);
                    continue;
                }
                Ok(Err(err)) => {
                    metrics::record_climb_fetch("failure");
                    err.to_string()
                }
                Err(_) => {
                    metrics::record_climb_fetch("timeout");
                    format!("timed out after {}ms", timeout.as_millis())
                }
            };
            let err = QueueError::UpstreamFetchFailure { uuid, reason };
            tracing::warn!(angle, "{}; keeping existing item", err);
        }
        refreshed
    }

    /// Leader-only: end the session for everyone.
    ///
    /// Publishes `SessionEnded` and drops the room. Its topic goes once the
    /// last subscriber detaches.
    /// Returns the ended session id.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::NotFound`] when the connection is not in a
    /// session and [`QueueError::Rejected`] when it is not the leader.
    pub async fn end_session(
        &self,
        connection_id: &str,
        reason: Option<String>,
        new_path: Option<String>,
    ) -> QueueResult<String> {
        let session_id = self
            .registry
            .get(connection_id)
            .and_then(|ctx| ctx.session_id)
            .ok_or_else(|| QueueError::NotFound(format!("connection {connection_id} has no session")))?;
        let room = self
            .room(&session_id)
            .ok_or_else(|| session_not_found(&session_id))?;
        let mut room = room.lock().await;
        if !room.is_leader(connection_id) {
            return Err(QueueError::Rejected(
                "only the session leader can end the session".to_string(),
            ));
        }

        self.bus.publish_session(
            &session_id,
            SessionEvent::SessionEnded {
                reason: reason.unwrap_or_else(|| DEFAULT_END_REASON.to_string()),
                new_path,
            },
        );
        tracing::info!(
            session_id = %session_id,
            members = room.participants.len(),
            "Session ended by leader"
        );
        room.participants.clear();
        self.close_locked(&mut room);
        Ok(session_id)
    }

    /// Snapshot of a session's queue, `None` for an unknown session.
    pub async fn get_queue_state(&self, session_id: &str) -> Option<QueueState> {
        let room = self.room(session_id)?;
        let room = room.lock().await;
        Some(room.authority.state().clone())
    }

    /// Participant record for a connection.
    pub async fn get_client(&self, connection_id: &str) -> Option<SessionUser> {
        let session_id = self.registry.get(connection_id)?.session_id?;
        let room = self.room(&session_id)?;
        let room = room.lock().await;
        let idx = room.position(connection_id)?;
        Some(room.user(&room.participants[idx]))
    }

    /// Participants of a session in join order.
    pub async fn session_users(&self, session_id: &str) -> Vec<SessionUser> {
        match self.room(session_id) {
            Some(room) => room.lock().await.users(),
            None => Vec::new(),
        }
    }

    /// Number of live sessions.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.rooms
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    fn room(&self, session_id: &str) -> Option<Arc<Mutex<Room>>> {
        self.rooms
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(session_id)
            .cloned()
    }

    fn room_or_insert(&self, request: &JoinRequest) -> Arc<Mutex<Room>> {
        let mut rooms = self
            .rooms
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        Arc::clone(rooms.entry(request.session_id.clone()).or_insert_with(|| {
            tracing::info!(session_id = %request.session_id, "Creating room");
            Arc::new(Mutex::new(Room::new(
                &request.session_id,
                &request.board_path,
                request.session_name.clone(),
            )))
        }))
    }

    // Caller holds the room lock.
    fn close_locked(&self, room: &mut Room) {
        room.closed = true;
        self.rooms
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(&room.session_id);
        self.bus.close_session(&room.session_id);
        metrics::set_sessions_active(self.session_count());
        tracing::info!(session_id = %room.session_id, "Room closed");
    }
}

fn invalid(kind: &'static str) -> impl FnOnce(ValidationError) -> QueueError {
    move |err| {
        metrics::record_validation_failure(kind);
        err.into()
    }
}

fn session_not_found(session_id: &str) -> QueueError {
    QueueError::NotFound(format!("session {session_id}"))
}

fn default_username(connection_id: &str) -> String {
    let prefix: String = connection_id.chars().take(6).collect();
    format!("User-{prefix}")
}

fn angle_from_path(board_path: &str) -> u16 {
    board_path
        .rsplit('/')
        .find(|s| !s.is_empty())
        .and_then(|s| s.parse::<u16>().ok())
        .filter(|angle| *angle <= MAX_ANGLE)
        .unwrap_or(DEFAULT_ANGLE)
}

fn refresh_item(item: &QueueItem, refreshed: &HashMap<String, ClimbRef>) -> QueueItem {
    match refreshed.get(&item.climb.uuid) {
        Some(fresh) => QueueItem {
            climb: ClimbRef {
                mirrored: item.climb.mirrored,
                ..fresh.clone()
            },
            ..item.clone()
        },
        None => item.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::BusEvent;
    use crate::climb_data::{ClimbDataError, HttpClimbData};
    use crate::registry::ContextUpdate;
    use async_trait::async_trait;
    use queue_core::QueueEvent;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const BOARD: &str = "/kilter/1/12/1,2,3/40";

    fn item(uuid: &str, climb: &str) -> QueueItem {
        QueueItem::with_uuid(uuid, ClimbRef::new(climb, "Problem", 40))
    }

    fn manager() -> RoomManager {
        RoomManager::new(ConnectionRegistry::new(), EventBus::new())
    }

    async fn join(manager: &RoomManager, conn: &str, session: &str) -> JoinOutcome {
        join_with(manager, conn, JoinRequest::new(session, BOARD)).await
    }

    async fn join_with(manager: &RoomManager, conn: &str, request: JoinRequest) -> JoinOutcome {
        if manager.registry.get(conn).is_none() {
            manager.registry.create(conn, true, None).expect("register");
        }
        let outcome = manager
            .join_session(conn, request)
            .await
            .expect("join should succeed");
        manager
            .registry
            .update(conn, ContextUpdate::joined(outcome.session_id.clone()))
            .expect("registry update");
        outcome
    }

    struct StaticClimbs;

    #[async_trait]
    impl ClimbDataSource for StaticClimbs {
        async fn climb_stats_at(
            &self,
            climb_uuid: &str,
            _board: &BoardParams,
            angle: u16,
        ) -> Result<ClimbRef, ClimbDataError> {
            if climb_uuid == "broken" {
                return Err(ClimbDataError::Status(503));
            }
            let mut climb = ClimbRef::new(climb_uuid, "Problem", angle);
            climb.difficulty = Some(format!("V{}", angle / 10));
            Ok(climb)
        }
    }

    struct SlowClimbs;

    #[async_trait]
    impl ClimbDataSource for SlowClimbs {
        async fn climb_stats_at(
            &self,
            climb_uuid: &str,
            _board: &BoardParams,
            angle: u16,
        ) -> Result<ClimbRef, ClimbDataError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(ClimbRef::new(climb_uuid, "Problem", angle))
        }
    }

    #[tokio::test]
    async fn test_first_joiner_leads_and_seeds() {
        let manager = manager();
        let mut request = JoinRequest::new("s1", BOARD);
        request.initial_queue = Some(vec![item("a", "c1"), item("b", "c2")]);
        request.initial_current_item = Some(item("a", "c1"));
        request.session_name = Some("Tuesday".into());

        let first = join_with(&manager, "p1", request).await;
        assert!(first.is_leader);
        assert_eq!(first.state.queue.len(), 2);
        assert_eq!(first.state.sequence, 1);
        assert_eq!(first.session_name.as_deref(), Some("Tuesday"));

        let mut request = JoinRequest::new("s1", BOARD);
        request.initial_queue = Some(vec![item("z", "c9")]);
        let second = join_with(&manager, "p2", request).await;
        assert!(!second.is_leader);
        assert_eq!(second.state, first.state);
        assert_eq!(second.users.len(), 2);
        assert!(second.users[0].is_leader);
    }

    #[tokio::test]
    async fn test_default_username() {
        let manager = manager();
        let outcome = join(&manager, "abcdef123456", "s1").await;
        assert_eq!(outcome.users[0].username, "User-abcdef");
    }

    #[tokio::test]
    async fn test_join_unregistered_connection() {
        let manager = manager();
        let result = manager
            .join_session("ghost", JoinRequest::new("s1", BOARD))
            .await;
        assert!(matches!(result, Err(QueueError::NotFound(_))));
        assert_eq!(manager.session_count(), 0);
    }

    #[tokio::test]
    async fn test_join_rejects_bad_session_id() {
        let manager = manager();
        manager.registry.create("p1", false, None).expect("register");
        let result = manager
            .join_session("p1", JoinRequest::new("no spaces allowed", BOARD))
            .await;
        assert!(matches!(result, Err(QueueError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_leadership_transfers_to_earliest_joiner() {
        let manager = manager();
        join(&manager, "p1", "s1").await;
        join(&manager, "p2", "s1").await;
        join(&manager, "p3", "s1").await;
        let mut sub = manager.bus().subscribe("s1");

        let outcome = manager.leave_session("p1").await.expect("left");
        assert_eq!(outcome.new_leader_id.as_deref(), Some("p2"));

        assert_eq!(
            sub.recv().await.expect("event"),
            BusEvent::Session(SessionEvent::UserLeft {
                user_id: "p1".into()
            })
        );
        assert_eq!(
            sub.recv().await.expect("event"),
            BusEvent::Session(SessionEvent::LeaderChanged {
                leader_id: "p2".into()
            })
        );

        let users = manager.session_users("s1").await;
        assert_eq!(users.len(), 2);
        assert!(users[0].is_leader);
        assert_eq!(users[0].id, "p2");
    }

    #[tokio::test]
    async fn test_non_leader_leave_keeps_leader() {
        let manager = manager();
        join(&manager, "p1", "s1").await;
        join(&manager, "p2", "s1").await;
        let outcome = manager.leave_session("p2").await.expect("left");
        assert_eq!(outcome.new_leader_id, None);
    }

    #[tokio::test]
    async fn test_leave_twice_is_noop() {
        let manager = manager();
        join(&manager, "p1", "s1").await;
        join(&manager, "p2", "s1").await;
        assert!(manager.leave_session("p2").await.is_some());
        assert!(manager.leave_session("p2").await.is_none());
        assert!(manager.leave_session("never-joined").await.is_none());
    }

    #[tokio::test]
    async fn test_last_leave_closes_room() {
        let manager = manager();
        join(&manager, "p1", "s1").await;
        assert_eq!(manager.session_count(), 1);
        manager.remove_client("p1").await;
        assert_eq!(manager.session_count(), 0);
        assert!(manager.get_queue_state("s1").await.is_none());
    }

    #[tokio::test]
    async fn test_subscriber_ahead_of_join_outlives_room_close() {
        let manager = manager();
        join(&manager, "p1", "s1").await;
        // A socket subscribes, then the last participant leaves before it joins.
        let mut sub = manager.bus().subscribe("s1");
        manager.remove_client("p1").await;
        assert_eq!(manager.session_count(), 0);

        join(&manager, "p2", "s1").await;
        join(&manager, "p3", "s1").await;
        let mut joined = Vec::new();
        while joined.len() < 2 {
            let event = tokio::time::timeout(Duration::from_secs(1), sub.recv())
                .await
                .expect("event before timeout")
                .expect("topic still open");
            if let BusEvent::Session(SessionEvent::UserJoined { user }) = event {
                joined.push(user.id);
            }
        }
        assert_eq!(joined, vec!["p2", "p3"]);
    }

    #[tokio::test]
    async fn test_concurrent_updates_conflict_then_retry() {
        let manager = manager();
        join(&manager, "p1", "s1").await;

        let first = manager
            .update_queue_state("s1", vec![item("a", "c1")], None, Some(0))
            .await
            .expect("first write wins");
        assert_eq!(first.sequence, 1);

        let err = manager
            .update_queue_state("s1", vec![item("b", "c2")], None, Some(0))
            .await
            .expect_err("second write conflicts");
        assert!(matches!(
            err,
            QueueError::VersionConflict {
                expected: 0,
                actual: 1
            }
        ));

        let fresh = manager.get_queue_state("s1").await.expect("state");
        let mut queue = fresh.queue.clone();
        queue.push(item("b", "c2"));
        let merged = manager
            .update_queue_state("s1", queue, None, Some(fresh.sequence))
            .await
            .expect("retry succeeds");
        assert_eq!(merged.sequence, 2);
        assert!(merged.contains("a"));
        assert!(merged.contains("b"));
    }

    #[tokio::test]
    async fn test_concurrent_deltas_both_land() {
        let manager = manager();
        join(&manager, "p1", "s1").await;

        let add = |uuid: &str| QueueDelta::AddItem {
            item: item(uuid, "c1"),
            position: None,
        };
        let (add_a, add_b) = (add("a"), add("b"));
        let origin = Origin::client("p1", None);
        let (a, b) = tokio::join!(
            manager.apply_delta("s1", &add_a, &origin),
            manager.apply_delta("s1", &add_b, &origin),
        );
        assert!(a.expect("a").applied());
        assert!(b.expect("b").applied());

        let state = manager.get_queue_state("s1").await.expect("state");
        assert_eq!(state.sequence, 2);
        assert!(state.contains("a") && state.contains("b"));
    }

    #[tokio::test]
    async fn test_delta_event_carries_origin() {
        let manager = manager();
        join(&manager, "p1", "s1").await;
        let mut sub = manager.bus().subscribe("s1");

        let delta = QueueDelta::AddItem {
            item: item("a", "c1"),
            position: None,
        };
        manager
            .apply_delta("s1", &delta, &Origin::client("p1", Some("m1".into())))
            .await
            .expect("apply");

        match sub.recv().await.expect("event") {
            BusEvent::Queue(QueueEvent::Delta {
                sequence,
                correlation_id,
                client_id,
                ..
            }) => {
                assert_eq!(sequence, 1);
                assert_eq!(correlation_id.as_deref(), Some("m1"));
                assert_eq!(client_id.as_deref(), Some("p1"));
            }
            other => panic!("Expected queue delta, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_mirror_without_current_is_noop() {
        let manager = manager();
        join(&manager, "p1", "s1").await;
        let commit = manager
            .apply_delta(
                "s1",
                &QueueDelta::Mirror { mirrored: true },
                &Origin::default(),
            )
            .await
            .expect("apply");
        assert!(!commit.applied());
        assert_eq!(commit.sequence, 0);
    }

    #[tokio::test]
    async fn test_apply_delta_unknown_session() {
        let manager = manager();
        let result = manager
            .apply_delta(
                "nope",
                &QueueDelta::RemoveItem { uuid: "a".into() },
                &Origin::default(),
            )
            .await;
        assert!(matches!(result, Err(QueueError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_create_session_requires_authentication() {
        let manager = manager();
        manager.registry.create("anon", false, None).expect("register");
        let result = manager
            .create_session("anon", JoinRequest::new("", BOARD))
            .await;
        assert!(matches!(result, Err(QueueError::Unauthenticated)));

        manager
            .registry
            .create("member", true, Some("u1".into()))
            .expect("register");
        let outcome = manager
            .create_session("member", JoinRequest::new("", BOARD))
            .await
            .expect("create");
        assert!(outcome.is_leader);
        assert_eq!(outcome.users[0].user_id.as_deref(), Some("u1"));
        assert!(uuid::Uuid::parse_str(&outcome.session_id).is_ok());
    }

    #[tokio::test]
    async fn test_update_username_reannounces() {
        let manager = manager();
        join(&manager, "p1", "s1").await;
        let mut sub = manager.bus().subscribe("s1");

        let user = manager
            .update_username("p1", "Ada", Some("https://img/ada.png".into()))
            .await
            .expect("rename");
        assert_eq!(user.username, "Ada");
        assert_eq!(
            sub.recv().await.expect("event"),
            BusEvent::Session(SessionEvent::UserJoined { user: user.clone() })
        );
        assert_eq!(manager.get_client("p1").await, Some(user));
    }

    #[tokio::test]
    async fn test_update_username_outside_session() {
        let manager = manager();
        manager.registry.create("p1", false, None).expect("register");
        let result = manager.update_username("p1", "Ada", None).await;
        assert!(matches!(result, Err(QueueError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_angle_refresh_keeps_failed_items() {
        let manager = RoomManager::new(ConnectionRegistry::new(), EventBus::new())
            .with_climb_data(Arc::new(StaticClimbs), Duration::from_secs(1));
        let mut request = JoinRequest::new("s1", BOARD);
        let mut mirrored = item("a", "c1");
        mirrored.climb.mirrored = true;
        request.initial_queue = Some(vec![mirrored.clone(), item("b", "broken")]);
        request.initial_current_item = Some(mirrored);
        join_with(&manager, "p1", request).await;
        let mut sub = manager.bus().subscribe("s1");

        let state = manager
            .update_session_angle("s1", 50)
            .await
            .expect("angle change");
        assert_eq!(state.sequence, 2);
        assert_eq!(state.queue[0].climb.angle, 50);
        assert_eq!(state.queue[0].climb.difficulty.as_deref(), Some("V5"));
        assert!(state.queue[0].climb.mirrored);
        assert_eq!(state.queue[1].climb.angle, 40);
        assert_eq!(
            state.current_item.as_ref().map(|i| i.climb.angle),
            Some(50)
        );

        assert!(matches!(
            sub.recv().await,
            Ok(BusEvent::Session(SessionEvent::AngleChanged { angle: 50, .. }))
        ));
        assert!(matches!(
            sub.recv().await,
            Ok(BusEvent::Queue(QueueEvent::FullSync { sequence: 2, .. }))
        ));
    }

    #[tokio::test]
    async fn test_angle_refresh_times_out_slow_lookups() {
        let manager = RoomManager::new(ConnectionRegistry::new(), EventBus::new())
            .with_climb_data(Arc::new(SlowClimbs), Duration::from_millis(20));
        let mut request = JoinRequest::new("s1", BOARD);
        request.initial_queue = Some(vec![item("a", "c1")]);
        join_with(&manager, "p1", request).await;

        let state = tokio::time::timeout(
            Duration::from_secs(2),
            manager.update_session_angle("s1", 30),
        )
        .await
        .expect("refresh bounded by per-item timeout")
        .expect("angle change");
        assert_eq!(state.sequence, 1);
        assert_eq!(state.queue[0].climb.angle, 40);
    }

    #[tokio::test]
    #[cfg_attr(
        target_os = "macos",
        ignore = "wiremock/reqwest system-configuration issue on macOS"
    )]
    async fn test_angle_refresh_retries_transient_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/climbs/c1"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/climbs/c1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "uuid": "c1",
                "name": "Crimp Line",
                "angle": 50,
                "difficulty": "7a"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let source = HttpClimbData::new(server.uri(), Duration::from_secs(2)).expect("client");
        let manager = RoomManager::new(ConnectionRegistry::new(), EventBus::new())
            .with_climb_data(Arc::new(source), Duration::from_secs(2));
        let mut request = JoinRequest::new("s1", BOARD);
        request.initial_queue = Some(vec![item("a", "c1")]);
        join_with(&manager, "p1", request).await;

        let state = manager
            .update_session_angle("s1", 50)
            .await
            .expect("angle change");
        assert_eq!(state.sequence, 2);
        assert_eq!(state.queue[0].climb.angle, 50);
        assert_eq!(state.queue[0].climb.difficulty.as_deref(), Some("7a"));
    }

    #[tokio::test]
    async fn test_angle_refresh_does_not_retry_missing_climb() {
        struct CountingMissing(std::sync::atomic::AtomicUsize);

        #[async_trait]
        impl ClimbDataSource for CountingMissing {
            async fn climb_stats_at(
                &self,
                climb_uuid: &str,
                _board: &BoardParams,
                _angle: u16,
            ) -> Result<ClimbRef, ClimbDataError> {
                self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                Err(ClimbDataError::NotFound(climb_uuid.to_string()))
            }
        }

        let source = Arc::new(CountingMissing(std::sync::atomic::AtomicUsize::new(0)));
        let manager = RoomManager::new(ConnectionRegistry::new(), EventBus::new())
            .with_climb_data(source.clone(), Duration::from_secs(1));
        let mut request = JoinRequest::new("s1", BOARD);
        request.initial_queue = Some(vec![item("a", "c1")]);
        join_with(&manager, "p1", request).await;

        let state = manager
            .update_session_angle("s1", 50)
            .await
            .expect("angle change");
        assert_eq!(state.sequence, 1);
        assert_eq!(source.0.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_angle_validation() {
        let manager = manager();
        join(&manager, "p1", "s1").await;
        let result = manager.update_session_angle("s1", 91).await;
        assert!(matches!(result, Err(QueueError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_end_session_leader_only() {
        let manager = manager();
        join(&manager, "p1", "s1").await;
        join(&manager, "p2", "s1").await;
        let mut sub = manager.bus().subscribe("s1");

        let result = manager.end_session("p2", None, None).await;
        assert!(matches!(result, Err(QueueError::Rejected(_))));

        let ended = manager
            .end_session("p1", Some("Done climbing".into()), Some("/kilter/2".into()))
            .await
            .expect("leader ends");
        assert_eq!(ended, "s1");
        assert_eq!(manager.session_count(), 0);
        assert!(matches!(
            sub.recv().await,
            Ok(BusEvent::Session(SessionEvent::SessionEnded { ref reason, .. })) if reason == "Done climbing"
        ));
    }

    #[test]
    fn test_angle_from_path() {
        assert_eq!(angle_from_path("/kilter/1/12/1,2,3/45"), 45);
        assert_eq!(angle_from_path("/kilter/1/12/1,2,3/45/"), 45);
        assert_eq!(angle_from_path("/kilter/1/12/1,2,3"), DEFAULT_ANGLE);
        assert_eq!(angle_from_path("/kilter/120"), DEFAULT_ANGLE);
    }
}
