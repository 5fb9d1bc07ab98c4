//! Session Registry
//!
//! Concurrent map of session id to the server's authoritative record of
//! that participant. Touched by the accept path (insert/remove), the
//! dispatcher (update) and the tick scheduler (snapshot).

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};
use tracing::debug;
use uuid::Uuid;

use crate::network::protocol::{MovementSample, NetworkMessage, PlayerState};

/// Default mirrored health and mana.
pub const DEFAULT_VITAL: f32 = 100.0;

/// Unique session identifier.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    /// Fresh random id.
    pub fn new_random() -> Self {
        Self(Uuid::new_v4())
    }

    /// Underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// First four bytes as hex, for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0.as_bytes()[..4])
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({})", self.short())
    }
}

impl FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Lifecycle of a registered session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// Registered, welcome not yet sent.
    Pending,
    /// Fully joined.
    Active,
}

/// Why an outbound message was not queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    /// Queue is full (slow reader).
    Full,
    /// Connection has gone away.
    Closed,
}

/// Handle for writing to one connection.
///
/// Wraps a bounded queue drained by that connection's writer task, so a
/// slow peer only fills its own queue.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    sender: mpsc::Sender<NetworkMessage>,
}

impl SessionHandle {
    /// Wrap an outbound queue.
    pub fn new(sender: mpsc::Sender<NetworkMessage>) -> Self {
        Self { sender }
    }

    /// Queue without waiting.
    pub fn try_send(&self, message: NetworkMessage) -> Result<(), SendError> {
        self.sender.try_send(message).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SendError::Full,
            mpsc::error::TrySendError::Closed(_) => SendError::Closed,
        })
    }

    /// True once the writer has gone away.
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

/// Server-side record of one connected participant.
#[derive(Debug, Clone)]
pub struct ClientSession {
    /// Session identifier.
    pub id: SessionId,
    /// Outbound handle.
    pub handle: SessionHandle,
    /// Lifecycle state.
    pub status: SessionStatus,
    /// Last accepted movement (authoritative).
    pub sample: MovementSample,
    /// When `sample` was accepted.
    pub last_update: Instant,
    /// When the session registered.
    pub connected_at: Instant,
    /// Mirrored health.
    pub health: f32,
    /// Mirrored mana.
    pub mana: f32,
}

impl ClientSession {
    /// New pending session at the origin.
    pub fn new(id: SessionId, handle: SessionHandle) -> Self {
        let now = Instant::now();
        Self {
            id,
            handle,
            status: SessionStatus::Pending,
            sample: MovementSample::default(),
            last_update: now,
            connected_at: now,
            health: DEFAULT_VITAL,
            mana: DEFAULT_VITAL,
        }
    }

    /// Wire view of this session.
    pub fn player_state(&self) -> PlayerState {
        PlayerState {
            session_id: self.id,
            position: self.sample.position,
            rotation: self.sample.rotation,
            velocity: self.sample.velocity,
            health: self.health,
            mana: self.mana,
        }
    }
}

/// Read-only snapshot of every registered session, ordered by id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorldSnapshot {
    /// Session/sample pairs.
    pub entries: Vec<(SessionId, MovementSample)>,
    /// Wire view of the same sessions, in the same order.
    pub players: Vec<PlayerState>,
}

impl WorldSnapshot {
    /// Number of sessions captured.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if no session was registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Insert failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// Id already registered.
    #[error("session {0} already registered")]
    Duplicate(SessionId),
}

/// Concurrent session map.
pub struct SessionRegistry {
    sessions: RwLock<BTreeMap<SessionId, ClientSession>>,
    host: RwLock<Option<SessionId>>,
}

impl SessionRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(BTreeMap::new()),
            host: RwLock::new(None),
        }
    }

    /// Generate an id not currently registered.
    pub async fn allocate_id(&self) -> SessionId {
        let sessions = self.sessions.read().await;
        loop {
            let id = SessionId::new_random();
            if !sessions.contains_key(&id) {
                return id;
            }
        }
    }

    /// Register a session. At most one session per id.
    pub async fn insert(&self, session: ClientSession) -> Result<(), RegistryError> {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&session.id) {
            return Err(RegistryError::Duplicate(session.id));
        }
        debug!("Registered session {}", session.id.short());
        sessions.insert(session.id, session);
        Ok(())
    }

    /// Copy of a session record.
    pub async fn get(&self, id: &SessionId) -> Option<ClientSession> {
        self.sessions.read().await.get(id).cloned()
    }

    /// True if `id` is registered.
    pub async fn contains(&self, id: &SessionId) -> bool {
        self.sessions.read().await.contains_key(id)
    }

    /// Accept a movement sample as authoritative. Returns false if `id` is
    /// not registered.
    pub async fn update(&self, id: &SessionId, sample: MovementSample) -> bool {
        self.update_at(id, sample, Instant::now()).await
    }

    /// [`update`](Self::update) with an explicit acceptance time.
    pub async fn update_at(&self, id: &SessionId, sample: MovementSample, at: Instant) -> bool {
        let mut sessions = self.sessions.write().await;
        match sessions.get_mut(id) {
            Some(session) => {
                session.sample = MovementSample {
                    correction: false,
                    ..sample
                };
                session.last_update = at;
                true
            }
            None => false,
        }
    }

    /// Mark a pending session active.
    pub async fn activate(&self, id: &SessionId) -> bool {
        let mut sessions = self.sessions.write().await;
        match sessions.get_mut(id) {
            Some(session) => {
                session.status = SessionStatus::Active;
                true
            }
            None => false,
        }
    }

    /// Update mirrored vitals. `None` or a non-finite value leaves the
    /// current value unchanged.
    pub async fn set_vitals(&self, id: &SessionId, health: Option<f32>, mana: Option<f32>) -> bool {
        let mut sessions = self.sessions.write().await;
        match sessions.get_mut(id) {
            Some(session) => {
                if let Some(h) = health.filter(|h| h.is_finite()) {
                    session.health = h;
                }
                if let Some(m) = mana.filter(|m| m.is_finite()) {
                    session.mana = m;
                }
                true
            }
            None => false,
        }
    }

    /// Unregister a session. Idempotent.
    pub async fn remove(&self, id: &SessionId) -> Option<ClientSession> {
        let removed = self.sessions.write().await.remove(id);
        if removed.is_some() {
            let mut host = self.host.write().await;
            if host.as_ref() == Some(id) {
                *host = None;
            }
            debug!("Removed session {}", id.short());
        }
        removed
    }

    /// Drop every session (listener shutdown).
    pub async fn clear(&self) -> usize {
        let mut sessions = self.sessions.write().await;
        let count = sessions.len();
        sessions.clear();
        *self.host.write().await = None;
        count
    }

    /// Snapshot of all sessions, ordered by id.
    pub async fn snapshot(&self) -> WorldSnapshot {
        let sessions = self.sessions.read().await;
        let mut snapshot = WorldSnapshot {
            entries: Vec::with_capacity(sessions.len()),
            players: Vec::with_capacity(sessions.len()),
        };
        for (id, session) in sessions.iter() {
            snapshot.entries.push((*id, session.sample));
            snapshot.players.push(session.player_state());
        }
        snapshot
    }

    /// Outbound handles of every session except `exclude`.
    pub async fn handles_except(&self, exclude: Option<&SessionId>) -> Vec<(SessionId, SessionHandle)> {
        let sessions = self.sessions.read().await;
        sessions
            .iter()
            .filter(|(id, _)| Some(*id) != exclude)
            .map(|(id, s)| (*id, s.handle.clone()))
            .collect()
    }

    /// Registered ids, ordered.
    pub async fn ids(&self) -> Vec<SessionId> {
        self.sessions.read().await.keys().copied().collect()
    }

    /// Number of registered sessions.
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// True if nothing is registered.
    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Record the hosting session if none is recorded yet.
    pub async fn claim_host(&self, id: SessionId) -> bool {
        let mut host = self.host.write().await;
        if host.is_none() {
            *host = Some(id);
            true
        } else {
            false
        }
    }

    /// The hosting session, if any.
    pub async fn host(&self) -> Option<SessionId> {
        *self.host.read().await
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
