//! Client Agent
//!
//! Client side of the sync core. Gameplay code drives it once per local
//! frame:
//!
//! ```text
//!  apply_input / send_movement / send_message ──► outgoing queue
//!  update(dt):  flush (coalesced) ──► writer task ──► server
//!               poll  ◄── reader task ◄── server
//!                 ├─ own correction  ──► reconcile (replay / snap)
//!                 ├─ peer movement   ──► interpolation target
//!                 └─ every message   ──► subscribers (registration order)
//!               interpolate remote peers
//! ```

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::config::ReconciliationMode;
use crate::context::SyncContext;
use crate::core::math::{Quat, Vec3};
use crate::network::codec::CodecError;
use crate::network::protocol::{
    MessageType, MovementSample, NetworkMessage, PlayerState, WelcomePayload, WorldStatePayload,
};
use crate::network::reconnect::{retry, ReconnectError, RetryPolicy};
use crate::network::session::SessionId;
use crate::prediction::{reconcile, simulate_step, InputCommand, InputRingBuffer, RemotePeer};

/// Client agent errors.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Operation needs a connection.
    #[error("Not connected")]
    NotConnected,

    /// `connect` called while connected.
    #[error("Already connected as {0}")]
    AlreadyConnected(SessionId),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Server did not welcome us in time.
    #[error("No welcome within {0:?}")]
    HandshakeTimeout(std::time::Duration),

    /// Connection closed during the handshake.
    #[error("Connection closed before welcome")]
    ClosedDuringHandshake,

    /// Bad welcome or outgoing payload.
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// Every connection attempt failed.
    #[error(transparent)]
    Reconnect(#[from] ReconnectError),

    /// Writer task is gone.
    #[error("Connection closed")]
    Closed,
}

/// Subscription handle returned by [`ClientAgent::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionId(u64);

/// Live connection to a server.
struct Connection {
    outgoing: mpsc::Sender<NetworkMessage>,
    incoming: mpsc::UnboundedReceiver<NetworkMessage>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

/// Result of a successful handshake.
struct Established {
    connection: Connection,
    welcome: WelcomePayload,
    early: Vec<NetworkMessage>,
}

/// Per-client networking, prediction and reconciliation.
pub struct ClientAgent {
    ctx: Arc<SyncContext>,
    connection: Option<Connection>,
    last_addr: Option<String>,
    session_id: Option<SessionId>,
    host_session_id: Option<SessionId>,
    outgoing: VecDeque<NetworkMessage>,
    predicted: MovementSample,
    inputs: InputRingBuffer,
    peers: BTreeMap<SessionId, RemotePeer>,
    subscribers: Vec<(SubscriptionId, mpsc::UnboundedSender<NetworkMessage>)>,
    next_subscription: u64,
    corrections: u64,
}

impl ClientAgent {
    /// Create a disconnected agent.
    pub fn new(ctx: Arc<SyncContext>) -> Self {
        let inputs = InputRingBuffer::new(ctx.config.prediction_buffer_size);
        Self {
            ctx,
            connection: None,
            last_addr: None,
            session_id: None,
            host_session_id: None,
            outgoing: VecDeque::new(),
            predicted: MovementSample::default(),
            inputs,
            peers: BTreeMap::new(),
            subscribers: Vec::new(),
            next_subscription: 0,
            corrections: 0,
        }
    }

    // =========================================================================
    // CONNECTION
    // =========================================================================

    /// Connect to `addr` (`host:port` or a `ws://` URL) and wait for the
    /// welcome. Retries with the configured fixed delay.
    pub async fn connect(&mut self, addr: &str) -> Result<SessionId, ClientError> {
        if let Some(id) = self.session_id.filter(|_| self.connection.is_some()) {
            return Err(ClientError::AlreadyConnected(id));
        }

        let url = ws_url(addr);
        self.last_addr = Some(url.clone());

        let ctx = self.ctx.clone();
        let policy = RetryPolicy::from_config(&ctx.config);
        let established = retry(policy, |_| open(ctx.clone(), url.clone())).await?;

        Ok(self.adopt(established))
    }

    /// Connect again to the last address used.
    pub async fn reconnect(&mut self) -> Result<SessionId, ClientError> {
        let addr = self.last_addr.clone().ok_or(ClientError::NotConnected)?;
        self.teardown(false).await;
        self.connect(&addr).await
    }

    /// Leave gracefully. Drops subscriptions and peers. No-op when offline.
    pub async fn disconnect(&mut self) {
        self.teardown(true).await;
        self.subscribers.clear();
    }

    async fn teardown(&mut self, announce: bool) {
        let Some(connection) = self.connection.take() else {
            self.reset_state();
            return;
        };

        if announce {
            if let Some(id) = self.session_id {
                let _ = connection.outgoing.try_send(NetworkMessage::disconnect(&id));
            }
        }

        // Closing the queue lets the writer flush and send the close frame
        drop(connection.outgoing);
        if timeout(self.ctx.config.handshake_timeout(), connection.writer)
            .await
            .is_err()
        {
            debug!("Writer did not finish in time");
        }
        connection.reader.abort();

        if let Some(id) = self.session_id {
            info!("Session {} disconnected", id.short());
        }
        self.reset_state();
    }

    fn reset_state(&mut self) {
        self.session_id = None;
        self.host_session_id = None;
        self.outgoing.clear();
        self.peers.clear();
        self.inputs.reset();
        self.predicted = MovementSample::default();
    }

    fn adopt(&mut self, established: Established) -> SessionId {
        let Established {
            connection,
            welcome,
            early,
        } = established;

        let id = welcome.your_session_id;
        self.connection = Some(connection);
        self.session_id = Some(id);
        self.host_session_id = welcome.host_session_id;
        self.inputs.reset();
        self.peers.clear();

        for player in &welcome.current_players {
            if player.session_id == id {
                self.predicted = MovementSample {
                    position: player.position,
                    rotation: player.rotation,
                    velocity: player.velocity,
                    ..Default::default()
                };
            } else {
                self.peers.insert(player.session_id, RemotePeer::from_state(player));
            }
        }
        info!(
            "Connected as {} ({} peers)",
            id.short(),
            self.peers.len()
        );

        for message in early {
            self.handle_incoming(message);
        }
        id
    }

    // =========================================================================
    // SENDING
    // =========================================================================

    /// Queue a movement pose from an external controller.
    ///
    /// Controller poses are unsequenced (sequence 0) and supersede any
    /// buffered inputs, so a correction to one replays nothing.
    pub fn send_movement(
        &mut self,
        position: Vec3,
        rotation: Quat,
        velocity: Vec3,
    ) -> Result<(), ClientError> {
        self.ensure_connected()?;

        let sample = MovementSample {
            position,
            rotation,
            velocity,
            grounded: self.predicted.grounded,
            correction: false,
            sequence: 0,
        };
        self.inputs.clear();
        self.predicted = sample;
        self.queue_movement(sample)
    }

    /// Apply an input locally (when prediction is on), buffer it, and queue
    /// the resulting movement.
    pub fn apply_input(&mut self, command: InputCommand, dt: f32) -> Result<MovementSample, ClientError> {
        self.ensure_connected()?;

        let input = self.inputs.record(command, dt);
        let next = simulate_step(&self.predicted, &input);
        if self.ctx.config.prediction {
            self.predicted = next;
        }
        self.queue_movement(next)?;
        Ok(next)
    }

    fn queue_movement(&mut self, sample: MovementSample) -> Result<(), ClientError> {
        let id = self.ensure_connected()?;
        let message = NetworkMessage::movement(id.to_string(), &sample)?;
        self.outgoing.push_back(message);
        Ok(())
    }

    /// Queue a gameplay message with an opaque payload.
    pub fn send_message(&mut self, message_type: MessageType, payload: Vec<u8>) -> Result<(), ClientError> {
        let id = self.ensure_connected()?;
        self.outgoing
            .push_back(NetworkMessage::new(message_type, id.to_string(), payload));
        Ok(())
    }

    /// Queue a prebuilt message. The server overwrites its sender.
    pub fn send(&mut self, message: NetworkMessage) -> Result<(), ClientError> {
        self.ensure_connected()?;
        self.outgoing.push_back(message);
        Ok(())
    }

    /// Send queued messages. Only the newest Movement is sent; everything
    /// else keeps its order. Returns how many frames were handed to the
    /// writer.
    pub fn flush(&mut self) -> Result<usize, ClientError> {
        let Some(connection) = &self.connection else {
            self.outgoing.clear();
            return Err(ClientError::NotConnected);
        };

        let newest_movement = self
            .outgoing
            .iter()
            .rposition(|m| m.message_type == MessageType::Movement);

        let mut sent = 0;
        for (i, message) in std::mem::take(&mut self.outgoing).into_iter().enumerate() {
            if message.message_type == MessageType::Movement && Some(i) != newest_movement {
                continue;
            }
            match connection.outgoing.try_send(message) {
                Ok(()) => sent += 1,
                Err(mpsc::error::TrySendError::Full(m)) => {
                    warn!("Send queue full; dropped {:?}", m.message_type);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    warn!("Connection lost while flushing");
                    self.connection = None;
                    return Err(ClientError::Closed);
                }
            }
        }
        Ok(sent)
    }

    // =========================================================================
    // RECEIVING
    // =========================================================================

    /// Register a receiver for every incoming message. Delivery follows
    /// registration order.
    pub fn subscribe(&mut self) -> (SubscriptionId, mpsc::UnboundedReceiver<NetworkMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = SubscriptionId(self.next_subscription);
        self.next_subscription += 1;
        self.subscribers.push((id, tx));
        (id, rx)
    }

    /// Remove a subscription. Returns false if it was not registered.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.subscribers.len();
        self.subscribers.retain(|(sid, _)| *sid != id);
        self.subscribers.len() != before
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Process everything the reader has delivered. Returns the number of
    /// messages handled.
    pub fn poll(&mut self) -> usize {
        let mut batch = Vec::new();
        let mut lost = false;
        if let Some(connection) = &mut self.connection {
            loop {
                match connection.incoming.try_recv() {
                    Ok(message) => batch.push(message),
                    Err(mpsc::error::TryRecvError::Empty) => break,
                    Err(mpsc::error::TryRecvError::Disconnected) => {
                        lost = true;
                        break;
                    }
                }
            }
        }

        let count = batch.len();
        for message in batch {
            self.handle_incoming(message);
        }

        if lost {
            warn!("Connection to server lost");
            if let Some(connection) = self.connection.take() {
                connection.writer.abort();
            }
            self.reset_state();
        }
        count
    }

    /// Wait up to `limit` for at least one message, then process the
    /// backlog. Returns the number of messages handled.
    pub async fn poll_wait(&mut self, limit: std::time::Duration) -> usize {
        let first = match &mut self.connection {
            Some(connection) => timeout(limit, connection.incoming.recv()).await,
            None => return 0,
        };
        match first {
            Ok(Some(message)) => {
                self.handle_incoming(message);
                1 + self.poll()
            }
            Ok(None) => self.poll(),
            Err(_) => 0,
        }
    }

    /// One local frame: flush, poll, interpolate peers.
    pub fn update(&mut self, dt: f32) -> Result<usize, ClientError> {
        self.flush()?;
        let handled = self.poll();
        self.interpolate(dt);
        Ok(handled)
    }

    /// Advance every remote peer's presented pose.
    pub fn interpolate(&mut self, dt: f32) {
        let rate = self.ctx.config.interpolation_rate;
        for peer in self.peers.values_mut() {
            peer.interpolate(dt, rate);
        }
    }

    fn handle_incoming(&mut self, message: NetworkMessage) {
        let own = self.session_id;
        let sender = message.sender_session();

        match message.message_type {
            MessageType::Movement => match message.decode_payload::<MovementSample>() {
                Ok(sample) if sample.correction && sender.is_some() && sender == own => {
                    self.apply_correction(&sample);
                }
                Ok(sample) => {
                    if let Some(peer_id) = sender.filter(|s| Some(*s) != own) {
                        self.peers
                            .entry(peer_id)
                            .or_insert_with(|| RemotePeer::new(peer_id, sample.position, sample.rotation))
                            .apply_sample(&sample);
                    }
                }
                Err(e) => warn!("Bad movement payload: {}", e),
            },
            MessageType::WorldState => match message.decode_payload::<WorldStatePayload>() {
                Ok(state) => self.apply_world_state(&state),
                Err(e) => warn!("Bad world state payload: {}", e),
            },
            MessageType::PlayerSpawn => match message.decode_payload::<PlayerState>() {
                Ok(player) if Some(player.session_id) != own => {
                    debug!("Peer {} spawned", player.session_id.short());
                    self.peers
                        .insert(player.session_id, RemotePeer::from_state(&player));
                }
                Ok(_) => {}
                Err(e) => warn!("Bad spawn payload: {}", e),
            },
            MessageType::Disconnect => {
                if let Some(peer_id) = sender {
                    if self.peers.remove(&peer_id).is_some() {
                        debug!("Peer {} left", peer_id.short());
                    }
                }
            }
            _ => {}
        }

        self.subscribers
            .retain(|(_, tx)| tx.send(message.clone()).is_ok());
    }

    fn apply_correction(&mut self, correction: &MovementSample) {
        let mode = if self.ctx.config.prediction {
            self.ctx.config.reconciliation
        } else {
            ReconciliationMode::SnapOnly
        };
        let result = reconcile(&self.predicted, correction, &mut self.inputs, mode);
        debug!(
            "Correction applied: {} inputs replayed, error {:.2}",
            result.replayed, result.error
        );
        self.predicted = result.state;
        self.corrections += 1;
    }

    fn apply_world_state(&mut self, state: &WorldStatePayload) {
        let own = self.session_id;
        for player in &state.players {
            if Some(player.session_id) == own {
                if !self.ctx.config.prediction {
                    self.predicted.position = player.position;
                    self.predicted.rotation = player.rotation;
                    self.predicted.velocity = player.velocity;
                }
                continue;
            }
            self.peers
                .entry(player.session_id)
                .or_insert_with(|| RemotePeer::from_state(player))
                .apply_state(player);
        }
        self.peers
            .retain(|id, _| state.players.iter().any(|p| p.session_id == *id));
    }

    // =========================================================================
    // STATE
    // =========================================================================

    fn ensure_connected(&self) -> Result<SessionId, ClientError> {
        match (self.session_id, &self.connection) {
            (Some(id), Some(_)) => Ok(id),
            _ => Err(ClientError::NotConnected),
        }
    }

    /// True while a connection is open.
    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    /// Our session id while connected.
    pub fn session_id(&self) -> Option<SessionId> {
        self.session_id
    }

    /// Host session announced in the welcome.
    pub fn host_session_id(&self) -> Option<SessionId> {
        self.host_session_id
    }

    /// True if this agent is the hosting participant.
    pub fn is_host(&self) -> bool {
        self.session_id.is_some() && self.session_id == self.host_session_id
    }

    /// Current predicted (or server-mirrored) local state.
    pub fn predicted(&self) -> &MovementSample {
        &self.predicted
    }

    /// Inputs not yet accounted for by the server.
    pub fn pending_inputs(&self) -> usize {
        self.inputs.len()
    }

    /// Messages waiting for the next flush.
    pub fn queued(&self) -> usize {
        self.outgoing.len()
    }

    /// Corrections received since creation.
    pub fn corrections(&self) -> u64 {
        self.corrections
    }

    /// A remote peer.
    pub fn peer(&self, id: &SessionId) -> Option<&RemotePeer> {
        self.peers.get(id)
    }

    /// All remote peers, ordered by id.
    pub fn peers(&self) -> impl Iterator<Item = &RemotePeer> {
        self.peers.values()
    }
}

impl Drop for ClientAgent {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.take() {
            connection.reader.abort();
            connection.writer.abort();
        }
    }
}

fn ws_url(addr: &str) -> String {
    if addr.starts_with("ws://") || addr.starts_with("wss://") {
        addr.to_string()
    } else {
        format!("ws://{}", addr)
    }
}

/// Open a connection and wait for the welcome.
async fn open(ctx: Arc<SyncContext>, url: String) -> Result<Established, ClientError> {
    let limit = ctx.config.handshake_timeout();
    let deadline = Instant::now() + limit;

    let (ws_stream, _) = match timeout(limit, connect_async(url.as_str())).await {
        Ok(result) => result?,
        Err(_) => return Err(ClientError::HandshakeTimeout(limit)),
    };
    debug!("WebSocket connected to {}", url);

    let (mut write, mut read) = ws_stream.split();
    let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<NetworkMessage>(ctx.config.outbound_queue_capacity);
    let (incoming_tx, mut incoming_rx) = mpsc::unbounded_channel();

    let writer_ctx = ctx.clone();
    let writer = tokio::spawn(async move {
        while let Some(message) = outgoing_rx.recv().await {
            let frame = match writer_ctx.codec.encode(&message) {
                Ok(f) => f,
                Err(e) => {
                    warn!("Failed to encode {:?}: {}", message.message_type, e);
                    continue;
                }
            };
            if write.send(Message::Binary(frame)).await.is_err() {
                break;
            }
        }
        let _ = write.close().await;
    });

    let reader_ctx = ctx.clone();
    let reader = tokio::spawn(async move {
        while let Some(frame) = read.next().await {
            let decoded = match frame {
                Ok(Message::Binary(data)) => reader_ctx.codec.decode(&data),
                Ok(Message::Text(text)) if !reader_ctx.codec.is_encrypted() => {
                    reader_ctx.codec.decode_text(&text)
                }
                Ok(Message::Close(_)) => break,
                Ok(_) => continue,
                Err(e) => {
                    warn!("WebSocket read error: {}", e);
                    break;
                }
            };
            match decoded {
                Ok(message) => {
                    if incoming_tx.send(message).is_err() {
                        break;
                    }
                }
                Err(e) => warn!("Dropping frame from server: {}", e),
            }
        }
    });

    let mut early = Vec::new();
    loop {
        let next = match tokio::time::timeout_at(deadline, incoming_rx.recv()).await {
            Ok(next) => next,
            Err(_) => {
                reader.abort();
                writer.abort();
                return Err(ClientError::HandshakeTimeout(limit));
            }
        };
        match next {
            Some(message) if message.message_type == MessageType::Connect => {
                let welcome = match message.decode_payload::<WelcomePayload>() {
                    Ok(w) => w,
                    Err(e) => {
                        reader.abort();
                        writer.abort();
                        return Err(e.into());
                    }
                };
                return Ok(Established {
                    connection: Connection {
                        outgoing: outgoing_tx,
                        incoming: incoming_rx,
                        reader,
                        writer,
                    },
                    welcome,
                    early,
                });
            }
            Some(message) => early.push(message),
            None => {
                writer.abort();
                return Err(ClientError::ClosedDuringHandshake);
            }
        }
    }
}
