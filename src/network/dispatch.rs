//! Validation & Tick Scheduler
//!
//! Two workers share the session registry:
//!
//! - the **dispatcher** drains the single inbound queue fed by every
//!   connection's receive loop, so message handling never runs concurrently
//!   with itself;
//! - the **tick scheduler** broadcasts a world snapshot to every session at
//!   the configured rate, whether or not anyone moved.
//!
//! Outbound fan-out uses non-blocking queue pushes: a slow or dead
//! connection loses its own frames and never stalls the others.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{broadcast, mpsc};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

use crate::context::SyncContext;
use crate::network::protocol::{
    MessageType, MovementSample, NetworkMessage, ResourceUpdatePayload, WelcomePayload,
    WorldStatePayload,
};
use crate::network::session::{SendError, SessionHandle, SessionId};
use crate::network::validation::{validate_movement, MovementVerdict};

/// Work item on the inbound queue.
#[derive(Debug, Clone)]
pub enum Inbound {
    /// A session finished its handshake.
    Joined(SessionId),
    /// A decoded message; `sender_id` already stamped by the transport.
    Message(NetworkMessage),
    /// A session closed; carries the synthetic disconnect.
    Left(NetworkMessage),
}

/// What the dispatcher did with one inbound item.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Welcome sent, spawn announced to `announced` sessions.
    Welcomed {
        /// Sessions told about the newcomer.
        announced: usize,
    },
    /// Movement accepted and relayed to `relayed` other sessions.
    MovementAccepted {
        /// Sessions the movement was relayed to.
        relayed: usize,
    },
    /// Movement rejected; a correction went back to the sender.
    MovementCorrected {
        /// The authoritative sample sent back.
        correction: MovementSample,
    },
    /// Fanned out unmodified to `delivered` sessions.
    Relayed {
        /// Sessions the message was delivered to.
        delivered: usize,
    },
    /// Dropped (unknown session, bad payload, server-only type).
    Dropped(DropReason),
}

/// Why a message was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Sender is not registered.
    UnknownSession,
    /// Payload did not parse.
    BadPayload,
    /// Clients may not send this type.
    ServerOnlyType,
}

/// Single consumer of the inbound queue.
pub struct Dispatcher {
    ctx: Arc<SyncContext>,
}

impl Dispatcher {
    /// Create a dispatcher over the shared context.
    pub fn new(ctx: Arc<SyncContext>) -> Self {
        Self { ctx }
    }

    /// Drain `inbound` until it closes or shutdown is signalled.
    #[instrument(skip_all)]
    pub async fn run(
        self,
        mut inbound: mpsc::Receiver<Inbound>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                item = inbound.recv() => {
                    match item {
                        Some(item) => {
                            self.handle(item).await;
                        }
                        None => break,
                    }
                }
                _ = shutdown.recv() => break,
            }
        }
        debug!("Dispatcher stopped");
    }

    /// Process one inbound item.
    pub async fn handle(&self, item: Inbound) -> Outcome {
        match item {
            Inbound::Joined(id) => self.handle_join(id).await,
            Inbound::Left(notice) => {
                let delivered = self.fan_out(&notice, None).await;
                Outcome::Relayed { delivered }
            }
            Inbound::Message(message) => self.handle_message(message).await,
        }
    }

    async fn handle_join(&self, id: SessionId) -> Outcome {
        let registry = &self.ctx.registry;
        let Some(session) = registry.get(&id).await else {
            warn!("Join for unknown session {}", id.short());
            return Outcome::Dropped(DropReason::UnknownSession);
        };

        let welcome = WelcomePayload {
            your_session_id: id,
            host_session_id: registry.host().await,
            current_players: registry.snapshot().await.players,
        };
        match NetworkMessage::with_payload(MessageType::Connect, id.to_string(), &welcome) {
            Ok(msg) => {
                deliver(&id, &session.handle, msg);
            }
            Err(e) => warn!("Failed to build welcome for {}: {}", id.short(), e),
        }
        registry.activate(&id).await;

        let announced = match NetworkMessage::with_payload(
            MessageType::PlayerSpawn,
            id.to_string(),
            &session.player_state(),
        ) {
            Ok(spawn) => self.fan_out(&spawn, Some(&id)).await,
            Err(e) => {
                warn!("Failed to build spawn for {}: {}", id.short(), e);
                0
            }
        };

        info!("Session {} joined ({} others notified)", id.short(), announced);
        Outcome::Welcomed { announced }
    }

    async fn handle_message(&self, message: NetworkMessage) -> Outcome {
        let Some(sender) = message.sender_session() else {
            warn!("Message with unparseable sender {:?} ignored", message.sender_id);
            return Outcome::Dropped(DropReason::UnknownSession);
        };

        if message.message_type.is_server_only() {
            warn!(
                "Session {} sent server-only {:?}; dropped",
                sender.short(),
                message.message_type
            );
            return Outcome::Dropped(DropReason::ServerOnlyType);
        }

        if !self.ctx.registry.contains(&sender).await {
            warn!(
                "{:?} from unknown session {} ignored",
                message.message_type,
                sender.short()
            );
            return Outcome::Dropped(DropReason::UnknownSession);
        }

        match message.message_type {
            MessageType::Movement => self.handle_movement(sender, message).await,
            MessageType::ResourceUpdate => {
                match message.decode_payload::<ResourceUpdatePayload>() {
                    Ok(update) => {
                        self.ctx
                            .registry
                            .set_vitals(&sender, update.health, update.mana)
                            .await;
                    }
                    Err(e) => debug!("ResourceUpdate without vitals from {}: {}", sender.short(), e),
                }
                let delivered = self.fan_out(&message, None).await;
                Outcome::Relayed { delivered }
            }
            _ => {
                let delivered = self.fan_out(&message, None).await;
                Outcome::Relayed { delivered }
            }
        }
    }

    async fn handle_movement(&self, sender: SessionId, message: NetworkMessage) -> Outcome {
        let reported: MovementSample = match message.decode_payload() {
            Ok(sample) => sample,
            Err(e) => {
                warn!("Bad movement payload from {}: {}", sender.short(), e);
                return Outcome::Dropped(DropReason::BadPayload);
            }
        };

        let registry = &self.ctx.registry;
        let Some(session) = registry.get(&sender).await else {
            return Outcome::Dropped(DropReason::UnknownSession);
        };

        let now = Instant::now();
        // Non-finite samples never become authoritative, validation or not
        let verdict = if !reported.is_finite() {
            MovementVerdict::NonFinite
        } else if self.ctx.config.validate_movement {
            let elapsed = now.saturating_duration_since(session.last_update);
            validate_movement(&session.sample, &reported, elapsed, &self.ctx.movement_rules())
        } else {
            MovementVerdict::Accepted {
                distance: reported.position.distance(session.sample.position),
            }
        };

        if !verdict.is_accepted() {
            if let MovementVerdict::TooFar { distance, max_allowed } = verdict {
                debug!(
                    "Correcting {}: moved {:.2} > {:.2} allowed",
                    sender.short(),
                    distance,
                    max_allowed
                );
            } else {
                debug!("Correcting {}: non-finite sample", sender.short());
            }

            // Last accepted pose, tagged with the rejected input's
            // sequence so the client replays only what came after it
            let correction = MovementSample {
                correction: true,
                sequence: reported.sequence,
                ..session.sample
            };
            match NetworkMessage::movement(sender.to_string(), &correction) {
                Ok(msg) => {
                    deliver(&sender, &session.handle, msg);
                }
                Err(e) => warn!("Failed to build correction for {}: {}", sender.short(), e),
            }
            return Outcome::MovementCorrected { correction };
        }

        registry.update_at(&sender, reported, now).await;
        let relayed = self.fan_out(&message, Some(&sender)).await;
        Outcome::MovementAccepted { relayed }
    }

    async fn fan_out(&self, message: &NetworkMessage, exclude: Option<&SessionId>) -> usize {
        broadcast_message(&self.ctx, message, exclude).await
    }
}

/// Push `message` to every session except `exclude`. Returns how many
/// queues accepted it.
pub async fn broadcast_message(
    ctx: &SyncContext,
    message: &NetworkMessage,
    exclude: Option<&SessionId>,
) -> usize {
    let targets = ctx.registry.handles_except(exclude).await;
    let mut delivered = 0;
    for (id, handle) in targets {
        if deliver(&id, &handle, message.clone()) {
            delivered += 1;
        }
    }
    delivered
}

fn deliver(id: &SessionId, handle: &SessionHandle, message: NetworkMessage) -> bool {
    match handle.try_send(message) {
        Ok(()) => true,
        Err(SendError::Full) => {
            warn!("Outbound queue full for {}; frame dropped", id.short());
            false
        }
        Err(SendError::Closed) => {
            debug!("Outbound queue closed for {}", id.short());
            false
        }
    }
}

/// Fixed-rate snapshot broadcaster.
pub struct TickScheduler {
    ctx: Arc<SyncContext>,
    tick: u64,
}

impl TickScheduler {
    /// Create a scheduler over the shared context.
    pub fn new(ctx: Arc<SyncContext>) -> Self {
        Self { ctx, tick: 0 }
    }

    /// Ticks run so far.
    pub fn current_tick(&self) -> u64 {
        self.tick
    }

    /// Build one snapshot and send it to every session. Returns the number
    /// of sessions it reached.
    pub async fn tick_once(&mut self) -> usize {
        self.tick += 1;

        let snapshot = self.ctx.registry.snapshot().await;
        if snapshot.is_empty() {
            return 0;
        }

        let payload = WorldStatePayload {
            tick: self.tick,
            players: snapshot.players,
        };
        match NetworkMessage::with_payload(MessageType::WorldState, "server", &payload) {
            Ok(msg) => broadcast_message(&self.ctx, &msg, None).await,
            Err(e) => {
                warn!("Failed to build world state: {}", e);
                0
            }
        }
    }

    /// Tick until shutdown is signalled.
    #[instrument(skip_all)]
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = interval(self.ctx.config.tick_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!("Tick scheduler running at {} Hz", self.ctx.config.tick_rate);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick_once().await;
                }
                _ = shutdown.recv() => break,
            }
        }
        debug!("Tick scheduler stopped after {} ticks", self.tick);
    }
}
