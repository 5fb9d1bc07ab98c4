//! Mode Coordinator
//!
//! Owns the role of this process: offline, hosting (listener plus a local
//! client agent connected over loopback), or client of a remote host.
//!
//! ```text
//!            start_host(port)
//!   Offline ─────────────────► Host ──┐
//!      │     start_client(addr)       │ disconnect()
//!      └─────────────────────► Client ┴──► Offline
//! ```

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::context::SyncContext;
use crate::network::client::{ClientAgent, ClientError, SubscriptionId};
use crate::network::protocol::{MessageType, NetworkMessage};
use crate::network::server::{TransportError, TransportListener};
use crate::network::session::SessionId;

/// Active role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkMode {
    /// Not connected.
    Offline,
    /// Running the listener and a local agent.
    Host,
    /// Connected to a remote listener.
    Client,
}

impl fmt::Display for NetworkMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkMode::Offline => write!(f, "offline"),
            NetworkMode::Host => write!(f, "host"),
            NetworkMode::Client => write!(f, "client"),
        }
    }
}

/// Mode transition errors.
#[derive(Debug, thiserror::Error)]
pub enum ModeError {
    /// A role is already active.
    #[error("Already running as {0}")]
    AlreadyActive(NetworkMode),

    /// Listener failed to start.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Local agent failed.
    #[error("Client error: {0}")]
    Client(#[from] ClientError),
}

/// Single entry point for gameplay code.
pub struct ModeCoordinator {
    ctx: Arc<SyncContext>,
    mode: NetworkMode,
    listener: Option<TransportListener>,
    agent: ClientAgent,
}

impl ModeCoordinator {
    /// Offline coordinator over `ctx`.
    pub fn new(ctx: Arc<SyncContext>) -> Self {
        let agent = ClientAgent::new(ctx.clone());
        Self {
            ctx,
            mode: NetworkMode::Offline,
            listener: None,
            agent,
        }
    }

    /// Current role.
    pub fn mode(&self) -> NetworkMode {
        self.mode
    }

    /// Listener address while hosting.
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr())
    }

    fn check_offline(&self) -> Result<(), ModeError> {
        if self.mode != NetworkMode::Offline {
            warn!("Start ignored: already running as {}", self.mode);
            return Err(ModeError::AlreadyActive(self.mode));
        }
        Ok(())
    }

    /// Start the listener on `port` and connect the local agent to it.
    pub async fn start_host(&mut self, port: u16) -> Result<SocketAddr, ModeError> {
        self.check_offline()?;

        let mut listener = TransportListener::new(self.ctx.clone()).hosted();
        let addr = listener.start(port).await?;

        let local_ip = if addr.ip().is_unspecified() {
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        } else {
            addr.ip()
        };
        let loopback = SocketAddr::new(local_ip, addr.port());

        if let Err(e) = self.agent.connect(&loopback.to_string()).await {
            warn!("Local agent could not join own listener: {}", e);
            listener.stop().await;
            return Err(e.into());
        }

        self.listener = Some(listener);
        self.mode = NetworkMode::Host;
        info!("Hosting on {}", addr);
        Ok(addr)
    }

    /// Connect the agent to a remote host.
    pub async fn start_client(&mut self, addr: &str) -> Result<SessionId, ModeError> {
        self.check_offline()?;

        let id = self.agent.connect(addr).await?;
        self.mode = NetworkMode::Client;
        info!("Joined {} as client", addr);
        Ok(id)
    }

    /// Leave the current role. Hosting also stops the listener, closing
    /// every session.
    pub async fn disconnect(&mut self) {
        match self.mode {
            NetworkMode::Offline => return,
            NetworkMode::Host => {
                self.agent.disconnect().await;
                if let Some(mut listener) = self.listener.take() {
                    listener.stop().await;
                }
            }
            NetworkMode::Client => {
                self.agent.disconnect().await;
            }
        }
        info!("Left {} mode", self.mode);
        self.mode = NetworkMode::Offline;
    }

    /// Queue a gameplay message.
    pub fn send_message(&mut self, message_type: MessageType, payload: Vec<u8>) -> Result<(), ModeError> {
        Ok(self.agent.send_message(message_type, payload)?)
    }

    /// Subscribe to every incoming message.
    pub fn subscribe(&mut self) -> (SubscriptionId, mpsc::UnboundedReceiver<NetworkMessage>) {
        self.agent.subscribe()
    }

    /// Remove a subscription.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.agent.unsubscribe(id)
    }

    /// Drive the local agent for one frame.
    ///
    /// If the link to the server is lost, a client retries with the
    /// configured bounded policy; a host (or a client whose retries are
    /// spent) drops back to `Offline` and reports the error.
    pub async fn update(&mut self, dt: f32) -> Result<usize, ModeError> {
        if self.mode == NetworkMode::Offline {
            return Ok(0);
        }
        let result = self.agent.update(dt);
        if self.agent.is_connected() {
            return Ok(result?);
        }

        warn!("Connection lost while running as {}", self.mode);
        self.recover().await
    }

    async fn recover(&mut self) -> Result<usize, ModeError> {
        if self.mode == NetworkMode::Client {
            match self.agent.reconnect().await {
                Ok(id) => {
                    info!("Rejoined as {}", id.short());
                    return Ok(0);
                }
                Err(e) => {
                    warn!("Giving up on server: {}", e);
                    self.mode = NetworkMode::Offline;
                    return Err(e.into());
                }
            }
        }

        if let Some(mut listener) = self.listener.take() {
            listener.stop().await;
        }
        self.mode = NetworkMode::Offline;
        Err(ModeError::Client(ClientError::Closed))
    }

    /// The local client agent.
    pub fn agent(&self) -> &ClientAgent {
        &self.agent
    }

    /// The local client agent, mutably.
    pub fn agent_mut(&mut self) -> &mut ClientAgent {
        &mut self.agent
    }

    /// Shared context.
    pub fn context(&self) -> &Arc<SyncContext> {
        &self.ctx
    }
}
