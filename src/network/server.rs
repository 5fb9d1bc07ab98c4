//! Transport Listener
//!
//! WebSocket listener for the sync core. Each accepted connection gets its
//! own task; decoded frames from every connection are funnelled into a
//! single inbound queue drained by the [`Dispatcher`], so validation never
//! runs concurrently with itself.
//!
//! ```text
//!  accept ──► handshake ──► register (Pending) ──► Joined ─┐
//!                                                          ▼
//!  ws frames ──► decode ──► stamp sender ──► inbound queue ──► Dispatcher
//!                                                          ▲
//!  close/error ──► remove session ──► Left(Disconnect) ────┘
//! ```

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::timeout;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, instrument, warn};

use crate::context::SyncContext;
use crate::network::codec::CodecError;
use crate::network::dispatch::{Dispatcher, Inbound, TickScheduler};
use crate::network::protocol::{MessageType, NetworkMessage};
use crate::network::session::{ClientSession, SessionHandle, SessionId};

/// Capacity of the shared inbound queue.
pub const INBOUND_QUEUE_CAPACITY: usize = 1024;

/// Transport errors.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Failed to bind the listening socket.
    #[error("Failed to bind: {0}")]
    BindFailed(#[from] std::io::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// `start` called on a running listener.
    #[error("Listener already running on {0}")]
    AlreadyRunning(SocketAddr),
}

/// Tasks owned by a running listener.
struct Running {
    local_addr: SocketAddr,
    tasks: Vec<JoinHandle<()>>,
}

/// Accepts connections and runs the server side of the sync core.
pub struct TransportListener {
    ctx: Arc<SyncContext>,
    hosted: bool,
    shutdown_tx: broadcast::Sender<()>,
    running: Option<Running>,
}

impl TransportListener {
    /// Create a stopped listener.
    pub fn new(ctx: Arc<SyncContext>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            ctx,
            hosted: false,
            shutdown_tx,
            running: None,
        }
    }

    /// Record the first session to register as the host session.
    pub fn hosted(mut self) -> Self {
        self.hosted = true;
        self
    }

    /// Shared context.
    pub fn context(&self) -> &Arc<SyncContext> {
        &self.ctx
    }

    /// Bound address while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|r| r.local_addr)
    }

    /// True between `start` and `stop`.
    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Bind `bind_host:port` and spawn the accept loop, the dispatcher and
    /// the tick scheduler. Port 0 picks an ephemeral port.
    #[instrument(skip(self))]
    pub async fn start(&mut self, port: u16) -> Result<SocketAddr, TransportError> {
        if let Some(running) = &self.running {
            return Err(TransportError::AlreadyRunning(running.local_addr));
        }

        let bind = format!("{}:{}", self.ctx.config.bind_host, port);
        let listener = match TcpListener::bind(&bind).await {
            Ok(l) => l,
            Err(e) => {
                error!("Failed to bind {}: {}", bind, e);
                return Err(e.into());
            }
        };
        let local_addr = listener.local_addr()?;
        info!("Sync listener on {}", local_addr);

        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE_CAPACITY);

        let dispatcher = Dispatcher::new(self.ctx.clone());
        let dispatcher_handle =
            tokio::spawn(dispatcher.run(inbound_rx, self.shutdown_tx.subscribe()));

        let scheduler = TickScheduler::new(self.ctx.clone());
        let tick_handle = tokio::spawn(scheduler.run(self.shutdown_tx.subscribe()));

        let accept_handle = tokio::spawn(accept_loop(
            listener,
            self.ctx.clone(),
            inbound_tx,
            self.shutdown_tx.clone(),
            self.shutdown_tx.subscribe(),
            self.hosted,
        ));

        self.running = Some(Running {
            local_addr,
            tasks: vec![accept_handle, dispatcher_handle, tick_handle],
        });
        Ok(local_addr)
    }

    /// Signal every task to stop, wait for them, and drop all sessions.
    /// No-op when not running.
    pub async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };

        let _ = self.shutdown_tx.send(());
        for task in running.tasks {
            if let Err(e) = task.await {
                warn!("Listener task ended abnormally: {}", e);
            }
        }

        let dropped = self.ctx.registry.clear().await;
        info!(
            "Sync listener on {} stopped ({} sessions closed)",
            running.local_addr, dropped
        );
    }
}

impl Drop for TransportListener {
    fn drop(&mut self) {
        if let Some(running) = self.running.take() {
            let _ = self.shutdown_tx.send(());
            for task in running.tasks {
                task.abort();
            }
        }
    }
}

/// Accept until shutdown, then wait for every connection task.
///
/// `shutdown_rx` is subscribed before the task is spawned so a stop issued
/// right after start is never missed.
async fn accept_loop(
    listener: TcpListener,
    ctx: Arc<SyncContext>,
    inbound_tx: mpsc::Sender<Inbound>,
    shutdown_tx: broadcast::Sender<()>,
    mut shutdown_rx: broadcast::Receiver<()>,
    hosted: bool,
) {
    let open = Arc::new(AtomicUsize::new(0));
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            biased;

            _ = shutdown_rx.recv() => {
                info!("Shutdown signal received");
                break;
            }
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        let count = open.load(Ordering::SeqCst);
                        if count >= ctx.config.max_players {
                            warn!("Player limit ({}) reached, rejecting {}", ctx.config.max_players, addr);
                            drop(stream);
                            continue;
                        }

                        info!("New connection from {}", addr);
                        open.fetch_add(1, Ordering::SeqCst);
                        let guard = OpenGuard(open.clone());
                        connections.spawn(handle_connection(
                            stream,
                            addr,
                            ctx.clone(),
                            inbound_tx.clone(),
                            shutdown_tx.subscribe(),
                            hosted,
                            guard,
                        ));
                    }
                    Err(e) => {
                        error!("Accept error: {}", e);
                    }
                }
            }
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }

    drop(listener);
    let drain = async { while connections.join_next().await.is_some() {} };
    if timeout(ctx.config.handshake_timeout(), drain).await.is_err() {
        warn!("Connections still open after shutdown grace period; aborting");
        connections.shutdown().await;
    }
}

/// Decrements the open-connection count when a connection task ends.
struct OpenGuard(Arc<AtomicUsize>);

impl Drop for OpenGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Serve one connection from handshake to removal.
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    ctx: Arc<SyncContext>,
    inbound_tx: mpsc::Sender<Inbound>,
    mut shutdown_rx: broadcast::Receiver<()>,
    hosted: bool,
    _guard: OpenGuard,
) {
    let ws_stream = match timeout(ctx.config.handshake_timeout(), accept_async(stream)).await {
        Ok(Ok(ws)) => ws,
        Ok(Err(e)) => {
            error!("WebSocket handshake failed for {}: {}", addr, e);
            return;
        }
        Err(_) => {
            warn!("WebSocket handshake timed out for {}", addr);
            return;
        }
    };

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let (out_tx, mut out_rx) =
        mpsc::channel::<NetworkMessage>(ctx.config.outbound_queue_capacity);

    let id = ctx.registry.allocate_id().await;
    if let Err(e) = ctx
        .registry
        .insert(ClientSession::new(id, SessionHandle::new(out_tx)))
        .await
    {
        error!("Failed to register {}: {}", addr, e);
        return;
    }
    if hosted && ctx.registry.claim_host(id).await {
        info!("Session {} is the host session", id.short());
    }
    info!("Session {} opened for {}", id.short(), addr);

    // Spawn outbound writer
    let writer_ctx = ctx.clone();
    let sender_task = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            let frame = match writer_ctx.codec.encode(&msg) {
                Ok(f) => f,
                Err(e) => {
                    error!("Failed to encode {:?}: {}", msg.message_type, e);
                    continue;
                }
            };
            #[cfg(feature = "debug-tracing")]
            debug!("-> {} bytes ({:?})", frame.len(), msg.message_type);
            if ws_sender.send(Message::Binary(frame)).await.is_err() {
                break;
            }
        }
        let _ = ws_sender.close().await;
    });

    if inbound_tx.send(Inbound::Joined(id)).await.is_err() {
        debug!("Inbound queue closed before {} joined", id.short());
    }

    loop {
        tokio::select! {
            msg = ws_receiver.next() => {
                let decoded = match msg {
                    Some(Ok(Message::Binary(data))) => {
                        #[cfg(feature = "debug-tracing")]
                        debug!("<- {} bytes from {}", data.len(), id.short());
                        ctx.codec.decode(&data)
                    }
                    Some(Ok(Message::Text(text))) => {
                        if ctx.codec.is_encrypted() {
                            Err(CodecError::EncryptionRequired)
                        } else {
                            ctx.codec.decode_text(&text)
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        debug!("Session {} closed by peer", id.short());
                        break;
                    }
                    Some(Err(e)) => {
                        warn!("WebSocket error for {}: {}", id.short(), e);
                        break;
                    }
                    Some(Ok(_)) => continue,
                };

                let mut message = match decoded {
                    Ok(m) => m,
                    Err(e) => {
                        warn!("Dropping frame from {}: {}", id.short(), e);
                        continue;
                    }
                };

                message.sender_id = id.to_string();
                if message.message_type == MessageType::Disconnect {
                    debug!("Session {} requested disconnect", id.short());
                    break;
                }

                if inbound_tx.send(Inbound::Message(message)).await.is_err() {
                    break;
                }
            }
            _ = shutdown_rx.recv() => {
                break;
            }
        }
    }

    close_session(&ctx, &inbound_tx, id).await;

    // Registry no longer holds the queue sender; let the writer drain and
    // send the close frame.
    if timeout(ctx.config.handshake_timeout(), sender_task).await.is_err() {
        debug!("Writer for {} did not finish in time", id.short());
    }
    info!("Session {} closed", id.short());
}

async fn close_session(ctx: &SyncContext, inbound_tx: &mpsc::Sender<Inbound>, id: SessionId) {
    if ctx.registry.remove(&id).await.is_some() {
        let _ = inbound_tx.send(Inbound::Left(NetworkMessage::disconnect(&id))).await;
    }
}
