//! # Syncore
//!
//! Authoritative multiplayer synchronization core: accepts player
//! connections, keeps the canonical position/orientation/velocity of every
//! participant, validates and corrects client-reported movement, and
//! distributes world snapshots at a fixed rate. Clients predict locally and
//! reconcile against server corrections.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         SYNCORE                              │
//! ├─────────────────────────────────────────────────────────────┤
//! │  core/              - Shared primitives                      │
//! │  ├── math.rs        - Vec3 / Quat                            │
//! │  └── time.rs        - Wire timestamps                        │
//! │                                                              │
//! │  network/           - Transport and server authority         │
//! │  ├── codec.rs       - Frame encode/decode (lz4, AES-CBC)     │
//! │  ├── protocol.rs    - NetworkMessage and payloads            │
//! │  ├── server.rs      - WebSocket transport listener           │
//! │  ├── session.rs     - Session registry                       │
//! │  ├── validation.rs  - Movement speed checks                  │
//! │  ├── dispatch.rs    - Inbound dispatcher + tick scheduler    │
//! │  ├── client.rs      - Client agent                           │
//! │  └── reconnect.rs   - Fixed-delay bounded retry              │
//! │                                                              │
//! │  prediction/        - Client prediction (pure)               │
//! │  ├── input.rs       - Input ring buffer, kinematic step      │
//! │  ├── reconcile.rs   - Correction replay                      │
//! │  └── interpolation.rs - Remote peer smoothing                │
//! │                                                              │
//! │  config.rs          - SyncConfig (defaults, JSON, env)       │
//! │  context.rs         - Shared SyncContext                     │
//! │  mode.rs            - Offline / Host / Client coordinator    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Authority
//!
//! The server is the single writer of authoritative state:
//! - a session's stored sample is always the last one the server accepted
//! - rejected movement is answered with a correction, never a disconnect
//! - `sender_id` is overwritten with the connection's session id on receipt
//!
//! ## Example
//!
//! ```no_run
//! use syncore::{ModeCoordinator, SyncConfig, SyncContext};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let ctx = SyncContext::new(SyncConfig::default())?;
//! let mut mode = ModeCoordinator::new(ctx);
//! mode.start_host(7777).await?;
//! mode.update(1.0 / 60.0).await?;
//! mode.disconnect().await;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod config;
pub mod context;
pub mod core;
pub mod mode;
pub mod network;
pub mod prediction;

// Re-export commonly used types
pub use config::{ConfigError, ReconciliationMode, SyncConfig, WireFormat};
pub use context::SyncContext;
pub use core::math::{Quat, Vec3};
pub use mode::{ModeCoordinator, ModeError, NetworkMode};
pub use network::{
    ClientAgent, MessageCodec, MessageType, MovementSample, NetworkMessage, SessionId,
    SessionRegistry, TransportListener,
};
pub use prediction::InputCommand;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
