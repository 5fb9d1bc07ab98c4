//! Network Layer
//!
//! WebSocket transport, wire codec, session registry, server-side
//! validation and the client agent.

pub mod client;
pub mod codec;
pub mod dispatch;
pub mod protocol;
pub mod reconnect;
pub mod server;
pub mod session;
pub mod validation;

pub use client::{ClientAgent, ClientError, SubscriptionId};
pub use codec::{CodecError, MessageCodec};
pub use dispatch::{Dispatcher, Inbound, TickScheduler};
pub use protocol::{
    MessageType, MovementSample, NetworkMessage, PlayerState, ResourceUpdatePayload,
    WelcomePayload, WorldStatePayload,
};
pub use reconnect::{ReconnectError, RetryPolicy};
pub use server::{TransportError, TransportListener};
pub use session::{ClientSession, SessionId, SessionRegistry, WorldSnapshot};
pub use validation::{validate_movement, MovementRules, MovementVerdict};
