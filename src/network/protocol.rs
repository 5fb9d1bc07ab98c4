//! Protocol Messages
//!
//! Logical wire message exchanged between client agents and the server.
//! The envelope is fixed; the payload is opaque bytes so gameplay
//! collaborators can carry their own schemas. The payloads the core itself
//! understands (movement, world state, welcome, resource update) are JSON
//! inside `payload`.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::core::math::{Quat, Vec3};
use crate::core::time::unix_millis;
use crate::network::codec::CodecError;
use crate::network::session::SessionId;

// =============================================================================
// ENVELOPE
// =============================================================================

/// Message kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    /// Server welcome to a newly connected session.
    Connect,
    /// Session left (server-synthesized) or client leaving.
    Disconnect,
    /// A new participant appeared.
    PlayerSpawn,
    /// Position/orientation/velocity update or correction.
    Movement,
    /// Gameplay action.
    Action,
    /// Periodic world snapshot.
    WorldState,
    /// Damage notification.
    Damage,
    /// Resource (health/mana/currency) update.
    ResourceUpdate,
    /// Chat line.
    Chat,
}

impl MessageType {
    /// Types only the server may originate.
    pub fn is_server_only(self) -> bool {
        matches!(
            self,
            MessageType::Connect | MessageType::PlayerSpawn | MessageType::WorldState
        )
    }
}

/// Wire message envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkMessage {
    /// Message kind.
    #[serde(rename = "type")]
    pub message_type: MessageType,
    /// Sender session. Overwritten by the server on receipt.
    pub sender_id: String,
    /// Unix milliseconds at creation.
    pub timestamp: i64,
    /// Opaque payload.
    pub payload: Vec<u8>,
}

impl NetworkMessage {
    /// Create a message stamped with the current time.
    pub fn new(message_type: MessageType, sender_id: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            message_type,
            sender_id: sender_id.into(),
            timestamp: unix_millis(),
            payload,
        }
    }

    /// Create a message with a JSON-encoded payload.
    pub fn with_payload<T: Serialize>(
        message_type: MessageType,
        sender_id: impl Into<String>,
        payload: &T,
    ) -> Result<Self, CodecError> {
        let bytes = serde_json::to_vec(payload).map_err(CodecError::payload)?;
        Ok(Self::new(message_type, sender_id, bytes))
    }

    /// Movement message.
    pub fn movement(sender_id: impl Into<String>, sample: &MovementSample) -> Result<Self, CodecError> {
        Self::with_payload(MessageType::Movement, sender_id, sample)
    }

    /// Server-synthesized disconnect notice for `session_id`.
    pub fn disconnect(session_id: &SessionId) -> Self {
        Self::new(MessageType::Disconnect, session_id.to_string(), Vec::new())
    }

    /// Decode the payload as JSON.
    pub fn decode_payload<T: DeserializeOwned>(&self) -> Result<T, CodecError> {
        serde_json::from_slice(&self.payload).map_err(CodecError::payload)
    }

    /// Parse the sender as a session id, if it is one.
    pub fn sender_session(&self) -> Option<SessionId> {
        self.sender_id.parse().ok()
    }
}

// =============================================================================
// PAYLOADS
// =============================================================================

/// Movement state of one participant.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct MovementSample {
    /// World position.
    pub position: Vec3,
    /// Orientation.
    pub rotation: Quat,
    /// Velocity (units per second).
    pub velocity: Vec3,
    /// Standing on ground.
    #[serde(default)]
    pub grounded: bool,
    /// Server correction of a rejected movement.
    #[serde(default)]
    pub correction: bool,
    /// Input sequence this sample results from (0 = unsequenced).
    #[serde(default)]
    pub sequence: u32,
}

impl MovementSample {
    /// Sample at `position` with identity rotation and no velocity.
    pub fn at(position: Vec3) -> Self {
        Self {
            position,
            ..Default::default()
        }
    }

    /// True if position, rotation and velocity are all finite.
    pub fn is_finite(&self) -> bool {
        self.position.is_finite() && self.rotation.is_finite() && self.velocity.is_finite()
    }
}

/// One participant in a world snapshot or welcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerState {
    /// Session identifier.
    pub session_id: SessionId,
    /// Last accepted position.
    pub position: Vec3,
    /// Last accepted rotation.
    pub rotation: Quat,
    /// Last accepted velocity.
    #[serde(default)]
    pub velocity: Vec3,
    /// Mirrored health.
    pub health: f32,
    /// Mirrored mana.
    pub mana: f32,
}

/// Snapshot of every registered session.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct WorldStatePayload {
    /// Server tick that produced the snapshot.
    pub tick: u64,
    /// Participants, ordered by session id.
    pub players: Vec<PlayerState>,
}

/// Welcome sent to a newly connected session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WelcomePayload {
    /// The receiver's session id.
    pub your_session_id: SessionId,
    /// Session of the hosting participant, if hosted.
    pub host_session_id: Option<SessionId>,
    /// Everyone registered at join time, including the receiver.
    pub current_players: Vec<PlayerState>,
}

/// Resource values the core mirrors into snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ResourceUpdatePayload {
    /// New health, if changed.
    #[serde(default)]
    pub health: Option<f32>,
    /// New mana, if changed.
    #[serde(default)]
    pub mana: Option<f32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_json_roundtrip() {
        let sample = MovementSample {
            position: Vec3::new(1.0, 2.0, 3.0),
            rotation: Quat::from_yaw(0.5),
            velocity: Vec3::new(0.0, 0.0, 4.0),
            grounded: true,
            correction: false,
            sequence: 42,
        };
        let msg = NetworkMessage::movement("abc", &sample).unwrap();

        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"movement\""));
        let parsed: NetworkMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, msg);

        let decoded: MovementSample = parsed.decode_payload().unwrap();
        assert_eq!(decoded, sample);
    }

    #[test]
    fn test_movement_optional_fields_default() {
        let json = r#"{
            "position": {"x": 1.0, "y": 0.0, "z": 0.0},
            "rotation": {"x": 0.0, "y": 0.0, "z": 0.0, "w": 1.0},
            "velocity": {"x": 0.0, "y": 0.0, "z": 0.0}
        }"#;
        let sample: MovementSample = serde_json::from_str(json).unwrap();
        assert!(!sample.correction);
        assert!(!sample.grounded);
        assert_eq!(sample.sequence, 0);
    }

    #[test]
    fn test_bad_payload_is_error() {
        let msg = NetworkMessage::new(MessageType::Movement, "x", b"not json".to_vec());
        assert!(msg.decode_payload::<MovementSample>().is_err());
    }

    #[test]
    fn test_server_only_types() {
        assert!(MessageType::Connect.is_server_only());
        assert!(MessageType::WorldState.is_server_only());
        assert!(MessageType::PlayerSpawn.is_server_only());
        assert!(!MessageType::Movement.is_server_only());
        assert!(!MessageType::Chat.is_server_only());
    }

    #[test]
    fn test_sender_session_parse() {
        let id = SessionId::new_random();
        let msg = NetworkMessage::disconnect(&id);
        assert_eq!(msg.sender_session(), Some(id));

        let bogus = NetworkMessage::new(MessageType::Chat, "not-a-uuid", Vec::new());
        assert_eq!(bogus.sender_session(), None);
    }
}
