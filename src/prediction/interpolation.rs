//! Remote peer interpolation.
//!
//! Network updates for other participants set a target pose; the presented
//! pose chases it at a fixed rate so a presentation layer sees smooth motion
//! between snapshots.

use std::time::Instant;

use crate::core::math::{Quat, Vec3};
use crate::network::protocol::{MovementSample, PlayerState};
use crate::network::session::{SessionId, DEFAULT_VITAL};

/// Another participant as seen by this client.
#[derive(Debug, Clone, PartialEq)]
pub struct RemotePeer {
    /// Session identifier.
    pub session_id: SessionId,
    /// Latest network position.
    pub target_position: Vec3,
    /// Latest network rotation.
    pub target_rotation: Quat,
    /// Latest network velocity.
    pub velocity: Vec3,
    /// Pose for presentation.
    pub position: Vec3,
    /// Rotation for presentation.
    pub rotation: Quat,
    /// Mirrored health.
    pub health: f32,
    /// Mirrored mana.
    pub mana: f32,
    /// When the target last changed.
    pub last_update: Instant,
}

impl RemotePeer {
    /// Peer presented at `position` with no pending motion.
    pub fn new(session_id: SessionId, position: Vec3, rotation: Quat) -> Self {
        Self {
            session_id,
            target_position: position,
            target_rotation: rotation,
            velocity: Vec3::ZERO,
            position,
            rotation,
            health: DEFAULT_VITAL,
            mana: DEFAULT_VITAL,
            last_update: Instant::now(),
        }
    }

    /// Peer created from a snapshot or welcome entry.
    pub fn from_state(state: &PlayerState) -> Self {
        let mut peer = Self::new(state.session_id, state.position, state.rotation);
        peer.velocity = state.velocity;
        peer.health = state.health;
        peer.mana = state.mana;
        peer
    }

    /// New target from a relayed movement.
    pub fn apply_sample(&mut self, sample: &MovementSample) {
        self.target_position = sample.position;
        self.target_rotation = sample.rotation;
        self.velocity = sample.velocity;
        self.last_update = Instant::now();
    }

    /// New target (and vitals) from a snapshot entry.
    pub fn apply_state(&mut self, state: &PlayerState) {
        self.target_position = state.position;
        self.target_rotation = state.rotation;
        self.velocity = state.velocity;
        self.health = state.health;
        self.mana = state.mana;
        self.last_update = Instant::now();
    }

    /// Move the presented pose toward the target. `rate` is the fraction of
    /// the remaining gap closed per second.
    pub fn interpolate(&mut self, dt: f32, rate: f32) {
        let t = (dt * rate).clamp(0.0, 1.0);
        self.position = self.position.lerp(self.target_position, t);
        self.rotation = self.rotation.nlerp(self.target_rotation, t);
    }

    /// Distance still to cover.
    pub fn remaining(&self) -> f32 {
        self.position.distance(self.target_position)
    }
}
