//! Predicted Inputs
//!
//! Local inputs are applied immediately and kept in a bounded ring buffer,
//! tagged with a per-connection sequence number, until the server either
//! confirms them or corrects the state they produced.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::core::math::{Quat, Vec3};
use crate::core::time::unix_millis;
use crate::network::protocol::MovementSample;

/// Default ring buffer capacity.
pub const DEFAULT_BUFFER_SIZE: usize = 32;

// =============================================================================
// INPUT TYPES
// =============================================================================

/// One frame of local input from a movement controller.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct InputCommand {
    /// Desired velocity (units per second).
    pub movement: Vec3,
    /// Facing.
    pub rotation: Quat,
    /// Jump pressed this frame.
    pub jump: bool,
}

impl InputCommand {
    /// Move with `movement`, keep identity facing.
    pub fn moving(movement: Vec3) -> Self {
        Self {
            movement,
            ..Default::default()
        }
    }
}

/// A buffered input awaiting server confirmation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PredictedInput {
    /// Strictly increasing per connection, starting at 1.
    pub sequence: u32,
    /// Desired velocity.
    pub movement: Vec3,
    /// Facing.
    pub rotation: Quat,
    /// Jump flag.
    pub jump: bool,
    /// Step duration in seconds, reused on replay.
    pub dt: f32,
    /// Local Unix milliseconds when applied.
    pub timestamp: i64,
}

// =============================================================================
// RING BUFFER
// =============================================================================

/// Bounded FIFO of [`PredictedInput`]; the oldest entry is evicted first.
#[derive(Debug, Clone)]
pub struct InputRingBuffer {
    entries: VecDeque<PredictedInput>,
    capacity: usize,
    last_sequence: u32,
}

impl InputRingBuffer {
    /// Empty buffer holding at most `capacity` inputs (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
            last_sequence: 0,
        }
    }

    /// Assign the next sequence number to `command` and buffer it.
    pub fn record(&mut self, command: InputCommand, dt: f32) -> PredictedInput {
        self.last_sequence = self.last_sequence.wrapping_add(1).max(1);
        let input = PredictedInput {
            sequence: self.last_sequence,
            movement: command.movement,
            rotation: command.rotation,
            jump: command.jump,
            dt,
            timestamp: unix_millis(),
        };

        if self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(input);
        input
    }

    /// Drop inputs the server has accounted for (sequence <= `sequence`).
    pub fn discard_up_to(&mut self, sequence: u32) {
        while self.entries.front().is_some_and(|e| e.sequence <= sequence) {
            self.entries.pop_front();
        }
    }

    /// Inputs newer than `sequence`, oldest first.
    pub fn entries_after(&self, sequence: u32) -> impl Iterator<Item = &PredictedInput> {
        self.entries.iter().filter(move |e| e.sequence > sequence)
    }

    /// Sequence of the most recently recorded input (0 if none yet).
    pub fn last_sequence(&self) -> u32 {
        self.last_sequence
    }

    /// Forget buffered inputs. Sequence numbering continues.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Forget everything, including the sequence counter (new connection).
    pub fn reset(&mut self) {
        self.entries.clear();
        self.last_sequence = 0;
    }

    /// Buffered inputs.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Maximum buffered inputs.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for InputRingBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_SIZE)
    }
}

// =============================================================================
// SIMULATION
// =============================================================================

/// Apply one input to a movement state.
///
/// Kinematic step: velocity becomes the input's movement, position advances
/// by `velocity * dt`. Shared by optimistic execution and replay so both
/// produce identical results.
pub fn simulate_step(state: &MovementSample, input: &PredictedInput) -> MovementSample {
    let velocity = input.movement;
    MovementSample {
        position: state.position + velocity * input.dt,
        rotation: input.rotation,
        velocity,
        grounded: !input.jump,
        correction: false,
        sequence: input.sequence,
    }
}
