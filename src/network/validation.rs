//! Movement Validation
//!
//! Decides whether a client-reported position is reachable from the last
//! accepted one:
//!
//! ```text
//! max_allowed = max_speed * elapsed + teleport_tolerance
//! accept iff distance(reported, last) <= max_allowed
//! ```
//!
//! Rejection is a normal outcome. The dispatcher answers it with a
//! correction, never with a disconnect.

use std::time::Duration;

use crate::config::SyncConfig;
use crate::network::protocol::MovementSample;

/// Speed limits applied to reported movement.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MovementRules {
    /// Units per second.
    pub max_speed: f32,
    /// Flat allowance on top of the speed budget.
    pub teleport_tolerance: f32,
}

impl MovementRules {
    /// Rules from configuration.
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            max_speed: config.max_speed,
            teleport_tolerance: config.teleport_tolerance,
        }
    }

    /// Largest distance reachable in `elapsed`.
    pub fn max_distance(&self, elapsed: Duration) -> f32 {
        self.max_speed * elapsed.as_secs_f32() + self.teleport_tolerance
    }
}

impl Default for MovementRules {
    fn default() -> Self {
        Self::from_config(&SyncConfig::default())
    }
}

/// Outcome of validating one movement sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MovementVerdict {
    /// Reported position becomes authoritative.
    Accepted {
        /// Distance travelled.
        distance: f32,
    },
    /// Moved further than allowed.
    TooFar {
        /// Distance travelled.
        distance: f32,
        /// Budget for the elapsed time.
        max_allowed: f32,
    },
    /// Position, rotation or velocity has NaN or infinite components.
    NonFinite,
}

impl MovementVerdict {
    /// True for [`MovementVerdict::Accepted`].
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted { .. })
    }
}

/// Validate `reported` against the last accepted sample.
pub fn validate_movement(
    last: &MovementSample,
    reported: &MovementSample,
    elapsed: Duration,
    rules: &MovementRules,
) -> MovementVerdict {
    if !reported.is_finite() {
        return MovementVerdict::NonFinite;
    }

    let distance = reported.position.distance(last.position);
    let max_allowed = rules.max_distance(elapsed);

    if distance > max_allowed {
        MovementVerdict::TooFar { distance, max_allowed }
    } else {
        MovementVerdict::Accepted { distance }
    }
}
