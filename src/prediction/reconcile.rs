//! Reconciliation
//!
//! When the server corrects this client's movement, the corrected sample
//! becomes the new baseline. In [`ReconciliationMode::Replay`] every
//! buffered input newer than the correction's sequence is re-applied on top
//! of it; in [`ReconciliationMode::SnapOnly`] the client simply snaps and
//! discards pending inputs.

use crate::config::ReconciliationMode;
use crate::network::protocol::MovementSample;
use crate::prediction::input::{simulate_step, InputRingBuffer};

/// Result of applying a server correction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reconciliation {
    /// New predicted state.
    pub state: MovementSample,
    /// Inputs re-applied on top of the correction.
    pub replayed: usize,
    /// Distance between the old prediction and the new one.
    pub error: f32,
}

/// Rebuild the predicted state from a server correction.
pub fn reconcile(
    predicted: &MovementSample,
    correction: &MovementSample,
    buffer: &mut InputRingBuffer,
    mode: ReconciliationMode,
) -> Reconciliation {
    let mut state = MovementSample {
        correction: false,
        ..*correction
    };
    let mut replayed = 0;

    match mode {
        ReconciliationMode::Replay => {
            buffer.discard_up_to(correction.sequence);
            for input in buffer.entries_after(correction.sequence) {
                state = simulate_step(&state, input);
                replayed += 1;
            }
        }
        ReconciliationMode::SnapOnly => {
            buffer.clear();
        }
    }

    Reconciliation {
        state,
        replayed,
        error: predicted.position.distance(state.position),
    }
}
