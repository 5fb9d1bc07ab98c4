//! Client-side prediction.
//!
//! Pure, synchronous building blocks used by the client agent: the input
//! ring buffer and kinematic step, correction replay, and remote peer
//! interpolation.

pub mod input;
pub mod interpolation;
pub mod reconcile;

pub use input::{simulate_step, InputCommand, InputRingBuffer, PredictedInput};
pub use interpolation::RemotePeer;
pub use reconcile::{reconcile, Reconciliation};
