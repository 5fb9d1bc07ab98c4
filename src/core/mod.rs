//! Core primitives shared by server and client.

pub mod math;
pub mod time;

// Re-export core types
pub use math::{Quat, Vec3};
pub use time::unix_millis;
