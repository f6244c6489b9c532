//! Core primitives.
//!
//! Identifiers and the deterministic shuffle RNG shared by the game and
//! network layers.

pub mod id;
pub mod rng;

// Re-export core types
pub use id::{GameId, UserId};
pub use rng::DeterministicRng;

