//! Core primitives.
//!
//! Randomness and the crash/multiplier model. Nothing here touches the
//! clock or the network; callers pass elapsed time in explicitly.

pub mod crash;
pub mod rng;

// Re-export core types
pub use crash::{CrashModel, MIN_MULTIPLIER};
pub use rng::{derive_round_seed, DeterministicRng};
