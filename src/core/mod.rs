//! Core primitives.
//!
//! Small, runtime-free building blocks shared by every session type:
//! exact garbage arithmetic, seed allocation and cancellable timers.

pub mod fixed;
pub mod rng;
pub mod timer;

// Re-export core types
pub use fixed::{Fixed, FIXED_ONE, FIXED_SCALE};
pub use rng::{DeterministicRng, SeedAllocator};
pub use timer::{TimerHandle, TimerQueue};
