//! Game Orchestration Logic
//!
//! Session state machines. Everything here is synchronous and takes the
//! current time explicitly; the network layer owns the clock and the sockets.
//!
//! ## Module Structure
//!
//! - `state`: identifiers, presence status, results
//! - `events`: outbound events, timer keys, the per-command outbox
//! - `garbage`: attack distribution with exact fractional carry
//! - `lobby`: battle-royale lobby (waiting → countdown → active → resolving)
//! - `contest`: 1v1 / 2v2 best-of sets

use std::time::Instant;

pub mod state;
pub mod events;
pub mod garbage;
pub mod lobby;
pub mod contest;

use crate::core::{SeedAllocator, TimerQueue};

// Re-export key types
pub use state::{ParticipantId, SessionId, Status, LobbyMode, QueueMode, MatchStats, MatchResult};
pub use events::{GameEvent, Notice, Outbox, Recipients, Settlement, TimerKey};
pub use garbage::{AttackMode, GarbageConfig, GarbageLedger};
pub use lobby::{Lobby, LobbyConfig, LobbyPhase};
pub use contest::{Contest, ContestConfig};

/// Mutable services a state machine may touch while handling one command.
pub struct Ctx<'a> {
    /// Monotonic time of the command.
    pub now: Instant,
    /// Wall-clock time of the command (unix ms), for client-facing deadlines.
    pub wall_ms: u64,
    /// Shared timer queue.
    pub timers: &'a mut TimerQueue<TimerKey>,
    /// Seed source for new rounds.
    pub seeds: &'a mut SeedAllocator,
    /// Fractional garbage carries.
    pub garbage: &'a mut GarbageLedger,
    /// Collected side effects.
    pub out: &'a mut Outbox,
}

/// Owned backing store for a [`Ctx`], used by unit tests.
#[cfg(test)]
pub(crate) struct TestWorld {
    pub now: Instant,
    pub timers: TimerQueue<TimerKey>,
    pub seeds: SeedAllocator,
    pub garbage: GarbageLedger,
    pub out: Outbox,
}

#[cfg(test)]
impl TestWorld {
    pub fn new() -> Self {
        Self {
            now: Instant::now(),
            timers: TimerQueue::new(),
            seeds: SeedAllocator::with_seed(42),
            garbage: GarbageLedger::new(GarbageConfig::default()),
            out: Outbox::default(),
        }
    }

    pub fn ctx(&mut self) -> Ctx<'_> {
        Ctx {
            now: self.now,
            wall_ms: 0,
            timers: &mut self.timers,
            seeds: &mut self.seeds,
            garbage: &mut self.garbage,
            out: &mut self.out,
        }
    }

    pub fn advance(&mut self, by: std::time::Duration) {
        self.now += by;
    }

    /// Take the collected outbox, leaving an empty one.
    pub fn drain(&mut self) -> Outbox {
        std::mem::take(&mut self.out)
    }
}
