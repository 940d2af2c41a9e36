//! # Blockfall Server
//!
//! Match orchestration for a multiplayer falling-block game. Clients run the
//! board simulation themselves; the server pairs them up, hands out shared
//! seeds, routes garbage between boards, keeps lobby and set bookkeeping
//! consistent and persists results.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    BLOCKFALL SERVER                          │
//! ├─────────────────────────────────────────────────────────────┤
//! │  core/           - Runtime-free primitives                   │
//! │  ├── fixed.rs    - Q16.16 fixed-point garbage units          │
//! │  ├── rng.rs      - Xorshift128+ PRNG and seed allocation     │
//! │  └── timer.rs    - Cancellable timer queue                   │
//! │                                                              │
//! │  game/           - Session state machines (synchronous)      │
//! │  ├── state.rs    - Ids, presence status, results             │
//! │  ├── events.rs   - Outbound events, timer keys, outbox       │
//! │  ├── garbage.rs  - Attack distribution with exact carry      │
//! │  ├── lobby.rs    - Battle-royale lobby                       │
//! │  └── contest.rs  - 1v1 / 2v2 best-of sets                    │
//! │                                                              │
//! │  network/        - Connections and cross-session state       │
//! │  ├── server.rs   - WebSocket transport, tickers              │
//! │  ├── coordinator.rs - Command dispatch, eviction             │
//! │  ├── presence.rs, matchmaking.rs, challenge.rs               │
//! │  ├── session.rs  - Live contest registry                     │
//! │  └── watchdog.rs - Periodic consistency sweep                │
//! │                                                              │
//! │  store/          - Account records (memory / JSON file)      │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Ownership
//!
//! All mutable orchestration state belongs to one [`network::Coordinator`]
//! running in a single dispatcher task. Connections talk to it through a
//! command channel, so no session object is ever shared or locked.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod core;
pub mod game;
pub mod network;
pub mod store;

// Re-export commonly used types
pub use core::fixed::{Fixed, FIXED_ONE, FIXED_SCALE};
pub use core::rng::{DeterministicRng, SeedAllocator};
pub use core::timer::{TimerHandle, TimerQueue};
pub use game::state::{ParticipantId, SessionId, Status, LobbyMode, QueueMode};
pub use network::{Coordinator, GameServer, ServerConfig};
pub use store::{AccountStore, JsonFileStore, MemoryStore};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
