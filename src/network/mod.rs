//! Network Layer
//!
//! Everything that touches connections, identity or cross-session state:
//! the WebSocket transport, the wire protocol and the coordinator that owns
//! presence, queues, invitations and live contests.
//! Session rules themselves live in `game/`.

pub mod auth;
pub mod protocol;
pub mod presence;
pub mod matchmaking;
pub mod challenge;
pub mod session;
pub mod coordinator;
pub mod watchdog;
pub mod server;

pub use auth::{AuthConfig, TokenClaims, AuthError, validate_token};
pub use protocol::{ClientMessage, ServerMessage, ErrorCode, AuthResult, OnlineEntry};
pub use presence::{PresenceRegistry, PresenceError};
pub use matchmaking::{MatchmakingQueues, QueueConfig};
pub use challenge::{ChallengeBroker, ChallengeConfig, ChallengeError};
pub use session::SessionManager;
pub use coordinator::{Command, Coordinator, CoordinatorConfig, Outbound};
pub use watchdog::SweepReport;
pub use server::{GameServer, ServerConfig, GameServerError};
