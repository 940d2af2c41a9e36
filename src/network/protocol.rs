//! Protocol Messages
//!
//! Wire format for client-server communication over WebSocket.
//! Every message is a JSON object tagged by `type`.

use serde::{Serialize, Deserialize};

use crate::game::events::GameEvent;
use crate::game::garbage::AttackMode;
use crate::game::state::{LobbyMode, MatchStats, ParticipantId, QueueMode, SessionId, Status};
use crate::store::{LeaderboardEntry, PublicRecord};

// =============================================================================
// CLIENT -> SERVER MESSAGES
// =============================================================================

/// Messages sent from client to server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Log in with a display name and secret. Unknown names are registered.
    Authenticate {
        /// Display name.
        name: String,
        /// Account secret.
        secret: String,
    },

    /// Log in with a token from an external provider.
    AuthenticateToken {
        /// Signed token.
        token: String,
    },

    /// Join a battle lobby.
    JoinLobby {
        /// Lobby variant.
        #[serde(default)]
        mode: LobbyMode,
    },

    /// Enter a matchmaking queue alone.
    JoinQueue {
        /// Duel or team queue.
        mode: QueueMode,
    },

    /// Leave whatever queue or session we are in.
    Leave,

    /// Invite another participant to a duel, or to team up.
    Challenge {
        /// Invited participant.
        target: ParticipantId,
        /// Duel now, or team up for the team queue.
        #[serde(default)]
        kind: QueueMode,
    },

    /// Accept the invitation sent by `from`.
    Accept {
        /// Inviting participant.
        from: ParticipantId,
    },

    /// Decline the invitation sent by `from`.
    Decline {
        /// Inviting participant.
        from: ParticipantId,
    },

    /// Board snapshot, relayed to opponents.
    ReportBoard {
        /// Opaque grid.
        grid: serde_json::Value,
        /// Stack height.
        #[serde(default)]
        height: u32,
    },

    /// Outgoing garbage.
    SendAttack {
        /// Lines sent.
        amount: u32,
        /// Targeting.
        #[serde(default)]
        mode: AttackMode,
    },

    /// Topped out in a lobby round.
    ReportElimination {
        /// Round stats.
        #[serde(default)]
        stats: MatchStats,
    },

    /// Last one standing in a lobby round.
    ReportWin {
        /// Round stats.
        #[serde(default)]
        stats: MatchStats,
    },

    /// Topped out in a duel or team round.
    ReportRoundLoss {
        /// Round the loss belongs to, if known.
        #[serde(default)]
        round: Option<u32>,
        /// Round stats.
        #[serde(default)]
        stats: MatchStats,
    },

    /// Every account's public record.
    RequestStats,

    /// Practice-mode APM.
    SubmitApm {
        /// Attack lines per minute.
        value: u32,
    },

    /// Authenticated participants and their status.
    ListOnline,

    /// Ping for latency measurement.
    Ping {
        /// Client clock, echoed back.
        timestamp: u64,
    },
}

// =============================================================================
// SERVER -> CLIENT MESSAGES
// =============================================================================

/// Messages sent from server to client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Authentication result.
    AuthResult(AuthResult),

    /// Lobby or contest lifecycle event.
    Event(GameEvent),

    /// Entered a matchmaking queue.
    QueueJoined {
        /// Queue entered.
        mode: QueueMode,
        /// 1-based position.
        position: usize,
    },

    /// Paired; a contest is starting.
    QueueMatched {
        /// Contest shape.
        mode: QueueMode,
        /// New contest id.
        session: SessionId,
        /// Our side, excluding us.
        teammates: Vec<String>,
        /// The other side.
        opponents: Vec<String>,
    },

    /// Removed from a queue without being paired.
    QueueCancelled {
        /// Queue left.
        mode: QueueMode,
        /// Why.
        reason: String,
    },

    /// Invitation registered.
    ChallengeSent {
        /// Invited participant.
        to: ParticipantId,
        /// Duel or team.
        kind: QueueMode,
    },

    /// Someone invited us.
    ChallengeReceived {
        /// Inviting participant.
        from: ParticipantId,
        /// Their display name.
        from_name: String,
        /// Duel or team.
        kind: QueueMode,
        /// Seconds until the invitation lapses.
        expires_in_secs: u64,
    },

    /// An invitation timed out. Sent to both sides.
    ChallengeExpired {
        /// Inviting participant.
        from: ParticipantId,
        /// Invited participant.
        to: ParticipantId,
    },

    /// Our invitation was declined.
    ChallengeDeclined {
        /// Declining participant.
        by: ParticipantId,
        /// Their display name.
        by_name: String,
    },

    /// Current leaderboards.
    LeaderboardUpdate {
        /// Top accounts by wins.
        wins: Vec<LeaderboardEntry>,
        /// Top accounts by best combo.
        combos: Vec<LeaderboardEntry>,
    },

    /// Reply to `request_stats`.
    AllStats {
        /// Every account.
        accounts: Vec<PublicRecord>,
    },

    /// Practice APM beat the stored best.
    BestApmUpdated {
        /// New best.
        best_apm: u32,
    },

    /// Win counter after a resolution.
    WinsUpdated {
        /// Total wins.
        wins: u32,
    },

    /// Reply to `list_online`.
    Online {
        /// Authenticated participants.
        players: Vec<OnlineEntry>,
    },

    /// Forced disconnect; a close frame follows.
    Kicked {
        /// Why.
        reason: String,
    },

    /// Error message.
    Error(ServerError),

    /// Pong response.
    Pong {
        /// Echoed client clock.
        timestamp: u64,
        /// Server clock (unix ms).
        server_time: u64,
    },

    /// Server is shutting down.
    Shutdown {
        /// Why.
        reason: String,
    },
}

/// Authentication result.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthResult {
    /// Whether auth succeeded.
    pub success: bool,
    /// Connection-scoped id if successful.
    pub id: Option<ParticipantId>,
    /// Normalized display name if successful.
    pub name: Option<String>,
    /// Stored win counter.
    pub wins: u32,
    /// Stored best APM.
    pub best_apm: u32,
    /// Error message if failed.
    pub error: Option<String>,
    /// Server version.
    pub server_version: String,
}

/// One row of `list_online`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnlineEntry {
    /// Connection-scoped id, usable as a challenge target.
    pub id: ParticipantId,
    /// Display name.
    pub name: String,
    /// What they are doing.
    pub status: Status,
}

/// Server error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerError {
    /// Error code.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
}

/// Error codes. Only business-level failures are reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Wrong secret, bad name or rejected token.
    AuthFailed,
    /// Action requires authentication.
    NotAuthenticated,
    /// This display name is already logged in elsewhere.
    AlreadyOnline,
    /// The sender already has an outstanding invitation.
    InvitationPending,
    /// Invitation target is offline, busy or ourselves.
    TargetUnavailable,
    /// Malformed message.
    InvalidInput,
    /// Server at its connection limit.
    ServerOverloaded,
    /// Internal error.
    InternalError,
}

// =============================================================================
// SERIALIZATION HELPERS
// =============================================================================

impl ClientMessage {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

impl ServerMessage {
    /// Build an error reply.
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        ServerMessage::Error(ServerError { code, message: message.into() })
    }

    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}
