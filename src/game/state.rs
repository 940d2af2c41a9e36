//! Participant and Session State Definitions
//!
//! Identity, presence status and result types shared by lobbies, contests and
//! the network layer.

use std::fmt;

use serde::{Serialize, Deserialize};
use uuid::Uuid;

// =============================================================================
// IDENTIFIERS
// =============================================================================

/// Connection-scoped participant identifier.
///
/// Reassigned on every connection; the durable identity is the display name.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(pub Uuid);

impl ParticipantId {
    /// Fresh random identifier.
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from raw bytes.
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// Parse from a UUID string.
    pub fn from_uuid_str(s: &str) -> Option<Self> {
        Uuid::parse_str(s).ok().map(Self)
    }

    /// Get raw bytes.
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    /// Short hex prefix for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.as_bytes()[..4])
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Duel / team contest identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub Uuid);

impl SessionId {
    /// Fresh random identifier.
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    /// Short hex prefix for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0.as_bytes()[..4])
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// MODES & STATUS
// =============================================================================

/// Battle-royale lobby variants. One lobby instance exists per variant.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LobbyMode {
    /// Plain free-for-all.
    #[default]
    Standard,
    /// Free-for-all with client-side rule mutators enabled.
    Mutator,
}

impl LobbyMode {
    /// Every lobby variant.
    pub const ALL: [LobbyMode; 2] = [LobbyMode::Standard, LobbyMode::Mutator];
}

/// Queue-matched contest shapes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueMode {
    /// 1v1 best-of-set.
    #[default]
    Duel,
    /// 2v2 best-of-set.
    Team,
}

/// What a participant is doing right now. Exactly one value at a time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", content = "ref", rename_all = "snake_case")]
pub enum Status {
    /// Authenticated, not in any queue or session.
    #[default]
    Idle,
    /// Waiting in a matchmaking queue.
    Queuing(QueueMode),
    /// Member (player or observer) of a battle lobby.
    Lobby(LobbyMode),
    /// In a 1v1 contest.
    Duel(SessionId),
    /// In a 2v2 contest.
    Team(SessionId),
}

impl Status {
    /// True for anything but idle.
    pub fn is_busy(&self) -> bool {
        !matches!(self, Status::Idle)
    }

    /// Contest id, if in a duel or team contest.
    pub fn contest(&self) -> Option<SessionId> {
        match self {
            Status::Duel(id) | Status::Team(id) => Some(*id),
            _ => None,
        }
    }
}

// =============================================================================
// RESULTS
// =============================================================================

/// Self-reported end-of-match metrics. The server never verifies them.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchStats {
    /// Attack lines per minute.
    pub apm: u32,
    /// Pieces per second.
    pub pps: f64,
    /// Garbage lines sent.
    pub sent: u32,
    /// Garbage lines received.
    #[serde(alias = "recv")]
    pub received: u32,
    /// Longest combo.
    #[serde(alias = "maxCombo")]
    pub max_combo: u32,
}

/// One participant's placement in a finished lobby round.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    /// Durable identity.
    pub display_name: String,
    /// Last survivor.
    pub is_winner: bool,
    /// 1-based place.
    pub place: u32,
    /// Time from match start to elimination (or resolution for the winner).
    pub survival_ms: u64,
    /// Self-reported stats (zeroed when none arrived).
    pub stats: MatchStats,
}
