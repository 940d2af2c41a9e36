//! Game Events
//!
//! Everything a session state machine wants to happen outside itself:
//! lifecycle events addressed to participants, forced disconnects, results to
//! persist and participants released back to idle. The coordinator drains an
//! [`Outbox`] after every command and applies it.

use serde::{Serialize, Deserialize};

use crate::game::state::{LobbyMode, MatchResult, ParticipantId, QueueMode, SessionId};

/// A member as listed in rosters.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RosterEntry {
    /// Connection-scoped id.
    pub id: ParticipantId,
    /// Display name.
    pub name: String,
}

/// Environmental reasons for an elimination with no recent attacker.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EliminationCause {
    /// Topped out on their own.
    Gravity,
    /// Sent no board update for too long.
    Inactivity,
    /// Connection dropped or left mid-round.
    Disconnect,
    /// Pulled into another session mid-round.
    Forfeit,
}

/// Who gets credit for an elimination.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum KillCredit {
    /// The attacker with the largest recent contribution.
    Attacker {
        /// Attacker display name.
        name: String,
    },
    /// No recent attacker.
    Environment {
        /// What finished the participant off.
        cause: EliminationCause,
    },
}

/// Why a best-of set ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SetEndReason {
    /// A side reached the win threshold with the required lead.
    Normal,
    /// A member disconnected or left.
    Forfeit,
}

/// Lifecycle events pushed to clients.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum GameEvent {
    /// Lobby membership changed.
    LobbyUpdate {
        /// Lobby variant.
        mode: LobbyMode,
        /// Members, observers included.
        count: usize,
    },

    /// Countdown started; the round goes live at `starts_at_ms` (unix ms).
    Countdown {
        /// Lobby variant.
        mode: LobbyMode,
        /// Countdown length.
        seconds: u32,
        /// Wall-clock start of the round.
        starts_at_ms: u64,
    },

    /// Round is live. Every member simulates from `seed`.
    MatchStart {
        /// Lobby variant.
        mode: LobbyMode,
        /// Shared piece seed.
        seed: u32,
        /// Members playing this round.
        players: Vec<RosterEntry>,
    },

    /// Sent to a participant joining a live round as an observer.
    Spectate {
        /// Lobby variant.
        mode: LobbyMode,
        /// Seed of the running round.
        seed: u32,
        /// Members still alive.
        players: Vec<RosterEntry>,
    },

    /// A lobby member is out.
    Elimination {
        /// Lobby variant.
        mode: LobbyMode,
        /// Eliminated member.
        id: ParticipantId,
        /// Their display name.
        name: String,
        /// Who finished them off.
        killer: KillCredit,
    },

    /// Sent to the last survivor: report final stats.
    RequestWinStats {
        /// Lobby variant.
        mode: LobbyMode,
    },

    /// Ranked results of the finished round.
    MatchSummary {
        /// Lobby variant.
        mode: LobbyMode,
        /// Results, best place first.
        results: Vec<MatchResult>,
    },

    /// Lobby went back to waiting.
    LobbyReset {
        /// Lobby variant.
        mode: LobbyMode,
    },

    /// Whole garbage lines for the recipient's board.
    ReceiveAttack {
        /// Lines to add.
        amount: u32,
    },

    /// Another member's board snapshot.
    BoardUpdate {
        /// Board owner.
        id: ParticipantId,
        /// Opaque grid as sent by the client.
        grid: serde_json::Value,
        /// Stack height.
        height: u32,
    },

    /// A contest round begins.
    RoundStart {
        /// Contest id.
        session: SessionId,
        /// Duel or team.
        kind: QueueMode,
        /// 1-based round number.
        round: u32,
        /// Shared piece seed for this round.
        seed: u32,
        /// Rounds won per side.
        scores: [u32; 2],
        /// Both sides' rosters.
        sides: [Vec<RosterEntry>; 2],
    },

    /// A contest round concluded.
    RoundResult {
        /// Contest id.
        session: SessionId,
        /// Round that ended.
        round: u32,
        /// Index of the side that lost it.
        loser_side: usize,
        /// Rounds won per side.
        scores: [u32; 2],
    },

    /// The set is over.
    SetEnd {
        /// Contest id.
        session: SessionId,
        /// Winning side display names.
        winners: Vec<String>,
        /// Losing side display names.
        losers: Vec<String>,
        /// Final rounds won per side.
        scores: [u32; 2],
        /// Normal win or forfeit.
        reason: SetEndReason,
    },
}

/// Who receives a [`GameEvent`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Recipients {
    /// A single participant.
    One(ParticipantId),
    /// An explicit list.
    Many(Vec<ParticipantId>),
}

/// An addressed event.
#[derive(Clone, Debug, PartialEq)]
pub struct Notice {
    /// Addressees.
    pub to: Recipients,
    /// Payload.
    pub event: GameEvent,
}

/// Result set to persist through the account store.
#[derive(Clone, Debug, PartialEq)]
pub enum Settlement {
    /// A resolved lobby round.
    Lobby {
        /// Lobby variant.
        mode: LobbyMode,
        /// Ranked results, one per participant alive at round start.
        results: Vec<MatchResult>,
    },
    /// A finished duel / team set.
    Contest {
        /// Contest shape.
        kind: QueueMode,
        /// Winning side display names.
        winners: Vec<String>,
        /// Losing side display names.
        losers: Vec<String>,
        /// Final score, winner first.
        score: (u32, u32),
        /// Normal win or forfeit.
        reason: SetEndReason,
    },
}

/// Delayed actions. Each is owned by exactly one object.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TimerKey {
    /// Countdown expiry, lobby goes live.
    LobbyCountdown(LobbyMode),
    /// The sole survivor did not report in time.
    LobbyWinReport(LobbyMode),
    /// Late reports have had their chance; rank and persist.
    LobbySettle(LobbyMode),
    /// Post-summary cooldown is over.
    LobbyReset(LobbyMode),
    /// Gap between contest rounds is over.
    ContestRound(SessionId),
    /// Pending invitation from this sender expires.
    ChallengeExpiry(ParticipantId),
    /// Queue entry (duel participant or team leader) went stale.
    QueueExpiry(ParticipantId),
}

/// Side effects collected while handling one command.
#[derive(Debug, Default)]
pub struct Outbox {
    /// Events to deliver.
    pub notices: Vec<Notice>,
    /// Participants to disconnect, with a reason.
    pub kicks: Vec<(ParticipantId, String)>,
    /// Results to persist.
    pub settlements: Vec<Settlement>,
    /// Participants whose session ended; they return to idle.
    pub released: Vec<ParticipantId>,
}

impl Outbox {
    /// Address an event to one participant.
    pub fn send(&mut self, to: ParticipantId, event: GameEvent) {
        self.notices.push(Notice { to: Recipients::One(to), event });
    }

    /// Address an event to several participants. Empty lists are dropped.
    pub fn send_many(&mut self, to: Vec<ParticipantId>, event: GameEvent) {
        if !to.is_empty() {
            self.notices.push(Notice { to: Recipients::Many(to), event });
        }
    }

    /// Events addressed (directly or in a list) to `id`.
    pub fn events_for(&self, id: ParticipantId) -> Vec<&GameEvent> {
        self.notices
            .iter()
            .filter(|n| match &n.to {
                Recipients::One(one) => *one == id,
                Recipients::Many(many) => many.contains(&id),
            })
            .map(|n| &n.event)
            .collect()
    }

    /// True when nothing needs to be applied.
    pub fn is_empty(&self) -> bool {
        self.notices.is_empty()
            && self.kicks.is_empty()
            && self.settlements.is_empty()
            && self.released.is_empty()
    }
}
