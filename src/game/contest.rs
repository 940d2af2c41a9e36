//! Duel and Team Contests
//!
//! Round-based best-of sets between two sides of one (duel) or two (team)
//! members. A round ends on the first loss report from either side; the other
//! side scores. The set ends when a side has at least `win_score` points and
//! leads by at least `win_margin`, or when any member forfeits.

use std::time::Duration;

use tracing::{debug, info};

use crate::core::TimerHandle;
use crate::game::events::{GameEvent, RosterEntry, SetEndReason, Settlement, TimerKey};
use crate::game::state::{ParticipantId, QueueMode, SessionId};
use crate::game::Ctx;

/// Set scoring rules.
#[derive(Debug, Clone)]
pub struct ContestConfig {
    /// Minimum score to take the set.
    pub win_score: u32,
    /// Required lead over the other side.
    pub win_margin: u32,
    /// Pause between a round result and the next round start.
    pub round_gap: Duration,
}

impl Default for ContestConfig {
    fn default() -> Self {
        Self {
            win_score: 6,
            win_margin: 2,
            round_gap: Duration::from_secs(3),
        }
    }
}

impl ContestConfig {
    /// Whether `score` against `other` takes the set.
    pub fn is_set_won(&self, score: u32, other: u32) -> bool {
        score >= self.win_score && score >= other + self.win_margin
    }
}

/// A live duel or team set.
#[derive(Debug)]
pub struct Contest {
    id: SessionId,
    kind: QueueMode,
    config: ContestConfig,
    sides: [Vec<RosterEntry>; 2],
    scores: [u32; 2],
    round: u32,
    seed: u32,
    active: bool,
    /// A loss report is accepted only while the round is open.
    round_open: bool,
    round_timer: Option<TimerHandle>,
}

impl Contest {
    /// Create a contest. Call [`Contest::begin`] to start round one.
    pub fn new(id: SessionId, kind: QueueMode, sides: [Vec<RosterEntry>; 2], config: ContestConfig) -> Self {
        Self {
            id,
            kind,
            config,
            sides,
            scores: [0, 0],
            round: 0,
            seed: 0,
            active: true,
            round_open: false,
            round_timer: None,
        }
    }

    /// Contest id.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Duel or team.
    pub fn kind(&self) -> QueueMode {
        self.kind
    }

    /// Current scores, side 0 first.
    pub fn scores(&self) -> [u32; 2] {
        self.scores
    }

    /// Current round number (1-based once started).
    pub fn round(&self) -> u32 {
        self.round
    }

    /// Seed of the current round.
    pub fn seed(&self) -> u32 {
        self.seed
    }

    /// False once the set is over.
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Both sides' rosters.
    pub fn sides(&self) -> &[Vec<RosterEntry>; 2] {
        &self.sides
    }

    /// Every member id.
    pub fn member_ids(&self) -> Vec<ParticipantId> {
        self.sides.iter().flatten().map(|m| m.id).collect()
    }

    /// Which side `id` plays on.
    pub fn side_of(&self, id: ParticipantId) -> Option<usize> {
        self.sides.iter().position(|side| side.iter().any(|m| m.id == id))
    }

    fn side_ids(&self, side: usize) -> Vec<ParticipantId> {
        self.sides[side].iter().map(|m| m.id).collect()
    }

    fn side_names(&self, side: usize) -> Vec<String> {
        self.sides[side].iter().map(|m| m.name.clone()).collect()
    }

    /// Start round one.
    pub fn begin(&mut self, ctx: &mut Ctx<'_>) {
        if self.round == 0 && self.active {
            info!(
                "{:?} {} started: {:?} vs {:?}",
                self.kind,
                self.id.short(),
                self.side_names(0),
                self.side_names(1)
            );
            self.start_round(ctx);
        }
    }

    fn start_round(&mut self, ctx: &mut Ctx<'_>) {
        self.round += 1;
        self.seed = ctx.seeds.next_seed(Some(self.seed));
        self.round_open = true;

        for id in self.member_ids() {
            ctx.garbage.discard(&id);
        }

        ctx.out.send_many(self.member_ids(), GameEvent::RoundStart {
            session: self.id,
            kind: self.kind,
            round: self.round,
            seed: self.seed,
            scores: self.scores,
            sides: self.sides.clone(),
        });
    }

    /// A member topped out. The first report per round counts for the whole side.
    ///
    /// `round`, when given, must match the current round.
    pub fn report_round_loss(&mut self, ctx: &mut Ctx<'_>, id: ParticipantId, round: Option<u32>) -> bool {
        if !self.active || !self.round_open {
            debug!("round loss from {} ignored, no open round", id.short());
            return false;
        }
        if round.is_some_and(|r| r != self.round) {
            debug!("stale round loss from {} for round {:?}", id.short(), round);
            return false;
        }
        let Some(loser) = self.side_of(id) else {
            return false;
        };
        let winner = 1 - loser;

        self.round_open = false;
        self.scores[winner] += 1;
        ctx.out.send_many(self.member_ids(), GameEvent::RoundResult {
            session: self.id,
            round: self.round,
            loser_side: loser,
            scores: self.scores,
        });

        if self.config.is_set_won(self.scores[winner], self.scores[loser]) {
            self.finish(ctx, winner, SetEndReason::Normal);
        } else {
            self.round_timer = Some(ctx.timers.schedule(ctx.now + self.config.round_gap, TimerKey::ContestRound(self.id)));
        }
        true
    }

    /// A member left or disconnected: the other side wins by forfeit.
    pub fn forfeit(&mut self, ctx: &mut Ctx<'_>, id: ParticipantId) -> bool {
        if !self.active {
            return false;
        }
        let Some(side) = self.side_of(id) else {
            return false;
        };
        info!("{} forfeited {:?} {}", id.short(), self.kind, self.id.short());
        self.finish(ctx, 1 - side, SetEndReason::Forfeit);
        true
    }

    fn finish(&mut self, ctx: &mut Ctx<'_>, winner: usize, reason: SetEndReason) {
        let loser = 1 - winner;
        self.active = false;
        self.round_open = false;
        ctx.timers.disarm(&mut self.round_timer);

        let winners = self.side_names(winner);
        let losers = self.side_names(loser);
        ctx.out.send_many(self.member_ids(), GameEvent::SetEnd {
            session: self.id,
            winners: winners.clone(),
            losers: losers.clone(),
            scores: self.scores,
            reason,
        });
        ctx.out.settlements.push(Settlement::Contest {
            kind: self.kind,
            winners,
            losers,
            score: (self.scores[winner], self.scores[loser]),
            reason,
        });

        for id in self.member_ids() {
            ctx.garbage.discard(&id);
        }
        ctx.out.released.extend(self.member_ids());

        info!(
            "{:?} {} ended {}-{} ({:?})",
            self.kind,
            self.id.short(),
            self.scores[winner],
            self.scores[loser],
            reason
        );
    }

    /// Discard a contest whose members are all gone. Nothing is persisted.
    pub fn abandon(&mut self, ctx: &mut Ctx<'_>) {
        if !self.active {
            return;
        }
        self.active = false;
        self.round_open = false;
        ctx.timers.disarm(&mut self.round_timer);
        for id in self.member_ids() {
            ctx.garbage.discard(&id);
        }
        info!("{:?} {} abandoned in round {}", self.kind, self.id.short(), self.round);
    }

    /// Handle the round-gap timer. Stale handles are ignored.
    pub fn on_timer(&mut self, ctx: &mut Ctx<'_>, handle: TimerHandle) -> bool {
        if self.round_timer != Some(handle) || !self.active {
            return false;
        }
        self.round_timer = None;
        self.start_round(ctx);
        true
    }

    /// Route an attack to the opposing side. Contests have no pity rule.
    pub fn attack(&mut self, ctx: &mut Ctx<'_>, id: ParticipantId, amount: u32) -> bool {
        let amount = amount.min(ctx.garbage.config().max_attack);
        if !self.active || !self.round_open || amount == 0 {
            return false;
        }
        let Some(side) = self.side_of(id) else {
            return false;
        };
        let targets = self.side_ids(1 - side);
        for delivery in ctx.garbage.distribute(amount, &targets, false) {
            ctx.out.send(delivery.recipient, GameEvent::ReceiveAttack { amount: delivery.amount });
        }
        true
    }

    /// Relay a board snapshot to everyone else in the contest.
    pub fn report_board(&self, ctx: &mut Ctx<'_>, id: ParticipantId, grid: serde_json::Value, height: u32) -> bool {
        if !self.active || self.side_of(id).is_none() {
            return false;
        }
        let others: Vec<ParticipantId> = self.member_ids().into_iter().filter(|m| *m != id).collect();
        ctx.out.send_many(others, GameEvent::BoardUpdate { id, grid, height });
        true
    }
}
