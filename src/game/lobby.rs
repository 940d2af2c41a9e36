//! Battle Lobby
//!
//! Direct-join free-for-all. One instance per [`LobbyMode`].
//!
//! ```text
//!  waiting ──(2 members)──▶ countdown ──(3s)──▶ active
//!     ▲                        │                  │ (≤1 alive)
//!     │◀──(below minimum)──────┘                  ▼
//!     │                                       resolving
//!     │                                           │ (winner reported, settle delay)
//!     └───────────(reset delay)──── intermission ◀┘
//! ```
//!
//! The phase is the sole authority on whether attacks and eliminations are
//! accepted. The server never sees a board: deaths and the winner's stats are
//! self-reported, and the lobby only keeps the bookkeeping consistent.

use std::time::{Duration, Instant};

use serde::{Serialize, Deserialize};
use tracing::{debug, info};

use crate::core::fixed::{self, Fixed};
use crate::core::TimerHandle;
use crate::game::events::{EliminationCause, GameEvent, KillCredit, RosterEntry, Settlement, TimerKey};
use crate::game::garbage::AttackMode;
use crate::game::state::{LobbyMode, MatchResult, MatchStats, ParticipantId};
use crate::game::Ctx;

/// Lobby timing and thresholds.
#[derive(Debug, Clone)]
pub struct LobbyConfig {
    /// Members needed to start a countdown.
    pub min_players: usize,
    /// Countdown length.
    pub countdown: Duration,
    /// How long the sole survivor has to report final stats.
    pub win_report_timeout: Duration,
    /// Grace period for late reports before results are ranked.
    pub settle_delay: Duration,
    /// Cooldown between the summary and the next waiting phase.
    pub reset_delay: Duration,
    /// Attacks older than this earn no kill credit.
    pub kill_credit_window: Duration,
    /// Alive members silent for longer are eliminated.
    pub inactivity_timeout: Duration,
}

impl Default for LobbyConfig {
    fn default() -> Self {
        Self {
            min_players: 2,
            countdown: Duration::from_secs(3),
            win_report_timeout: Duration::from_secs(5),
            settle_delay: Duration::from_secs(1),
            reset_delay: Duration::from_secs(10),
            kill_credit_window: Duration::from_secs(15),
            inactivity_timeout: Duration::from_secs(15),
        }
    }
}

/// Lobby phase.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LobbyPhase {
    /// Accepting joins, not enough members yet.
    Waiting,
    /// Round about to start.
    Countdown,
    /// Round in progress.
    Active,
    /// At most one member alive; collecting final reports.
    Resolving,
    /// Summary sent; late reports are ignored until reset.
    Intermission,
}

/// One incoming attack, kept for kill attribution.
#[derive(Debug, Clone)]
pub struct AttackRecord {
    /// Attacking participant.
    pub attacker: ParticipantId,
    /// Attacker display name.
    pub attacker_name: String,
    /// Nominal share received.
    pub amount: Fixed,
    /// When it was sent.
    pub at: Instant,
}

/// A lobby member.
#[derive(Debug, Clone)]
pub struct SessionMember {
    /// Connection-scoped id.
    pub id: ParticipantId,
    /// Display name.
    pub name: String,
    /// Still playing this round. Observers are never alive.
    pub alive: bool,
    /// Incoming attacks this round. Read through the credit window, never pruned.
    pub attack_log: Vec<AttackRecord>,
    /// Last board update.
    pub last_activity: Instant,
    /// Last reported stack height.
    pub board_height: u32,
}

#[derive(Debug, Default)]
struct LobbyTimers {
    countdown: Option<TimerHandle>,
    win_report: Option<TimerHandle>,
    settle: Option<TimerHandle>,
    reset: Option<TimerHandle>,
}

/// Battle-royale lobby.
#[derive(Debug)]
pub struct Lobby {
    mode: LobbyMode,
    config: LobbyConfig,
    phase: LobbyPhase,
    members: Vec<SessionMember>,
    seed: u32,
    started_at: Option<Instant>,
    /// Members alive when the round went live.
    roster: Vec<RosterEntry>,
    /// Results recorded this round, in record order.
    results: Vec<MatchResult>,
    timers: LobbyTimers,
    rounds: u64,
}

impl Lobby {
    /// Create an empty lobby.
    pub fn new(mode: LobbyMode, config: LobbyConfig) -> Self {
        Self {
            mode,
            config,
            phase: LobbyPhase::Waiting,
            members: Vec::new(),
            seed: 0,
            started_at: None,
            roster: Vec::new(),
            results: Vec::new(),
            timers: LobbyTimers::default(),
            rounds: 0,
        }
    }

    /// Lobby variant.
    pub fn mode(&self) -> LobbyMode {
        self.mode
    }

    /// Current phase.
    pub fn phase(&self) -> LobbyPhase {
        self.phase
    }

    /// Seed of the current (or last) round.
    pub fn seed(&self) -> u32 {
        self.seed
    }

    /// Number of members, observers included.
    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    /// Number of alive members.
    pub fn alive_count(&self) -> usize {
        self.members.iter().filter(|m| m.alive).count()
    }

    /// Whether `id` is a member.
    pub fn is_member(&self, id: &ParticipantId) -> bool {
        self.members.iter().any(|m| m.id == *id)
    }

    /// Member lookup.
    pub fn member(&self, id: &ParticipantId) -> Option<&SessionMember> {
        self.members.iter().find(|m| m.id == *id)
    }

    /// Every member id.
    pub fn member_ids(&self) -> Vec<ParticipantId> {
        self.members.iter().map(|m| m.id).collect()
    }

    /// Results recorded so far this round.
    pub fn recorded(&self) -> &[MatchResult] {
        &self.results
    }

    /// Rounds that reached the active phase.
    pub fn rounds_played(&self) -> u64 {
        self.rounds
    }

    fn others(&self, id: ParticipantId) -> Vec<ParticipantId> {
        self.members.iter().filter(|m| m.id != id).map(|m| m.id).collect()
    }

    fn living_roster(&self) -> Vec<RosterEntry> {
        self.members
            .iter()
            .filter(|m| m.alive)
            .map(|m| RosterEntry { id: m.id, name: m.name.clone() })
            .collect()
    }

    fn broadcast(&self, ctx: &mut Ctx<'_>, event: GameEvent) {
        ctx.out.send_many(self.member_ids(), event);
    }

    fn broadcast_count(&self, ctx: &mut Ctx<'_>) {
        self.broadcast(ctx, GameEvent::LobbyUpdate { mode: self.mode, count: self.members.len() });
    }

    fn arm(&self, ctx: &mut Ctx<'_>, after: Duration, key: TimerKey) -> Option<TimerHandle> {
        Some(ctx.timers.schedule(ctx.now + after, key))
    }

    fn disarm_all(&mut self, ctx: &mut Ctx<'_>) {
        ctx.timers.disarm(&mut self.timers.countdown);
        ctx.timers.disarm(&mut self.timers.win_report);
        ctx.timers.disarm(&mut self.timers.settle);
        ctx.timers.disarm(&mut self.timers.reset);
    }

    // =========================================================================
    // MEMBERSHIP
    // =========================================================================

    /// Add a member. Returns false if already a member.
    ///
    /// Joins during a live round become observers until the next countdown.
    pub fn join(&mut self, ctx: &mut Ctx<'_>, id: ParticipantId, name: String) -> bool {
        if self.is_member(&id) {
            return false;
        }

        let playing = matches!(self.phase, LobbyPhase::Waiting | LobbyPhase::Countdown);
        self.members.push(SessionMember {
            id,
            name,
            alive: playing,
            attack_log: Vec::new(),
            last_activity: ctx.now,
            board_height: 0,
        });

        if !playing {
            ctx.out.send(id, GameEvent::Spectate {
                mode: self.mode,
                seed: self.seed,
                players: self.living_roster(),
            });
        }
        self.broadcast_count(ctx);

        if self.phase == LobbyPhase::Waiting && self.members.len() >= self.config.min_players {
            self.start_countdown(ctx);
        }
        true
    }

    /// Remove a member. A living member mid-round is eliminated first.
    ///
    /// Returns false if `id` was not a member.
    pub fn leave(&mut self, ctx: &mut Ctx<'_>, id: ParticipantId, cause: EliminationCause) -> bool {
        let Some(index) = self.members.iter().position(|m| m.id == id) else {
            return false;
        };

        if self.members[index].alive {
            match self.phase {
                LobbyPhase::Active => self.eliminate(ctx, index, None, cause),
                LobbyPhase::Resolving if !self.has_result(&self.members[index].name) => {
                    // The sole survivor walked away before reporting; they still won.
                    self.record(ctx.now, index, true, MatchStats::default());
                    self.members[index].alive = false;
                    ctx.timers.disarm(&mut self.timers.win_report);
                    self.schedule_settle(ctx);
                }
                _ => {}
            }
        }

        let member = self.members.remove(index);
        ctx.garbage.discard(&member.id);
        debug!("{} left {:?} lobby ({:?})", member.id.short(), self.mode, self.phase);

        if self.phase == LobbyPhase::Countdown && self.members.len() < self.config.min_players {
            ctx.timers.disarm(&mut self.timers.countdown);
            self.phase = LobbyPhase::Waiting;
            self.broadcast(ctx, GameEvent::LobbyReset { mode: self.mode });
            info!("{:?} lobby countdown cancelled", self.mode);
        }
        self.broadcast_count(ctx);
        true
    }

    // =========================================================================
    // ROUND LIFECYCLE
    // =========================================================================

    fn start_countdown(&mut self, ctx: &mut Ctx<'_>) {
        self.phase = LobbyPhase::Countdown;
        self.seed = ctx.seeds.next_seed(Some(self.seed));
        self.results.clear();
        self.roster.clear();
        self.started_at = None;

        for member in self.members.iter_mut() {
            member.alive = true;
            member.attack_log.clear();
            member.board_height = 0;
            ctx.garbage.discard(&member.id);
        }

        ctx.timers.disarm(&mut self.timers.countdown);
        self.timers.countdown = self.arm(ctx, self.config.countdown, TimerKey::LobbyCountdown(self.mode));

        let seconds = self.config.countdown.as_secs() as u32;
        let starts_at_ms = ctx.wall_ms + self.config.countdown.as_millis() as u64;
        self.broadcast(ctx, GameEvent::Countdown { mode: self.mode, seconds, starts_at_ms });
        info!("{:?} lobby countdown with {} members", self.mode, self.members.len());
    }

    fn go_live(&mut self, ctx: &mut Ctx<'_>) {
        if self.members.len() < self.config.min_players {
            self.phase = LobbyPhase::Waiting;
            self.broadcast(ctx, GameEvent::LobbyReset { mode: self.mode });
            return;
        }

        self.phase = LobbyPhase::Active;
        self.started_at = Some(ctx.now);
        self.rounds += 1;
        for member in self.members.iter_mut() {
            member.last_activity = ctx.now;
        }
        self.roster = self.living_roster();

        self.broadcast(ctx, GameEvent::MatchStart {
            mode: self.mode,
            seed: self.seed,
            players: self.roster.clone(),
        });
        info!("{:?} lobby live with {} players, seed {}", self.mode, self.roster.len(), self.seed);
    }

    /// Enter resolving once at most one member is alive.
    fn check_resolution(&mut self, ctx: &mut Ctx<'_>) {
        let alive: Vec<usize> = (0..self.members.len()).filter(|i| self.members[*i].alive).collect();

        match self.phase {
            LobbyPhase::Active if alive.len() <= 1 => {
                self.phase = LobbyPhase::Resolving;
                match alive.first() {
                    Some(&index) => {
                        let survivor = self.members[index].id;
                        ctx.out.send(survivor, GameEvent::RequestWinStats { mode: self.mode });
                        self.timers.win_report =
                            self.arm(ctx, self.config.win_report_timeout, TimerKey::LobbyWinReport(self.mode));
                    }
                    None => self.schedule_settle(ctx),
                }
            }
            LobbyPhase::Resolving if alive.is_empty() => {
                ctx.timers.disarm(&mut self.timers.win_report);
                self.schedule_settle(ctx);
            }
            _ => {}
        }
    }

    fn schedule_settle(&mut self, ctx: &mut Ctx<'_>) {
        if self.timers.settle.is_none() {
            self.timers.settle = self.arm(ctx, self.config.settle_delay, TimerKey::LobbySettle(self.mode));
        }
    }

    fn rank(&self) -> Vec<MatchResult> {
        let mut ranked: Vec<(usize, MatchResult)> = self.results.iter().cloned().enumerate().collect();
        ranked.sort_by(|(ia, a), (ib, b)| {
            b.is_winner
                .cmp(&a.is_winner)
                .then(b.survival_ms.cmp(&a.survival_ms))
                .then(ia.cmp(ib))
        });
        ranked
            .into_iter()
            .enumerate()
            .map(|(place, (_, mut result))| {
                result.place = place as u32 + 1;
                result
            })
            .collect()
    }

    fn finalize(&mut self, ctx: &mut Ctx<'_>) {
        ctx.timers.disarm(&mut self.timers.win_report);
        let results = self.rank();

        if !results.is_empty() {
            ctx.out.settlements.push(Settlement::Lobby { mode: self.mode, results: results.clone() });
        }
        info!(
            "{:?} lobby resolved, winner {:?}",
            self.mode,
            results.iter().find(|r| r.is_winner).map(|r| r.display_name.as_str())
        );
        self.broadcast(ctx, GameEvent::MatchSummary { mode: self.mode, results });

        self.phase = LobbyPhase::Intermission;
        self.timers.reset = self.arm(ctx, self.config.reset_delay, TimerKey::LobbyReset(self.mode));
    }

    fn reset_to_waiting(&mut self, ctx: &mut Ctx<'_>) {
        self.disarm_all(ctx);
        self.phase = LobbyPhase::Waiting;
        self.results.clear();
        self.roster.clear();
        self.started_at = None;
        self.broadcast(ctx, GameEvent::LobbyReset { mode: self.mode });

        if self.members.len() >= self.config.min_players {
            self.start_countdown(ctx);
        }
    }

    /// Handle a fired lobby timer. Stale handles are ignored.
    pub fn on_timer(&mut self, ctx: &mut Ctx<'_>, handle: TimerHandle, key: TimerKey) -> bool {
        let slot = match key {
            TimerKey::LobbyCountdown(_) => &mut self.timers.countdown,
            TimerKey::LobbyWinReport(_) => &mut self.timers.win_report,
            TimerKey::LobbySettle(_) => &mut self.timers.settle,
            TimerKey::LobbyReset(_) => &mut self.timers.reset,
            _ => return false,
        };
        if *slot != Some(handle) {
            debug!("stale {:?} timer ignored", key);
            return false;
        }
        *slot = None;

        match key {
            TimerKey::LobbyCountdown(_) if self.phase == LobbyPhase::Countdown => self.go_live(ctx),
            TimerKey::LobbyWinReport(_) if self.phase == LobbyPhase::Resolving => {
                // Survivor went quiet: they still won, with whatever we know.
                if let Some(index) = self.members.iter().position(|m| m.alive) {
                    if !self.has_result(&self.members[index].name) {
                        self.record(ctx.now, index, true, MatchStats::default());
                    }
                }
                self.schedule_settle(ctx);
            }
            TimerKey::LobbySettle(_) if self.phase == LobbyPhase::Resolving => self.finalize(ctx),
            TimerKey::LobbyReset(_) if self.phase == LobbyPhase::Intermission => self.reset_to_waiting(ctx),
            _ => return false,
        }
        true
    }

    // =========================================================================
    // RESULTS & KILL CREDIT
    // =========================================================================

    fn has_result(&self, name: &str) -> bool {
        self.results.iter().any(|r| r.display_name == name)
    }

    fn record(&mut self, now: Instant, index: usize, is_winner: bool, stats: MatchStats) {
        let member = &self.members[index];
        if self.has_result(&member.name) || !self.roster.iter().any(|r| r.id == member.id) {
            return;
        }
        let survival_ms = self
            .started_at
            .map(|s| now.saturating_duration_since(s).as_millis() as u64)
            .unwrap_or(0);
        self.results.push(MatchResult {
            display_name: member.name.clone(),
            is_winner,
            place: 0,
            survival_ms,
            stats,
        });
    }

    /// Attribute an elimination to the largest attacker inside the credit window.
    pub fn kill_credit(&self, member: &SessionMember, now: Instant, fallback: EliminationCause) -> KillCredit {
        let window = self.config.kill_credit_window;
        let mut totals: Vec<(&str, Fixed, Instant)> = Vec::new();

        for record in &member.attack_log {
            if now.saturating_duration_since(record.at) > window {
                continue;
            }
            match totals.iter_mut().find(|(name, _, _)| *name == record.attacker_name) {
                Some(entry) => {
                    entry.1 += record.amount;
                    entry.2 = entry.2.max(record.at);
                }
                None => totals.push((&record.attacker_name, record.amount, record.at)),
            }
        }

        totals
            .into_iter()
            .max_by(|a, b| a.1.cmp(&b.1).then(a.2.cmp(&b.2)))
            .map(|(name, _, _)| KillCredit::Attacker { name: name.to_string() })
            .unwrap_or(KillCredit::Environment { cause: fallback })
    }

    fn eliminate(&mut self, ctx: &mut Ctx<'_>, index: usize, stats: Option<MatchStats>, cause: EliminationCause) {
        let killer = self.kill_credit(&self.members[index], ctx.now, cause);
        self.record(ctx.now, index, false, stats.unwrap_or_default());
        self.members[index].alive = false;

        let member = &self.members[index];
        debug!("{} eliminated in {:?} lobby by {:?}", member.id.short(), self.mode, killer);
        let event = GameEvent::Elimination {
            mode: self.mode,
            id: member.id,
            name: member.name.clone(),
            killer,
        };
        self.broadcast(ctx, event);
        self.check_resolution(ctx);
    }

    // =========================================================================
    // PARTICIPANT REPORTS
    // =========================================================================

    /// Self-reported top-out. Returns false if ignored.
    pub fn report_elimination(&mut self, ctx: &mut Ctx<'_>, id: ParticipantId, stats: MatchStats) -> bool {
        if !matches!(self.phase, LobbyPhase::Active | LobbyPhase::Resolving) {
            return false;
        }
        let Some(index) = self.members.iter().position(|m| m.id == id && m.alive) else {
            return false;
        };
        self.eliminate(ctx, index, Some(stats), EliminationCause::Gravity);
        true
    }

    /// Self-reported victory with final stats. Only the sole survivor may report.
    pub fn report_win(&mut self, ctx: &mut Ctx<'_>, id: ParticipantId, stats: MatchStats) -> bool {
        if !matches!(self.phase, LobbyPhase::Active | LobbyPhase::Resolving) || self.alive_count() != 1 {
            return false;
        }
        let Some(index) = self.members.iter().position(|m| m.id == id && m.alive) else {
            return false;
        };
        if self.has_result(&self.members[index].name) {
            return false;
        }

        if self.phase == LobbyPhase::Active {
            // The last elimination never arrived; resolve now.
            self.phase = LobbyPhase::Resolving;
        }
        ctx.timers.disarm(&mut self.timers.win_report);
        self.record(ctx.now, index, true, stats);
        self.schedule_settle(ctx);
        true
    }

    /// Board snapshot: refreshes liveness and relays to the other members.
    pub fn report_board(
        &mut self,
        ctx: &mut Ctx<'_>,
        id: ParticipantId,
        grid: serde_json::Value,
        height: u32,
    ) -> bool {
        let Some(member) = self.members.iter_mut().find(|m| m.id == id) else {
            return false;
        };
        member.last_activity = ctx.now;
        member.board_height = height;

        if matches!(self.phase, LobbyPhase::Active | LobbyPhase::Resolving) {
            ctx.out.send_many(self.others(id), GameEvent::BoardUpdate { id, grid, height });
        }
        true
    }

    fn pick_targets(&self, sender: usize, mode: AttackMode, now: Instant) -> (Vec<ParticipantId>, bool) {
        let sender_id = self.members[sender].id;
        let living: Vec<&SessionMember> =
            self.members.iter().filter(|m| m.alive && m.id != sender_id).collect();
        let even = (living.iter().map(|m| m.id).collect(), true);

        match mode {
            AttackMode::Even => even,
            AttackMode::Direct { target } => {
                if living.iter().any(|m| m.id == target) {
                    (vec![target], false)
                } else {
                    even
                }
            }
            AttackMode::Finisher => match living.iter().max_by_key(|m| m.board_height) {
                Some(m) => (vec![m.id], false),
                None => even,
            },
            AttackMode::Revenge => {
                let window = self.config.kill_credit_window;
                self.members[sender]
                    .attack_log
                    .iter()
                    .rev()
                    .filter(|r| now.saturating_duration_since(r.at) <= window)
                    .find(|r| living.iter().any(|m| m.id == r.attacker))
                    .map(|r| (vec![r.attacker], false))
                    .unwrap_or(even)
            }
        }
    }

    /// Route an attack from a living member. Returns false if ignored.
    pub fn attack(&mut self, ctx: &mut Ctx<'_>, id: ParticipantId, amount: u32, mode: AttackMode) -> bool {
        let amount = amount.min(ctx.garbage.config().max_attack);
        if self.phase != LobbyPhase::Active || amount == 0 {
            return false;
        }
        let Some(sender) = self.members.iter().position(|m| m.id == id && m.alive) else {
            return false;
        };

        let (targets, pity) = self.pick_targets(sender, mode, ctx.now);
        if targets.is_empty() {
            return false;
        }

        let attacker_name = self.members[sender].name.clone();
        self.members[sender].last_activity = ctx.now;
        let share = fixed::from_lines(amount) / targets.len() as Fixed;
        for member in self.members.iter_mut().filter(|m| targets.contains(&m.id)) {
            member.attack_log.push(AttackRecord {
                attacker: id,
                attacker_name: attacker_name.clone(),
                amount: share,
                at: ctx.now,
            });
        }

        for delivery in ctx.garbage.distribute(amount, &targets, pity) {
            ctx.out.send(delivery.recipient, GameEvent::ReceiveAttack { amount: delivery.amount });
        }
        true
    }

    // =========================================================================
    // WATCHDOG HOOKS
    // =========================================================================

    /// Eliminate and kick alive members silent past the inactivity timeout.
    pub fn sweep_inactive(&mut self, ctx: &mut Ctx<'_>) -> Vec<ParticipantId> {
        if self.phase != LobbyPhase::Active {
            return Vec::new();
        }
        let timeout = self.config.inactivity_timeout;
        let idle: Vec<ParticipantId> = self
            .members
            .iter()
            .filter(|m| m.alive && ctx.now.saturating_duration_since(m.last_activity) > timeout)
            .map(|m| m.id)
            .collect();

        for id in &idle {
            if self.phase != LobbyPhase::Active {
                break;
            }
            if let Some(index) = self.members.iter().position(|m| m.id == *id && m.alive) {
                self.eliminate(ctx, index, None, EliminationCause::Inactivity);
                ctx.out.kicks.push((*id, "inactivity".to_string()));
                info!("{} removed from {:?} lobby for inactivity", id.short(), self.mode);
            }
        }
        idle
    }

    /// Resolve a round whose last elimination event was lost.
    pub fn force_win_check(&mut self, ctx: &mut Ctx<'_>) -> bool {
        if self.phase == LobbyPhase::Active && self.alive_count() <= 1 {
            self.check_resolution(ctx);
            return true;
        }
        false
    }

    /// Recover a countdown whose timer is gone or whose membership fell short.
    pub fn recover_countdown(&mut self, ctx: &mut Ctx<'_>) -> bool {
        if self.phase != LobbyPhase::Countdown {
            return false;
        }
        let armed = self.timers.countdown.map(|h| ctx.timers.is_armed(h)).unwrap_or(false);
        if armed && self.members.len() >= self.config.min_players {
            return false;
        }
        ctx.timers.disarm(&mut self.timers.countdown);
        if self.members.len() >= self.config.min_players {
            self.go_live(ctx);
        } else {
            self.phase = LobbyPhase::Waiting;
            self.broadcast(ctx, GameEvent::LobbyReset { mode: self.mode });
        }
        true
    }

    /// Reset a non-waiting lobby with no members, persisting anything recorded.
    pub fn reset_if_abandoned(&mut self, ctx: &mut Ctx<'_>) -> bool {
        if !self.members.is_empty() || self.phase == LobbyPhase::Waiting {
            return false;
        }
        if self.phase == LobbyPhase::Resolving || self.phase == LobbyPhase::Active {
            let results = self.rank();
            if !results.is_empty() {
                ctx.out.settlements.push(Settlement::Lobby { mode: self.mode, results });
            }
        }
        self.disarm_all(ctx);
        self.phase = LobbyPhase::Waiting;
        self.results.clear();
        self.roster.clear();
        self.started_at = None;
        info!("{:?} lobby abandoned, reset to waiting", self.mode);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::TestWorld;

    fn pid(n: u8) -> ParticipantId {
        ParticipantId::from_bytes([n; 16])
    }

    fn lobby() -> Lobby {
        Lobby::new(LobbyMode::Standard, LobbyConfig::default())
    }

    /// Fire every timer due at the world's current time.
    fn fire(world: &mut TestWorld, lobby: &mut Lobby) {
        let due = world.timers.pop_due(world.now);
        for (handle, key) in due {
            lobby.on_timer(&mut world.ctx(), handle, key);
        }
    }

    fn live_lobby(world: &mut TestWorld, players: u8) -> Lobby {
        let mut lobby = lobby();
        for n in 1..=players {
            lobby.join(&mut world.ctx(), pid(n), format!("p{}", n));
        }
        world.advance(Duration::from_secs(3));
        fire(world, &mut lobby);
        assert_eq!(lobby.phase(), LobbyPhase::Active);
        world.drain();
        lobby
    }

    fn settlements(out: &crate::game::Outbox) -> Vec<Vec<MatchResult>> {
        out.settlements
            .iter()
            .filter_map(|s| match s {
                Settlement::Lobby { results, .. } => Some(results.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_second_join_starts_countdown() {
        let mut world = TestWorld::new();
        let mut lobby = lobby();

        assert!(lobby.join(&mut world.ctx(), pid(1), "a".into()));
        assert_eq!(lobby.phase(), LobbyPhase::Waiting);
        assert!(!lobby.join(&mut world.ctx(), pid(1), "a".into()));

        lobby.join(&mut world.ctx(), pid(2), "b".into());
        assert_eq!(lobby.phase(), LobbyPhase::Countdown);

        let out = world.drain();
        assert!(out.events_for(pid(1)).iter().any(|e| matches!(e, GameEvent::Countdown { seconds: 3, .. })));
    }

    #[test]
    fn test_countdown_goes_live_with_shared_seed() {
        let mut world = TestWorld::new();
        let mut lobby = lobby();
        lobby.join(&mut world.ctx(), pid(1), "a".into());
        lobby.join(&mut world.ctx(), pid(2), "b".into());
        world.drain();

        world.advance(Duration::from_secs(2));
        fire(&mut world, &mut lobby);
        assert_eq!(lobby.phase(), LobbyPhase::Countdown);

        world.advance(Duration::from_secs(1));
        fire(&mut world, &mut lobby);
        assert_eq!(lobby.phase(), LobbyPhase::Active);

        let out = world.drain();
        for n in [1, 2] {
            let starts: Vec<_> = out
                .events_for(pid(n))
                .into_iter()
                .filter_map(|e| match e {
                    GameEvent::MatchStart { seed, players, .. } => Some((*seed, players.len())),
                    _ => None,
                })
                .collect();
            assert_eq!(starts, vec![(lobby.seed(), 2)]);
        }
    }

    #[test]
    fn test_leave_during_countdown_reverts() {
        let mut world = TestWorld::new();
        let mut lobby = lobby();
        lobby.join(&mut world.ctx(), pid(1), "a".into());
        lobby.join(&mut world.ctx(), pid(2), "b".into());
        assert_eq!(world.timers.len(), 1);

        lobby.leave(&mut world.ctx(), pid(2), EliminationCause::Disconnect);
        assert_eq!(lobby.phase(), LobbyPhase::Waiting);
        assert!(world.timers.is_empty());

        // the cancelled countdown never fires
        world.advance(Duration::from_secs(10));
        fire(&mut world, &mut lobby);
        assert_eq!(lobby.phase(), LobbyPhase::Waiting);
    }

    #[test]
    fn test_first_death_asks_survivor_for_stats() {
        let mut world = TestWorld::new();
        let mut lobby = live_lobby(&mut world, 2);

        assert!(lobby.report_elimination(&mut world.ctx(), pid(1), MatchStats::default()));
        assert_eq!(lobby.phase(), LobbyPhase::Resolving);

        let out = world.drain();
        assert!(out.events_for(pid(2)).iter().any(|e| matches!(e, GameEvent::RequestWinStats { .. })));
        assert!(out.events_for(pid(1)).iter().any(|e| matches!(
            e,
            GameEvent::Elimination { killer: KillCredit::Environment { cause: EliminationCause::Gravity }, .. }
        )));
    }

    #[test]
    fn test_full_round_records_each_player_once() {
        let mut world = TestWorld::new();
        let mut lobby = live_lobby(&mut world, 3);

        world.advance(Duration::from_secs(10));
        lobby.report_elimination(&mut world.ctx(), pid(1), MatchStats { apm: 10, ..Default::default() });
        // duplicate death report is a no-op
        assert!(!lobby.report_elimination(&mut world.ctx(), pid(1), MatchStats::default()));

        world.advance(Duration::from_secs(10));
        lobby.report_elimination(&mut world.ctx(), pid(2), MatchStats::default());
        assert!(lobby.report_win(&mut world.ctx(), pid(3), MatchStats { apm: 99, ..Default::default() }));
        assert!(!lobby.report_win(&mut world.ctx(), pid(3), MatchStats::default()));

        world.advance(Duration::from_secs(1));
        fire(&mut world, &mut lobby);
        assert_eq!(lobby.phase(), LobbyPhase::Intermission);

        let out = world.drain();
        let sets = settlements(&out);
        assert_eq!(sets.len(), 1);
        let results = &sets[0];
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].display_name, "p3");
        assert!(results[0].is_winner);
        assert_eq!(results[0].stats.apm, 99);
        assert_eq!(results[1].display_name, "p2");
        assert_eq!(results[2].display_name, "p1");
        assert_eq!(results.iter().map(|r| r.place).collect::<Vec<_>>(), vec![1, 2, 3]);

        // late reports during intermission are ignored
        assert!(!lobby.report_elimination(&mut world.ctx(), pid(3), MatchStats::default()));
        assert!(!lobby.report_win(&mut world.ctx(), pid(3), MatchStats::default()));
    }

    #[test]
    fn test_reset_restarts_countdown() {
        let mut world = TestWorld::new();
        let mut lobby = live_lobby(&mut world, 2);
        let first_seed = lobby.seed();

        lobby.report_elimination(&mut world.ctx(), pid(1), MatchStats::default());
        lobby.report_win(&mut world.ctx(), pid(2), MatchStats::default());
        world.advance(Duration::from_secs(1));
        fire(&mut world, &mut lobby);
        world.advance(Duration::from_secs(10));
        fire(&mut world, &mut lobby);

        assert_eq!(lobby.phase(), LobbyPhase::Countdown);
        assert_ne!(lobby.seed(), first_seed);
        assert_eq!(lobby.alive_count(), 2);
    }

    #[test]
    fn test_observer_joins_active_round() {
        let mut world = TestWorld::new();
        let mut lobby = live_lobby(&mut world, 2);

        lobby.join(&mut world.ctx(), pid(9), "late".into());
        assert_eq!(lobby.alive_count(), 2);
        let out = world.drain();
        assert!(out.events_for(pid(9)).iter().any(|e| matches!(e, GameEvent::Spectate { players, .. } if players.len() == 2)));

        // observers cannot attack or die
        assert!(!lobby.attack(&mut world.ctx(), pid(9), 4, AttackMode::Even));
        assert!(!lobby.report_elimination(&mut world.ctx(), pid(9), MatchStats::default()));
    }

    #[test]
    fn test_attack_split_and_kill_credit() {
        let mut world = TestWorld::new();
        let mut lobby = live_lobby(&mut world, 3);

        assert!(lobby.attack(&mut world.ctx(), pid(1), 10, AttackMode::Even));
        let out = world.drain();
        for n in [2, 3] {
            assert_eq!(out.events_for(pid(n)), vec![&GameEvent::ReceiveAttack { amount: 5 }]);
        }
        assert!(out.events_for(pid(1)).is_empty());

        world.advance(Duration::from_secs(2));
        lobby.attack(&mut world.ctx(), pid(2), 2, AttackMode::Direct { target: pid(3) });
        world.advance(Duration::from_secs(1));
        lobby.report_elimination(&mut world.ctx(), pid(3), MatchStats::default());

        let out = world.drain();
        let credit = out.events_for(pid(1)).into_iter().find_map(|e| match e {
            GameEvent::Elimination { killer, .. } => Some(killer.clone()),
            _ => None,
        });
        assert_eq!(credit, Some(KillCredit::Attacker { name: "p1".into() }));
    }

    #[test]
    fn test_huge_attack_clamped() {
        let mut world = TestWorld::new();
        let mut lobby = live_lobby(&mut world, 2);

        for _ in 0..1000 {
            assert!(lobby.attack(&mut world.ctx(), pid(1), u32::MAX, AttackMode::Even));
        }
        let out = world.drain();
        assert!(out
            .events_for(pid(2))
            .iter()
            .all(|e| matches!(e, GameEvent::ReceiveAttack { amount: 10 })));
        let member = lobby.member(&pid(2)).unwrap();
        assert!(member.attack_log.iter().all(|r| r.amount == fixed::from_lines(30)));
    }

    #[test]
    fn test_kill_credit_window_expires() {
        let mut world = TestWorld::new();
        let mut lobby = live_lobby(&mut world, 3);

        lobby.attack(&mut world.ctx(), pid(1), 6, AttackMode::Direct { target: pid(3) });
        world.advance(Duration::from_secs(16));
        let member = lobby.member(&pid(3)).unwrap();
        assert_eq!(
            lobby.kill_credit(member, world.now, EliminationCause::Gravity),
            KillCredit::Environment { cause: EliminationCause::Gravity }
        );
    }

    #[test]
    fn test_disconnect_mid_round_is_elimination() {
        let mut world = TestWorld::new();
        let mut lobby = live_lobby(&mut world, 3);

        lobby.leave(&mut world.ctx(), pid(2), EliminationCause::Disconnect);
        assert_eq!(lobby.phase(), LobbyPhase::Active);
        assert_eq!(lobby.recorded().len(), 1);

        let out = world.drain();
        assert!(out.events_for(pid(1)).iter().any(|e| matches!(
            e,
            GameEvent::Elimination { killer: KillCredit::Environment { cause: EliminationCause::Disconnect }, .. }
        )));
    }

    #[test]
    fn test_double_elimination_race_resolves() {
        let mut world = TestWorld::new();
        let mut lobby = live_lobby(&mut world, 2);

        lobby.report_elimination(&mut world.ctx(), pid(1), MatchStats::default());
        lobby.report_elimination(&mut world.ctx(), pid(2), MatchStats::default());
        assert_eq!(lobby.phase(), LobbyPhase::Resolving);

        world.advance(Duration::from_secs(1));
        fire(&mut world, &mut lobby);
        assert_eq!(lobby.phase(), LobbyPhase::Intermission);
        let sets = settlements(&world.drain());
        assert_eq!(sets[0].len(), 2);
        assert!(sets[0].iter().all(|r| !r.is_winner));
    }

    #[test]
    fn test_silent_winner_times_out() {
        let mut world = TestWorld::new();
        let mut lobby = live_lobby(&mut world, 2);

        lobby.report_elimination(&mut world.ctx(), pid(1), MatchStats::default());
        world.advance(Duration::from_secs(5));
        fire(&mut world, &mut lobby);
        world.advance(Duration::from_secs(1));
        fire(&mut world, &mut lobby);

        let sets = settlements(&world.drain());
        assert_eq!(sets.len(), 1);
        assert_eq!(sets[0][0].display_name, "p2");
        assert!(sets[0][0].is_winner);
    }

    #[test]
    fn test_inactivity_sweep() {
        let mut world = TestWorld::new();
        let mut lobby = live_lobby(&mut world, 3);

        world.advance(Duration::from_secs(10));
        lobby.report_board(&mut world.ctx(), pid(1), serde_json::json!([]), 3);
        lobby.report_board(&mut world.ctx(), pid(2), serde_json::json!([]), 3);
        world.advance(Duration::from_secs(6));

        let idle = lobby.sweep_inactive(&mut world.ctx());
        assert_eq!(idle, vec![pid(3)]);
        let out = world.drain();
        assert_eq!(out.kicks.len(), 1);
        assert_eq!(out.kicks[0].0, pid(3));
        assert_eq!(lobby.alive_count(), 2);
    }

    #[test]
    fn test_abandoned_lobby_resets() {
        let mut world = TestWorld::new();
        let mut lobby = live_lobby(&mut world, 2);

        lobby.leave(&mut world.ctx(), pid(1), EliminationCause::Disconnect);
        lobby.leave(&mut world.ctx(), pid(2), EliminationCause::Disconnect);
        assert_eq!(lobby.member_count(), 0);
        world.drain();

        assert!(lobby.reset_if_abandoned(&mut world.ctx()));
        assert_eq!(lobby.phase(), LobbyPhase::Waiting);
        assert!(world.timers.is_empty());
        let sets = settlements(&world.drain());
        assert_eq!(sets.len(), 1);
        assert_eq!(sets[0].len(), 2);
    }

    #[test]
    fn test_finisher_targets_tallest_stack() {
        let mut world = TestWorld::new();
        let mut lobby = live_lobby(&mut world, 3);

        lobby.report_board(&mut world.ctx(), pid(2), serde_json::json!(null), 4);
        lobby.report_board(&mut world.ctx(), pid(3), serde_json::json!(null), 17);
        world.drain();

        lobby.attack(&mut world.ctx(), pid(1), 3, AttackMode::Finisher);
        let out = world.drain();
        assert_eq!(out.events_for(pid(3)), vec![&GameEvent::ReceiveAttack { amount: 3 }]);
        assert!(out.events_for(pid(2)).is_empty());
    }

    #[test]
    fn test_revenge_targets_last_attacker() {
        let mut world = TestWorld::new();
        let mut lobby = live_lobby(&mut world, 3);

        lobby.attack(&mut world.ctx(), pid(3), 2, AttackMode::Direct { target: pid(1) });
        world.drain();
        lobby.attack(&mut world.ctx(), pid(1), 2, AttackMode::Revenge);
        let out = world.drain();
        assert_eq!(out.events_for(pid(3)), vec![&GameEvent::ReceiveAttack { amount: 2 }]);
    }

    #[test]
    fn test_attacks_rejected_outside_active() {
        let mut world = TestWorld::new();
        let mut lobby = lobby();
        lobby.join(&mut world.ctx(), pid(1), "a".into());
        lobby.join(&mut world.ctx(), pid(2), "b".into());
        assert!(!lobby.attack(&mut world.ctx(), pid(1), 4, AttackMode::Even));
        assert!(!lobby.report_elimination(&mut world.ctx(), pid(1), MatchStats::default()));
    }
}
