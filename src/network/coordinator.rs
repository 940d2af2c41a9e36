//! Command Coordinator
//!
//! Owns every piece of shared orchestration state: presence, queues,
//! invitations, lobbies, contests, timers, the garbage ledger and the account
//! store. Connection tasks and tickers feed it typed [`Command`]s through a
//! single channel, so all mutation is serialized without locks.
//!
//! Leaving, disconnecting and being pulled into another session all go
//! through one eviction path, which keeps every participant in at most one
//! structure at a time.

use std::collections::{BTreeMap, HashMap};
use std::time::Instant;

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::core::{SeedAllocator, TimerHandle, TimerQueue};
use crate::game::contest::ContestConfig;
use crate::game::events::{
    EliminationCause, GameEvent, Outbox, Recipients, RosterEntry, Settlement, SetEndReason, TimerKey,
};
use crate::game::garbage::{AttackMode, GarbageConfig, GarbageLedger};
use crate::game::lobby::{Lobby, LobbyConfig};
use crate::game::state::{LobbyMode, MatchStats, ParticipantId, QueueMode, Status};
use crate::game::Ctx;
use crate::network::auth::{self, AuthConfig};
use crate::network::challenge::{ChallengeBroker, ChallengeConfig, ChallengeError};
use crate::network::matchmaking::{MatchmakingQueues, Pairing, QueueConfig, QueueEntry};
use crate::network::presence::{PresenceError, PresenceRegistry};
use crate::network::protocol::{AuthResult, ClientMessage, ErrorCode, ServerMessage};
use crate::network::session::SessionManager;
use crate::store::{
    AccountRecord, AccountStore, HistoryDetail, HistoryEntry, Metric, Outcome, ResultDelta,
    LEADERBOARD_SIZE,
};

/// Input to the coordinator.
#[derive(Debug)]
pub enum Command {
    /// A transport connection opened.
    Connect {
        /// Connection-scoped id.
        id: ParticipantId,
        /// Outbound queue for this connection.
        tx: mpsc::Sender<Outbound>,
    },
    /// A parsed client message.
    Client {
        /// Sender.
        id: ParticipantId,
        /// Payload.
        msg: ClientMessage,
    },
    /// The transport connection closed.
    Disconnect {
        /// Connection-scoped id.
        id: ParticipantId,
    },
    /// Pair off queued entries.
    MatchmakingTick,
    /// Run the watchdog.
    Sweep,
    /// Deliver whole lines held back in garbage carries.
    FlushGarbage,
}

/// Output to a connection's writer task.
#[derive(Debug, Clone)]
pub enum Outbound {
    /// Serialize and send.
    Message(ServerMessage),
    /// Send a close frame and stop.
    Close,
}

/// Game rule and identity settings.
#[derive(Debug, Clone, Default)]
pub struct CoordinatorConfig {
    /// Battle lobby timing.
    pub lobby: LobbyConfig,
    /// Duel / team set rules.
    pub contest: ContestConfig,
    /// Garbage routing.
    pub garbage: GarbageConfig,
    /// Queue entry lifetime.
    pub queue: QueueConfig,
    /// Invitation lifetime.
    pub challenge: ChallengeConfig,
    /// Credential and token rules.
    pub auth: AuthConfig,
    /// Version string reported on login.
    pub version: String,
}

struct Connection {
    tx: mpsc::Sender<Outbound>,
    opened_at: Instant,
}

/// Timer queue, seed source and garbage ledger, lent to state machines as a [`Ctx`].
pub(super) struct Services {
    pub(super) timers: TimerQueue<TimerKey>,
    pub(super) seeds: SeedAllocator,
    pub(super) garbage: GarbageLedger,
}

impl Services {
    pub(super) fn ctx<'a>(&'a mut self, now: Instant, out: &'a mut Outbox) -> Ctx<'a> {
        Ctx {
            now,
            wall_ms: Utc::now().timestamp_millis().max(0) as u64,
            timers: &mut self.timers,
            seeds: &mut self.seeds,
            garbage: &mut self.garbage,
            out,
        }
    }
}

/// Single owner of all orchestration state.
pub struct Coordinator {
    pub(super) config: CoordinatorConfig,
    connections: HashMap<ParticipantId, Connection>,
    pub(super) presence: PresenceRegistry,
    pub(super) queues: MatchmakingQueues,
    pub(super) challenges: ChallengeBroker,
    pub(super) lobbies: BTreeMap<LobbyMode, Lobby>,
    pub(super) sessions: SessionManager,
    pub(super) services: Services,
    store: Box<dyn AccountStore>,
}

impl Coordinator {
    /// Create a coordinator with one lobby per mode.
    pub fn new(config: CoordinatorConfig, store: Box<dyn AccountStore>) -> Self {
        Self::with_seeds(config, store, SeedAllocator::from_entropy())
    }

    /// Create a coordinator drawing round seeds from `seeds`.
    pub fn with_seeds(config: CoordinatorConfig, store: Box<dyn AccountStore>, seeds: SeedAllocator) -> Self {
        let lobbies = LobbyMode::ALL
            .iter()
            .map(|mode| (*mode, Lobby::new(*mode, config.lobby.clone())))
            .collect();

        Self {
            connections: HashMap::new(),
            presence: PresenceRegistry::new(),
            queues: MatchmakingQueues::new(config.queue.clone()),
            challenges: ChallengeBroker::new(config.challenge.clone()),
            lobbies,
            sessions: SessionManager::new(config.contest.clone()),
            services: Services {
                timers: TimerQueue::new(),
                seeds,
                garbage: GarbageLedger::new(config.garbage.clone()),
            },
            store,
            config,
        }
    }

    // =========================================================================
    // ACCESSORS
    // =========================================================================

    /// Open transport connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Authenticated participants.
    pub fn online_count(&self) -> usize {
        self.presence.len()
    }

    /// Live duel / team contests.
    pub fn session_count(&self) -> usize {
        self.sessions.count()
    }

    /// Entries waiting across both queues.
    pub fn queue_size(&self) -> usize {
        self.queues.len(QueueMode::Duel) + self.queues.len(QueueMode::Team)
    }

    /// Current status of a participant.
    pub fn status(&self, id: &ParticipantId) -> Option<Status> {
        self.presence.status(id)
    }

    /// Lobby instance for `mode`.
    pub fn lobby(&self, mode: LobbyMode) -> Option<&Lobby> {
        self.lobbies.get(&mode)
    }

    /// Account store.
    pub fn store(&self) -> &dyn AccountStore {
        self.store.as_ref()
    }

    /// Earliest armed timer deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.services.timers.next_deadline()
    }

    // =========================================================================
    // DISPATCH
    // =========================================================================

    /// Handle one command at `now`.
    pub fn handle(&mut self, cmd: Command, now: Instant) {
        match cmd {
            Command::Connect { id, tx } => {
                self.connections.insert(id, Connection { tx, opened_at: now });
                debug!("connection {} registered", id.short());
            }
            Command::Client { id, msg } => self.on_client(id, msg, now),
            Command::Disconnect { id } => self.disconnect(id, now),
            Command::MatchmakingTick => self.matchmaking_tick(now),
            Command::Sweep => {
                let report = self.sweep(now);
                if report.is_eventful() {
                    debug!("watchdog: {:?}", report);
                }
            }
            Command::FlushGarbage => {
                for delivery in self.services.garbage.flush() {
                    self.send(
                        delivery.recipient,
                        ServerMessage::Event(GameEvent::ReceiveAttack { amount: delivery.amount }),
                    );
                }
            }
        }
    }

    /// Fire every timer due at `now`. Returns how many fired.
    pub fn fire_due(&mut self, now: Instant) -> usize {
        let due = self.services.timers.pop_due(now);
        let fired = due.len();
        for (handle, key) in due {
            self.on_timer(handle, key, now);
        }
        fired
    }

    fn on_client(&mut self, id: ParticipantId, msg: ClientMessage, now: Instant) {
        if !self.connections.contains_key(&id) {
            debug!("message from unknown connection {}", id.short());
            return;
        }

        match msg {
            ClientMessage::Authenticate { name, secret } => return self.authenticate(id, &name, &secret, now),
            ClientMessage::AuthenticateToken { token } => return self.authenticate_token(id, &token, now),
            ClientMessage::Ping { timestamp } => {
                let server_time = Utc::now().timestamp_millis().max(0) as u64;
                return self.send(id, ServerMessage::Pong { timestamp, server_time });
            }
            _ => {}
        }

        if !self.presence.contains(&id) {
            return self.send(id, ServerMessage::error(ErrorCode::NotAuthenticated, "authenticate first"));
        }

        match msg {
            ClientMessage::JoinLobby { mode } => self.join_lobby(id, mode, now),
            ClientMessage::JoinQueue { mode } => self.join_queue(id, mode, now),
            ClientMessage::Leave => self.leave(id, now),
            ClientMessage::Challenge { target, kind } => self.challenge(id, target, kind, now),
            ClientMessage::Accept { from } => self.accept(id, from, now),
            ClientMessage::Decline { from } => self.decline(id, from),
            ClientMessage::ReportBoard { grid, height } => self.report_board(id, grid, height, now),
            ClientMessage::SendAttack { amount, mode } => self.send_attack(id, amount, mode, now),
            ClientMessage::ReportElimination { stats } => self.report_lobby_result(id, stats, false, now),
            ClientMessage::ReportWin { stats } => self.report_lobby_result(id, stats, true, now),
            ClientMessage::ReportRoundLoss { round, stats } => self.report_round_loss(id, round, stats, now),
            ClientMessage::RequestStats => {
                let accounts = self.store.public_records();
                self.send(id, ServerMessage::AllStats { accounts });
            }
            ClientMessage::SubmitApm { value } => self.submit_apm(id, value),
            ClientMessage::ListOnline => {
                let players = self.presence.online();
                self.send(id, ServerMessage::Online { players });
            }
            ClientMessage::Authenticate { .. } | ClientMessage::AuthenticateToken { .. } | ClientMessage::Ping { .. } => {}
        }
    }

    // =========================================================================
    // AUTHENTICATION
    // =========================================================================

    fn authenticate(&mut self, id: ParticipantId, raw_name: &str, secret: &str, now: Instant) {
        if self.presence.contains(&id) {
            return self.send(id, ServerMessage::error(ErrorCode::InvalidInput, "already authenticated"));
        }
        let name = match auth::normalize_name(raw_name, self.config.auth.max_name_len) {
            Ok(name) => name,
            Err(e) => return self.send(id, ServerMessage::error(ErrorCode::AuthFailed, e.to_string())),
        };
        if self.presence.by_name(&name).is_some() {
            return self.reject_online(id, &name);
        }

        let verified = match self.store.get(&name) {
            Some(record) if record.secret_digest.is_empty() => Err("account uses token login".to_string()),
            Some(record) => auth::verify_secret(secret, &record.salt, &record.secret_digest).map_err(|e| e.to_string()),
            None if secret.is_empty() => Err(auth::AuthError::EmptySecret.to_string()),
            None => {
                let salt = auth::new_salt();
                let record = AccountRecord {
                    secret_digest: auth::hash_secret(secret, &salt),
                    salt,
                    ..Default::default()
                };
                match self.store.register(&name, record) {
                    Ok(()) => {
                        info!("registered account {}", name);
                        self.persist();
                        Ok(())
                    }
                    Err(e) => {
                        warn!("failed to register {}: {}", name, e);
                        return self.send(id, ServerMessage::error(ErrorCode::InternalError, "could not create account"));
                    }
                }
            }
        };

        match verified {
            Ok(()) => self.login(id, name, now),
            Err(message) => {
                debug!("login for {} rejected: {}", name, message);
                self.send(id, ServerMessage::error(ErrorCode::AuthFailed, message));
            }
        }
    }

    fn authenticate_token(&mut self, id: ParticipantId, token: &str, now: Instant) {
        if self.presence.contains(&id) {
            return self.send(id, ServerMessage::error(ErrorCode::InvalidInput, "already authenticated"));
        }
        let name = auth::validate_token(token, &self.config.auth)
            .and_then(|claims| auth::normalize_name(claims.display_name(), self.config.auth.max_name_len));
        let name = match name {
            Ok(name) => name,
            Err(e) => return self.send(id, ServerMessage::error(ErrorCode::AuthFailed, e.to_string())),
        };
        if self.presence.by_name(&name).is_some() {
            return self.reject_online(id, &name);
        }

        if self.store.get(&name).is_none() {
            if let Err(e) = self.store.register(&name, AccountRecord::default()) {
                warn!("failed to register {}: {}", name, e);
                return self.send(id, ServerMessage::error(ErrorCode::InternalError, "could not create account"));
            }
            info!("registered token account {}", name);
            self.persist();
        }
        self.login(id, name, now);
    }

    fn reject_online(&self, id: ParticipantId, name: &str) {
        let e = PresenceError::AlreadyOnline(name.to_string());
        self.send(id, ServerMessage::error(ErrorCode::AlreadyOnline, e.to_string()));
    }

    fn login(&mut self, id: ParticipantId, name: String, now: Instant) {
        if let Err(e) = self.presence.register(id, &name, now) {
            return self.send(id, ServerMessage::error(ErrorCode::AlreadyOnline, e.to_string()));
        }
        let (wins, best_apm) = self.store.get(&name).map(|r| (r.wins, r.best_apm)).unwrap_or_default();
        info!("{} logged in as {}", id.short(), name);

        self.send(id, ServerMessage::AuthResult(AuthResult {
            success: true,
            id: Some(id),
            name: Some(name),
            wins,
            best_apm,
            error: None,
            server_version: self.config.version.clone(),
        }));
        self.send(id, self.leaderboard());
    }

    fn leaderboard(&self) -> ServerMessage {
        ServerMessage::LeaderboardUpdate {
            wins: self.store.top_n(Metric::Wins, LEADERBOARD_SIZE),
            combos: self.store.top_n(Metric::BestCombo, LEADERBOARD_SIZE),
        }
    }

    fn submit_apm(&mut self, id: ParticipantId, value: u32) {
        let Some(name) = self.presence.name_of(&id).map(str::to_string) else {
            return;
        };
        match self.store.raise_best_apm(&name, value) {
            Ok(Some(best_apm)) => {
                self.persist();
                self.send(id, ServerMessage::BestApmUpdated { best_apm });
            }
            Ok(None) => {}
            Err(e) => warn!("failed to store apm for {}: {}", name, e),
        }
    }

    // =========================================================================
    // MEMBERSHIP
    // =========================================================================

    /// Explicit leave: drop invitations, then evict.
    fn leave(&mut self, id: ParticipantId, now: Instant) {
        self.cancel_invitations(id);
        self.evict_everywhere(id, EliminationCause::Disconnect, now);
    }

    /// Drop every invitation sent by or to `id`, telling the other side.
    fn cancel_invitations(&mut self, id: ParticipantId) {
        for invitation in self.challenges.cancel_involving(&mut self.services.timers, id) {
            let other = if invitation.from == id { invitation.to } else { invitation.from };
            self.send(other, ServerMessage::ChallengeExpired { from: invitation.from, to: invitation.to });
        }
    }

    /// Withdraw the invitation sent by `id`, who committed to something else.
    fn withdraw_invitation(&mut self, id: ParticipantId) {
        if let Some(invitation) = self.challenges.withdraw(&mut self.services.timers, id) {
            let msg = ServerMessage::ChallengeExpired { from: invitation.from, to: invitation.to };
            self.send(invitation.to, msg.clone());
            self.send(invitation.from, msg);
        }
    }

    /// Remove `id` from whatever queue, lobby or contest it is in.
    fn evict_everywhere(&mut self, id: ParticipantId, cause: EliminationCause, now: Instant) {
        let Some(status) = self.presence.status(&id) else {
            return;
        };
        let mut out = Outbox::default();

        match status {
            Status::Idle => {}
            Status::Queuing(_) => {
                if let Some((mode, entry)) = self.queues.remove(&mut self.services.timers, id) {
                    self.cancel_queue_entry(mode, entry, "left queue");
                }
            }
            Status::Lobby(mode) => {
                if let Some(lobby) = self.lobbies.get_mut(&mode) {
                    let mut ctx = self.services.ctx(now, &mut out);
                    lobby.leave(&mut ctx, id, cause);
                }
            }
            Status::Duel(session) | Status::Team(session) => {
                if let Some(contest) = self.sessions.get_mut(&session) {
                    let mut ctx = self.services.ctx(now, &mut out);
                    contest.forfeit(&mut ctx, id);
                }
            }
        }

        self.presence.set_status(&id, Status::Idle);
        self.services.garbage.discard(&id);
        self.apply(out, now);
    }

    /// Notify every member of a removed queue entry and idle them.
    fn cancel_queue_entry(&mut self, mode: QueueMode, entry: QueueEntry, reason: &str) {
        for member in entry.ids() {
            self.presence.set_status(&member, Status::Idle);
            self.send(member, ServerMessage::QueueCancelled { mode, reason: reason.to_string() });
        }
    }

    fn join_lobby(&mut self, id: ParticipantId, mode: LobbyMode, now: Instant) {
        if self.presence.status(&id) == Some(Status::Lobby(mode)) {
            debug!("{} already in {:?} lobby", id.short(), mode);
            return;
        }
        self.evict_everywhere(id, EliminationCause::Forfeit, now);
        self.withdraw_invitation(id);

        let Some(name) = self.presence.name_of(&id).map(str::to_string) else {
            return;
        };
        let Some(lobby) = self.lobbies.get_mut(&mode) else {
            return;
        };
        let mut out = Outbox::default();
        let mut ctx = self.services.ctx(now, &mut out);
        if lobby.join(&mut ctx, id, name) {
            self.presence.set_status(&id, Status::Lobby(mode));
        }
        self.apply(out, now);
    }

    fn join_queue(&mut self, id: ParticipantId, mode: QueueMode, now: Instant) {
        self.evict_everywhere(id, EliminationCause::Forfeit, now);
        let Some(name) = self.presence.name_of(&id).map(str::to_string) else {
            return;
        };
        self.enqueue(mode, vec![RosterEntry { id, name }], now);
    }

    fn enqueue(&mut self, mode: QueueMode, members: Vec<RosterEntry>, now: Instant) {
        let ids: Vec<ParticipantId> = members.iter().map(|m| m.id).collect();
        match self.queues.enqueue(&mut self.services.timers, now, mode, members) {
            Some(position) => {
                for id in ids {
                    self.withdraw_invitation(id);
                    self.presence.set_status(&id, Status::Queuing(mode));
                    self.send(id, ServerMessage::QueueJoined { mode, position });
                }
            }
            None => {
                for id in ids {
                    self.send(id, ServerMessage::error(ErrorCode::InvalidInput, "cannot join that queue"));
                }
            }
        }
    }

    fn disconnect(&mut self, id: ParticipantId, now: Instant) {
        self.cancel_invitations(id);
        self.evict_everywhere(id, EliminationCause::Disconnect, now);

        if let Some(participant) = self.presence.remove(&id) {
            info!("{} ({}) went offline", participant.name, id.short());
        }
        if let Some(conn) = self.connections.remove(&id) {
            debug!("connection {} closed after {:?}", id.short(), now.saturating_duration_since(conn.opened_at));
        }
    }

    // =========================================================================
    // INVITATIONS
    // =========================================================================

    fn challenge(&mut self, id: ParticipantId, target: ParticipantId, kind: QueueMode, now: Instant) {
        if self.presence.status(&id).is_some_and(|s| s.contest().is_some()) {
            let e = ChallengeError::SenderBusy;
            return self.send(id, ServerMessage::error(ErrorCode::InvalidInput, e.to_string()));
        }
        let available = target != id
            && self.presence.status(&target).is_some_and(|s| s.contest().is_none());
        if !available {
            let e = if target == id { ChallengeError::SelfChallenge } else { ChallengeError::TargetUnavailable };
            return self.send(id, ServerMessage::error(ErrorCode::TargetUnavailable, e.to_string()));
        }

        match self.challenges.challenge(&mut self.services.timers, now, id, target, kind) {
            Ok(_) => {
                let from_name = self.presence.name_of(&id).unwrap_or_default().to_string();
                let expires_in_secs = self.challenges.timeout().as_secs();
                self.send(target, ServerMessage::ChallengeReceived { from: id, from_name, kind, expires_in_secs });
                self.send(id, ServerMessage::ChallengeSent { to: target, kind });
            }
            Err(e @ ChallengeError::AlreadyPending) => {
                self.send(id, ServerMessage::error(ErrorCode::InvitationPending, e.to_string()));
            }
            Err(e) => self.send(id, ServerMessage::error(ErrorCode::TargetUnavailable, e.to_string())),
        }
    }

    fn accept(&mut self, id: ParticipantId, from: ParticipantId, now: Instant) {
        let Some(invitation) = self.challenges.accept(&mut self.services.timers, from, id) else {
            debug!("stale accept from {} for {}", id.short(), from.short());
            return;
        };
        let roster = |presence: &PresenceRegistry, pid: ParticipantId| {
            presence.name_of(&pid).map(|name| RosterEntry { id: pid, name: name.to_string() })
        };
        let (Some(sender), Some(accepter)) = (roster(&self.presence, from), roster(&self.presence, id)) else {
            return;
        };
        if self.presence.status(&from).is_some_and(|s| s.contest().is_some()) {
            debug!("{} accepted an invitation from busy {}", id.short(), from.short());
            let e = ChallengeError::TargetUnavailable;
            return self.send(id, ServerMessage::error(ErrorCode::TargetUnavailable, e.to_string()));
        }

        self.evict_everywhere(from, EliminationCause::Forfeit, now);
        self.evict_everywhere(id, EliminationCause::Forfeit, now);

        match invitation.kind {
            QueueMode::Duel => self.start_contest(Pairing { mode: QueueMode::Duel, sides: [vec![sender], vec![accepter]] }, now),
            QueueMode::Team => self.enqueue(QueueMode::Team, vec![sender, accepter], now),
        }
    }

    fn decline(&mut self, id: ParticipantId, from: ParticipantId) {
        if self.challenges.decline(&mut self.services.timers, from, id).is_some() {
            let by_name = self.presence.name_of(&id).unwrap_or_default().to_string();
            self.send(from, ServerMessage::ChallengeDeclined { by: id, by_name });
        }
    }

    // =========================================================================
    // CONTESTS & MATCHMAKING
    // =========================================================================

    fn start_contest(&mut self, pairing: Pairing, now: Instant) {
        let mut out = Outbox::default();
        let session = {
            let mut ctx = self.services.ctx(now, &mut out);
            self.sessions.create(&mut ctx, pairing.mode, pairing.sides.clone())
        };
        let status = match pairing.mode {
            QueueMode::Duel => Status::Duel(session),
            QueueMode::Team => Status::Team(session),
        };

        for (side, members) in pairing.sides.iter().enumerate() {
            let opponents: Vec<String> = pairing.sides[1 - side].iter().map(|m| m.name.clone()).collect();
            for member in members {
                self.cancel_invitations(member.id);
                self.presence.set_status(&member.id, status);
                let teammates = members.iter().filter(|m| m.id != member.id).map(|m| m.name.clone()).collect();
                self.send(member.id, ServerMessage::QueueMatched {
                    mode: pairing.mode,
                    session,
                    teammates,
                    opponents: opponents.clone(),
                });
            }
        }
        info!("{:?} {} started", pairing.mode, session.short());
        self.apply(out, now);
    }

    fn matchmaking_tick(&mut self, now: Instant) {
        let presence = &self.presence;
        let outcome = self.queues.tick(&mut self.services.timers, |id| presence.contains(id));

        for (mode, entry) in outcome.dropped {
            let connected: Vec<ParticipantId> = entry.ids().into_iter().filter(|id| self.presence.contains(id)).collect();
            for member in connected {
                self.presence.set_status(&member, Status::Idle);
                self.send(member, ServerMessage::QueueCancelled { mode, reason: "partner disconnected".to_string() });
            }
        }
        for pairing in outcome.pairings {
            self.start_contest(pairing, now);
        }
    }

    // =========================================================================
    // IN-SESSION REPORTS
    // =========================================================================

    fn report_board(&mut self, id: ParticipantId, grid: serde_json::Value, height: u32, now: Instant) {
        let mut out = Outbox::default();
        let handled = match self.presence.status(&id) {
            Some(Status::Lobby(mode)) => match self.lobbies.get_mut(&mode) {
                Some(lobby) => lobby.report_board(&mut self.services.ctx(now, &mut out), id, grid, height),
                None => false,
            },
            Some(Status::Duel(session) | Status::Team(session)) => match self.sessions.get(&session) {
                Some(contest) => contest.report_board(&mut self.services.ctx(now, &mut out), id, grid, height),
                None => false,
            },
            _ => false,
        };
        if !handled {
            debug!("board from {} ignored", id.short());
        }
        self.apply(out, now);
    }

    fn send_attack(&mut self, id: ParticipantId, amount: u32, mode: AttackMode, now: Instant) {
        let mut out = Outbox::default();
        let handled = match self.presence.status(&id) {
            Some(Status::Lobby(lobby_mode)) => match self.lobbies.get_mut(&lobby_mode) {
                Some(lobby) => lobby.attack(&mut self.services.ctx(now, &mut out), id, amount, mode),
                None => false,
            },
            Some(Status::Duel(session) | Status::Team(session)) => match self.sessions.get_mut(&session) {
                Some(contest) => contest.attack(&mut self.services.ctx(now, &mut out), id, amount),
                None => false,
            },
            _ => false,
        };
        if !handled {
            debug!("attack from {} ignored", id.short());
        }
        self.apply(out, now);
    }

    fn report_lobby_result(&mut self, id: ParticipantId, stats: MatchStats, win: bool, now: Instant) {
        let Some(Status::Lobby(mode)) = self.presence.status(&id) else {
            debug!("lobby report from {} outside a lobby", id.short());
            return;
        };
        let Some(lobby) = self.lobbies.get_mut(&mode) else {
            return;
        };
        let mut out = Outbox::default();
        let mut ctx = self.services.ctx(now, &mut out);
        let accepted = if win {
            lobby.report_win(&mut ctx, id, stats)
        } else {
            lobby.report_elimination(&mut ctx, id, stats)
        };
        if !accepted {
            debug!("duplicate or stale lobby report from {}", id.short());
        }
        self.apply(out, now);
    }

    fn report_round_loss(&mut self, id: ParticipantId, round: Option<u32>, stats: MatchStats, now: Instant) {
        let Some(session) = self.presence.status(&id).and_then(|s| s.contest()) else {
            debug!("round loss from {} outside a contest", id.short());
            return;
        };
        let Some(contest) = self.sessions.get_mut(&session) else {
            return;
        };
        debug!("{} lost round {:?} of {} ({:?})", id.short(), round, session.short(), stats);
        let mut out = Outbox::default();
        contest.report_round_loss(&mut self.services.ctx(now, &mut out), id, round);
        self.apply(out, now);
    }

    // =========================================================================
    // TIMERS
    // =========================================================================

    fn on_timer(&mut self, handle: TimerHandle, key: TimerKey, now: Instant) {
        let mut out = Outbox::default();
        match key {
            TimerKey::LobbyCountdown(mode)
            | TimerKey::LobbyWinReport(mode)
            | TimerKey::LobbySettle(mode)
            | TimerKey::LobbyReset(mode) => {
                if let Some(lobby) = self.lobbies.get_mut(&mode) {
                    lobby.on_timer(&mut self.services.ctx(now, &mut out), handle, key);
                }
            }
            TimerKey::ContestRound(session) => {
                self.sessions.on_timer(&mut self.services.ctx(now, &mut out), session, handle);
            }
            TimerKey::ChallengeExpiry(from) => {
                if let Some(invitation) = self.challenges.on_expiry(handle, from) {
                    let msg = ServerMessage::ChallengeExpired { from: invitation.from, to: invitation.to };
                    self.send(invitation.to, msg.clone());
                    self.send(invitation.from, msg);
                }
            }
            TimerKey::QueueExpiry(leader) => {
                if let Some((mode, entry)) = self.queues.on_expiry(&mut self.services.timers, handle, leader) {
                    self.cancel_queue_entry(mode, entry, "timed out");
                }
            }
        }
        self.apply(out, now);
    }

    // =========================================================================
    // SIDE EFFECTS
    // =========================================================================

    /// Deliver, persist and release whatever the state machines produced.
    pub(super) fn apply(&mut self, out: Outbox, now: Instant) {
        if out.is_empty() {
            return;
        }

        for notice in out.notices {
            let msg = ServerMessage::Event(notice.event);
            match notice.to {
                Recipients::One(id) => self.send(id, msg),
                Recipients::Many(ids) => {
                    for id in ids {
                        self.send(id, msg.clone());
                    }
                }
            }
        }

        let settled = !out.settlements.is_empty();
        for settlement in out.settlements {
            self.settle(settlement);
        }
        if settled {
            self.persist();
            let board = self.leaderboard();
            for id in self.presence.ids() {
                self.send(id, board.clone());
            }
        }

        for (id, reason) in out.kicks {
            info!("kicking {}: {}", id.short(), reason);
            self.send(id, ServerMessage::Kicked { reason });
            self.push(id, Outbound::Close);
            self.disconnect(id, now);
        }

        for id in out.released {
            let finished = match self.presence.status(&id).and_then(|s| s.contest()) {
                Some(session) => self.sessions.get(&session).map_or(true, |c| !c.is_active()),
                None => false,
            };
            if finished {
                self.presence.set_status(&id, Status::Idle);
            }
        }
        self.sessions.cleanup();
    }

    /// Write a resolved round or set to the account store.
    fn settle(&mut self, settlement: Settlement) {
        let date = Utc::now();
        let mut winners = Vec::new();

        match settlement {
            Settlement::Lobby { mode, results } => {
                for result in results {
                    let outcome = if result.is_winner { Outcome::Win } else { Outcome::Loss };
                    if result.is_winner {
                        winners.push(result.display_name.clone());
                    }
                    let delta = ResultDelta {
                        won: result.is_winner,
                        stats: Some(result.stats.clone()),
                        entry: HistoryEntry {
                            date,
                            outcome,
                            detail: HistoryDetail::Lobby { mode, place: result.place, stats: result.stats },
                        },
                    };
                    self.record(&result.display_name, delta);
                }
            }
            Settlement::Contest { kind, winners: won, losers, score, reason } => {
                let forfeit = reason == SetEndReason::Forfeit;
                let sides = [
                    (&won, &losers, Outcome::Win, format!("{}-{}", score.0, score.1)),
                    (&losers, &won, Outcome::Loss, format!("{}-{}", score.1, score.0)),
                ];
                for (names, opponents, outcome, score) in sides {
                    let opponent = opponents.join(" & ");
                    for name in names {
                        let delta = ResultDelta {
                            won: outcome == Outcome::Win,
                            stats: None,
                            entry: HistoryEntry {
                                date,
                                outcome,
                                detail: HistoryDetail::Contest {
                                    kind,
                                    opponent: opponent.clone(),
                                    score: score.clone(),
                                    forfeit,
                                },
                            },
                        };
                        self.record(name, delta);
                    }
                }
                winners = won;
            }
        }

        for name in winners {
            let wins = self.store.get(&name).map(|r| r.wins).unwrap_or_default();
            if let Some(id) = self.presence.by_name(&name) {
                self.send(id, ServerMessage::WinsUpdated { wins });
            }
        }
    }

    /// Hand pending account changes to the store's writer.
    fn persist(&mut self) {
        if let Err(e) = self.store.flush() {
            warn!("failed to persist accounts: {}", e);
        }
    }

    fn record(&mut self, name: &str, delta: ResultDelta) {
        if let Err(e) = self.store.apply_result(name, delta) {
            warn!("failed to record result for {}: {}", name, e);
        }
    }

    pub(super) fn send(&self, id: ParticipantId, msg: ServerMessage) {
        self.push(id, Outbound::Message(msg));
    }

    fn push(&self, id: ParticipantId, item: Outbound) {
        let Some(conn) = self.connections.get(&id) else {
            return;
        };
        if let Err(e) = conn.tx.try_send(item) {
            warn!("dropped outbound message for {}: {}", id.short(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::lobby::LobbyPhase;
    use crate::store::{LeaderboardEntry, MemoryStore, PublicRecord, StoreError};
    use rand::{Rng, SeedableRng};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use rand::rngs::StdRng;
    use std::time::Duration;

    struct Harness {
        coord: Coordinator,
        inboxes: HashMap<ParticipantId, mpsc::Receiver<Outbound>>,
        now: Instant,
    }

    /// Memory store that counts flushes.
    struct CountingStore {
        inner: MemoryStore,
        flushes: Arc<AtomicUsize>,
    }

    impl AccountStore for CountingStore {
        fn get(&self, name: &str) -> Option<&AccountRecord> {
            self.inner.get(name)
        }
        fn register(&mut self, name: &str, record: AccountRecord) -> Result<(), StoreError> {
            self.inner.register(name, record)
        }
        fn apply_result(&mut self, name: &str, delta: ResultDelta) -> Result<(), StoreError> {
            self.inner.apply_result(name, delta)
        }
        fn raise_best_apm(&mut self, name: &str, apm: u32) -> Result<Option<u32>, StoreError> {
            self.inner.raise_best_apm(name, apm)
        }
        fn top_n(&self, metric: Metric, n: usize) -> Vec<LeaderboardEntry> {
            self.inner.top_n(metric, n)
        }
        fn public_records(&self) -> Vec<PublicRecord> {
            self.inner.public_records()
        }
        fn flush(&mut self) -> Result<(), StoreError> {
            self.flushes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    impl Harness {
        fn new() -> Self {
            Self::with_store(Box::new(MemoryStore::new()))
        }

        fn with_store(store: Box<dyn AccountStore>) -> Self {
            let config = CoordinatorConfig { version: "test".into(), ..Default::default() };
            Self {
                coord: Coordinator::with_seeds(config, store, SeedAllocator::with_seed(7)),
                inboxes: HashMap::new(),
                now: Instant::now(),
            }
        }

        fn connect(&mut self) -> ParticipantId {
            let id = ParticipantId::random();
            let (tx, rx) = mpsc::channel(1024);
            self.inboxes.insert(id, rx);
            self.coord.handle(Command::Connect { id, tx }, self.now);
            id
        }

        fn login(&mut self, name: &str) -> ParticipantId {
            let id = self.connect();
            self.client(id, ClientMessage::Authenticate { name: name.into(), secret: "pw".into() });
            self.drain(id);
            id
        }

        fn client(&mut self, id: ParticipantId, msg: ClientMessage) {
            self.coord.handle(Command::Client { id, msg }, self.now);
        }

        fn advance(&mut self, by: Duration) {
            self.now += by;
            self.coord.fire_due(self.now);
        }

        fn drain(&mut self, id: ParticipantId) -> Vec<ServerMessage> {
            let mut msgs = Vec::new();
            if let Some(rx) = self.inboxes.get_mut(&id) {
                while let Ok(item) = rx.try_recv() {
                    if let Outbound::Message(msg) = item {
                        msgs.push(msg);
                    }
                }
            }
            msgs
        }

        fn error_code(&mut self, id: ParticipantId) -> Option<ErrorCode> {
            self.drain(id).into_iter().find_map(|m| match m {
                ServerMessage::Error(e) => Some(e.code),
                _ => None,
            })
        }

        fn duel(&mut self, a: ParticipantId, b: ParticipantId) -> crate::game::state::SessionId {
            self.client(a, ClientMessage::JoinQueue { mode: QueueMode::Duel });
            self.client(b, ClientMessage::JoinQueue { mode: QueueMode::Duel });
            self.coord.handle(Command::MatchmakingTick, self.now);
            self.coord.status(&a).and_then(|s| s.contest()).unwrap()
        }
    }

    #[test]
    fn test_register_then_login() {
        let mut h = Harness::new();
        let id = h.connect();
        h.client(id, ClientMessage::Authenticate { name: "  alice ".into(), secret: "pw".into() });

        let msgs = h.drain(id);
        match &msgs[0] {
            ServerMessage::AuthResult(result) => {
                assert!(result.success);
                assert_eq!(result.name.as_deref(), Some("alice"));
                assert_eq!(result.server_version, "test");
            }
            other => panic!("Wrong message type: {:?}", other),
        }
        assert!(matches!(msgs[1], ServerMessage::LeaderboardUpdate { .. }));

        let record = h.coord.store().get("alice").unwrap();
        assert_ne!(record.secret_digest, "pw");
        assert!(!record.salt.is_empty());
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let mut h = Harness::new();
        let first = h.login("alice");
        h.coord.handle(Command::Disconnect { id: first }, h.now);

        let id = h.connect();
        h.client(id, ClientMessage::Authenticate { name: "alice".into(), secret: "nope".into() });
        assert_eq!(h.error_code(id), Some(ErrorCode::AuthFailed));
        assert_eq!(h.coord.online_count(), 0);
    }

    #[test]
    fn test_second_login_for_name_rejected() {
        let mut h = Harness::new();
        h.login("alice");
        let id = h.connect();
        h.client(id, ClientMessage::Authenticate { name: "alice".into(), secret: "pw".into() });
        assert_eq!(h.error_code(id), Some(ErrorCode::AlreadyOnline));
        assert_eq!(h.coord.online_count(), 1);
    }

    #[test]
    fn test_unauthenticated_requests_rejected() {
        let mut h = Harness::new();
        let id = h.connect();
        h.client(id, ClientMessage::JoinLobby { mode: LobbyMode::Standard });
        assert_eq!(h.error_code(id), Some(ErrorCode::NotAuthenticated));

        h.client(id, ClientMessage::Ping { timestamp: 9 });
        assert!(matches!(h.drain(id)[0], ServerMessage::Pong { timestamp: 9, .. }));
    }

    #[test]
    fn test_token_login_disabled_without_secret() {
        let mut h = Harness::new();
        let id = h.connect();
        h.client(id, ClientMessage::AuthenticateToken { token: "a.b.c".into() });
        assert_eq!(h.error_code(id), Some(ErrorCode::AuthFailed));
    }

    #[test]
    fn test_lobby_round_through_coordinator() {
        let mut h = Harness::new();
        let a = h.login("alice");
        let b = h.login("bob");
        h.client(a, ClientMessage::JoinLobby { mode: LobbyMode::Standard });
        h.client(b, ClientMessage::JoinLobby { mode: LobbyMode::Standard });
        assert_eq!(h.coord.lobby(LobbyMode::Standard).unwrap().phase(), LobbyPhase::Countdown);

        h.advance(Duration::from_secs(3));
        assert_eq!(h.coord.lobby(LobbyMode::Standard).unwrap().phase(), LobbyPhase::Active);

        h.client(a, ClientMessage::ReportElimination { stats: MatchStats::default() });
        let msgs = h.drain(b);
        assert!(msgs.iter().any(|m| matches!(m, ServerMessage::Event(GameEvent::RequestWinStats { .. }))));

        h.client(b, ClientMessage::ReportWin { stats: MatchStats { apm: 50, max_combo: 6, ..Default::default() } });
        h.advance(Duration::from_secs(1));

        let msgs = h.drain(b);
        assert!(msgs.iter().any(|m| matches!(m, ServerMessage::WinsUpdated { wins: 1 })));
        assert!(msgs.iter().any(|m| matches!(m, ServerMessage::LeaderboardUpdate { .. })));

        let bob = h.coord.store().get("bob").unwrap();
        assert_eq!(bob.wins, 1);
        assert_eq!(bob.best_combo, 6);
        assert_eq!(h.coord.store().get("alice").unwrap().history.len(), 1);
        // members stay in the lobby for the next round
        assert_eq!(h.coord.status(&a), Some(Status::Lobby(LobbyMode::Standard)));
    }

    #[test]
    fn test_disconnect_mid_duel_forfeits_once() {
        let mut h = Harness::new();
        let a = h.login("alice");
        let b = h.login("bob");
        let session = h.duel(a, b);
        assert_eq!(h.coord.status(&b), Some(Status::Duel(session)));
        h.drain(b);

        h.coord.handle(Command::Disconnect { id: a }, h.now);

        let msgs = h.drain(b);
        assert!(msgs.iter().any(|m| matches!(
            m,
            ServerMessage::Event(GameEvent::SetEnd { reason: SetEndReason::Forfeit, .. })
        )));
        assert_eq!(h.coord.status(&b), Some(Status::Idle));
        assert_eq!(h.coord.session_count(), 0);

        let alice = h.coord.store().get("alice").unwrap();
        let bob = h.coord.store().get("bob").unwrap();
        assert_eq!(alice.history.len(), 1);
        assert_eq!(bob.history.len(), 1);
        assert_eq!(bob.wins, 1);
        assert_eq!(bob.history[0].outcome, Outcome::Win);
        match &bob.history[0].detail {
            HistoryDetail::Contest { opponent, score, forfeit, .. } => {
                assert_eq!(opponent, "alice");
                assert_eq!(score, "0-0");
                assert!(*forfeit);
            }
            other => panic!("Wrong history detail: {:?}", other),
        }

        // a late report from the survivor is a stale no-op
        h.client(b, ClientMessage::ReportRoundLoss { round: None, stats: MatchStats::default() });
        assert_eq!(h.coord.store().get("bob").unwrap().history.len(), 1);
    }

    #[test]
    fn test_duel_set_persists_scores() {
        let mut h = Harness::new();
        let a = h.login("alice");
        let b = h.login("bob");
        h.duel(a, b);

        for round in 1..=6 {
            h.client(b, ClientMessage::ReportRoundLoss { round: Some(round), stats: MatchStats::default() });
            h.advance(Duration::from_secs(3));
        }

        let alice = h.coord.store().get("alice").unwrap();
        assert_eq!(alice.wins, 1);
        assert!(matches!(&alice.history[0].detail, HistoryDetail::Contest { score, forfeit: false, .. } if score == "6-0"));
        let bob = h.coord.store().get("bob").unwrap();
        assert!(matches!(&bob.history[0].detail, HistoryDetail::Contest { score, .. } if score == "0-6"));
        assert_eq!(h.coord.status(&a), Some(Status::Idle));
    }

    #[test]
    fn test_duel_challenge_flow() {
        let mut h = Harness::new();
        let a = h.login("alice");
        let b = h.login("bob");

        h.client(a, ClientMessage::Challenge { target: b, kind: QueueMode::Duel });
        assert!(h.drain(a).iter().any(|m| matches!(m, ServerMessage::ChallengeSent { .. })));
        assert!(h.drain(b).iter().any(|m| matches!(m, ServerMessage::ChallengeReceived { from, .. } if *from == a)));

        h.client(a, ClientMessage::Challenge { target: b, kind: QueueMode::Duel });
        assert_eq!(h.error_code(a), Some(ErrorCode::InvitationPending));

        h.client(b, ClientMessage::Accept { from: a });
        let session = h.coord.status(&a).and_then(|s| s.contest()).unwrap();
        assert_eq!(h.coord.status(&b), Some(Status::Duel(session)));

        // accepting twice is stale
        h.client(b, ClientMessage::Accept { from: a });
        assert_eq!(h.coord.session_count(), 1);

        // busy participants cannot be challenged
        let c = h.login("carol");
        h.client(c, ClientMessage::Challenge { target: a, kind: QueueMode::Duel });
        assert_eq!(h.error_code(c), Some(ErrorCode::TargetUnavailable));
    }

    #[test]
    fn test_challenge_expires_and_declines() {
        let mut h = Harness::new();
        let a = h.login("alice");
        let b = h.login("bob");

        h.client(a, ClientMessage::Challenge { target: b, kind: QueueMode::Duel });
        h.drain(a);
        h.advance(Duration::from_secs(60));
        assert!(h.drain(a).iter().any(|m| matches!(m, ServerMessage::ChallengeExpired { .. })));
        assert!(h.drain(b).iter().any(|m| matches!(m, ServerMessage::ChallengeExpired { .. })));

        h.client(a, ClientMessage::Challenge { target: b, kind: QueueMode::Duel });
        h.client(b, ClientMessage::Decline { from: a });
        assert!(h.drain(a).iter().any(|m| matches!(m, ServerMessage::ChallengeDeclined { by, .. } if *by == b)));

        h.client(b, ClientMessage::Accept { from: a });
        assert_eq!(h.coord.session_count(), 0);
    }

    #[test]
    fn test_team_invite_queues_pair() {
        let mut h = Harness::new();
        let a = h.login("alice");
        let b = h.login("bob");
        let c = h.login("carol");
        let d = h.login("dave");

        h.client(a, ClientMessage::Challenge { target: b, kind: QueueMode::Team });
        h.client(b, ClientMessage::Accept { from: a });
        assert_eq!(h.coord.status(&a), Some(Status::Queuing(QueueMode::Team)));
        assert_eq!(h.coord.status(&b), Some(Status::Queuing(QueueMode::Team)));

        h.client(c, ClientMessage::JoinQueue { mode: QueueMode::Team });
        h.client(d, ClientMessage::JoinQueue { mode: QueueMode::Team });
        h.coord.handle(Command::MatchmakingTick, h.now);

        let session = h.coord.status(&a).and_then(|s| s.contest()).unwrap();
        for id in [a, b, c, d] {
            assert_eq!(h.coord.status(&id), Some(Status::Team(session)));
        }
        let matched = h.drain(c).into_iter().find_map(|m| match m {
            ServerMessage::QueueMatched { teammates, opponents, .. } => Some((teammates, opponents)),
            _ => None,
        });
        let (teammates, opponents) = matched.unwrap();
        assert_eq!(teammates, vec!["dave".to_string()]);
        assert_eq!(opponents, vec!["alice".to_string(), "bob".to_string()]);
    }

    #[test]
    fn test_queue_entry_times_out() {
        let mut h = Harness::new();
        let a = h.login("alice");
        h.client(a, ClientMessage::JoinQueue { mode: QueueMode::Duel });
        assert!(matches!(h.drain(a)[0], ServerMessage::QueueJoined { position: 1, .. }));

        h.advance(Duration::from_secs(120));
        assert!(h.drain(a).iter().any(|m| matches!(m, ServerMessage::QueueCancelled { .. })));
        assert_eq!(h.coord.status(&a), Some(Status::Idle));
        assert_eq!(h.coord.queue_size(), 0);
    }

    #[test]
    fn test_lobby_attack_reaches_other_players() {
        let mut h = Harness::new();
        let ids: Vec<ParticipantId> = ["a", "b", "c"].iter().map(|n| h.login(n)).collect();
        for id in &ids {
            h.client(*id, ClientMessage::JoinLobby { mode: LobbyMode::Standard });
        }
        h.advance(Duration::from_secs(3));
        for id in &ids {
            h.drain(*id);
        }

        h.client(ids[0], ClientMessage::SendAttack { amount: 10, mode: AttackMode::Even });
        for target in &ids[1..] {
            let got: Vec<u32> = h
                .drain(*target)
                .into_iter()
                .filter_map(|m| match m {
                    ServerMessage::Event(GameEvent::ReceiveAttack { amount }) => Some(amount),
                    _ => None,
                })
                .collect();
            assert_eq!(got, vec![5]);
        }
        assert!(h.drain(ids[0]).is_empty());
    }

    #[test]
    fn test_submit_apm_and_stats() {
        let mut h = Harness::new();
        let a = h.login("alice");
        h.client(a, ClientMessage::SubmitApm { value: 80 });
        assert!(matches!(h.drain(a)[0], ServerMessage::BestApmUpdated { best_apm: 80 }));
        h.client(a, ClientMessage::SubmitApm { value: 60 });
        assert!(h.drain(a).is_empty());

        h.client(a, ClientMessage::RequestStats);
        match &h.drain(a)[0] {
            ServerMessage::AllStats { accounts } => assert_eq!(accounts[0].best_apm, 80),
            other => panic!("Wrong message type: {:?}", other),
        }
    }

    #[test]
    fn test_old_invitation_cannot_pull_sender_out_of_contest() {
        let mut h = Harness::new();
        let a = h.login("alice");
        let b = h.login("bob");
        let c = h.login("carol");

        h.client(a, ClientMessage::Challenge { target: b, kind: QueueMode::Duel });
        h.drain(b);
        let session = h.duel(a, c);
        assert!(h.coord.challenges.is_empty());
        assert!(h.drain(b).iter().any(|m| matches!(m, ServerMessage::ChallengeExpired { from, .. } if *from == a)));

        h.client(c, ClientMessage::ReportRoundLoss { round: Some(1), stats: MatchStats::default() });
        h.client(b, ClientMessage::Accept { from: a });

        assert_eq!(h.coord.session_count(), 1);
        assert_eq!(h.coord.status(&a), Some(Status::Duel(session)));
        assert_eq!(h.coord.status(&b), Some(Status::Idle));
        assert!(h.coord.store().get("carol").unwrap().history.is_empty());

        // nobody in a contest may send invitations
        h.drain(a);
        h.client(a, ClientMessage::Challenge { target: b, kind: QueueMode::Duel });
        assert_eq!(h.error_code(a), Some(ErrorCode::InvalidInput));
        assert!(h.coord.challenges.is_empty());
    }

    #[test]
    fn test_joining_lobby_withdraws_invitation() {
        let mut h = Harness::new();
        let a = h.login("alice");
        let b = h.login("bob");

        h.client(a, ClientMessage::Challenge { target: b, kind: QueueMode::Team });
        h.client(a, ClientMessage::JoinLobby { mode: LobbyMode::Mutator });
        assert!(h.coord.challenges.is_empty());

        h.client(b, ClientMessage::Accept { from: a });
        assert_eq!(h.coord.status(&a), Some(Status::Lobby(LobbyMode::Mutator)));
        assert_eq!(h.coord.queue_size(), 0);
    }

    #[test]
    fn test_leave_cancels_invitations() {
        let mut h = Harness::new();
        let a = h.login("alice");
        let b = h.login("bob");

        h.client(a, ClientMessage::Challenge { target: b, kind: QueueMode::Duel });
        h.drain(a);
        h.drain(b);
        h.client(a, ClientMessage::Leave);

        assert!(h.coord.challenges.is_empty());
        assert!(h.coord.next_deadline().is_none());
        assert!(h.drain(b).iter().any(|m| matches!(m, ServerMessage::ChallengeExpired { .. })));

        h.advance(Duration::from_secs(60));
        assert!(h.drain(a).is_empty());
        h.client(b, ClientMessage::Accept { from: a });
        assert_eq!(h.coord.session_count(), 0);
    }

    #[test]
    fn test_lobby_resolution_persists_once() {
        let flushes = Arc::new(AtomicUsize::new(0));
        let store = CountingStore { inner: MemoryStore::new(), flushes: flushes.clone() };
        let mut h = Harness::with_store(Box::new(store));
        let ids: Vec<ParticipantId> = ["a", "b", "c"].iter().map(|n| h.login(n)).collect();
        assert_eq!(flushes.load(Ordering::SeqCst), 3);

        for id in &ids {
            h.client(*id, ClientMessage::JoinLobby { mode: LobbyMode::Standard });
        }
        h.advance(Duration::from_secs(3));
        h.client(ids[0], ClientMessage::ReportElimination { stats: MatchStats::default() });
        h.client(ids[1], ClientMessage::ReportElimination { stats: MatchStats::default() });
        h.client(ids[2], ClientMessage::ReportWin { stats: MatchStats::default() });
        h.advance(Duration::from_secs(1));

        for name in ["a", "b", "c"] {
            assert_eq!(h.coord.store().get(name).unwrap().history.len(), 1);
        }
        assert_eq!(flushes.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_random_joins_keep_single_membership() {
        let mut h = Harness::new();
        let ids: Vec<ParticipantId> = (0..6).map(|n| h.login(&format!("p{}", n))).collect();
        let mut rng = StdRng::seed_from_u64(11);

        for _ in 0..400 {
            let id = ids[rng.gen_range(0..ids.len())];
            let msg = match rng.gen_range(0..6) {
                0 => ClientMessage::JoinLobby { mode: LobbyMode::Standard },
                1 => ClientMessage::JoinLobby { mode: LobbyMode::Mutator },
                2 => ClientMessage::JoinQueue { mode: QueueMode::Duel },
                3 => ClientMessage::JoinQueue { mode: QueueMode::Team },
                4 => ClientMessage::Leave,
                _ => ClientMessage::ReportRoundLoss { round: None, stats: MatchStats::default() },
            };
            h.client(id, msg);
            if rng.gen_bool(0.2) {
                h.coord.handle(Command::MatchmakingTick, h.now);
            }
            h.advance(Duration::from_millis(rng.gen_range(0..2000)));

            for id in &ids {
                let status = h.coord.status(id).unwrap();
                let in_lobbies: Vec<LobbyMode> = LobbyMode::ALL
                    .iter()
                    .copied()
                    .filter(|mode| h.coord.lobby(*mode).unwrap().is_member(id))
                    .collect();
                let queued = h.coord.queues.mode_of(*id);
                let contest = h
                    .coord
                    .sessions
                    .contests()
                    .filter(|c| c.is_active() && c.side_of(*id).is_some())
                    .count();

                match status {
                    Status::Idle => assert!(in_lobbies.is_empty() && queued.is_none() && contest == 0),
                    Status::Lobby(mode) => assert!(in_lobbies == vec![mode] && queued.is_none() && contest == 0),
                    Status::Queuing(mode) => assert!(in_lobbies.is_empty() && queued == Some(mode) && contest == 0),
                    Status::Duel(_) | Status::Team(_) => assert!(in_lobbies.is_empty() && queued.is_none() && contest == 1),
                }
            }
        }
    }
}
