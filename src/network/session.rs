//! Contest Session Management
//!
//! Registry of live duel and team contests. Contests are created from
//! matchmaking pairings or accepted duel challenges and discarded once they
//! end.

use std::collections::BTreeMap;

use tracing::info;

use crate::core::TimerHandle;
use crate::game::contest::{Contest, ContestConfig};
use crate::game::events::RosterEntry;
use crate::game::state::{ParticipantId, QueueMode, SessionId};
use crate::game::Ctx;

/// Live contests.
#[derive(Debug, Default)]
pub struct SessionManager {
    config: ContestConfig,
    contests: BTreeMap<SessionId, Contest>,
}

impl SessionManager {
    /// Create new session manager.
    pub fn new(config: ContestConfig) -> Self {
        Self {
            config,
            contests: BTreeMap::new(),
        }
    }

    /// Create a contest and start its first round.
    pub fn create(&mut self, ctx: &mut Ctx<'_>, kind: QueueMode, sides: [Vec<RosterEntry>; 2]) -> SessionId {
        let id = SessionId::random();
        let mut contest = Contest::new(id, kind, sides, self.config.clone());
        contest.begin(ctx);
        self.contests.insert(id, contest);
        id
    }

    /// Get a contest by ID.
    pub fn get(&self, id: &SessionId) -> Option<&Contest> {
        self.contests.get(id)
    }

    /// Get a contest by ID, mutably.
    pub fn get_mut(&mut self, id: &SessionId) -> Option<&mut Contest> {
        self.contests.get_mut(id)
    }

    /// Every live contest.
    pub fn contests(&self) -> impl Iterator<Item = &Contest> {
        self.contests.values()
    }

    /// Route a round-gap timer to its contest.
    pub fn on_timer(&mut self, ctx: &mut Ctx<'_>, id: SessionId, handle: TimerHandle) -> bool {
        match self.contests.get_mut(&id) {
            Some(contest) => contest.on_timer(ctx, handle),
            None => false,
        }
    }

    /// Abandon and drop contests with no connected member left.
    pub fn drop_orphaned(&mut self, ctx: &mut Ctx<'_>, is_connected: impl Fn(&ParticipantId) -> bool) -> Vec<SessionId> {
        let orphaned: Vec<SessionId> = self
            .contests
            .values()
            .filter(|c| c.member_ids().iter().all(|id| !is_connected(id)))
            .map(|c| c.id())
            .collect();

        for id in &orphaned {
            if let Some(mut contest) = self.contests.remove(id) {
                contest.abandon(ctx);
            }
        }
        orphaned
    }

    /// Discard contests that have ended.
    pub fn cleanup(&mut self) -> usize {
        let before = self.contests.len();
        self.contests.retain(|_, c| c.is_active());
        let removed = before - self.contests.len();
        if removed > 0 {
            info!("discarded {} finished contests", removed);
        }
        removed
    }

    /// Get active session count.
    pub fn count(&self) -> usize {
        self.contests.len()
    }
}
