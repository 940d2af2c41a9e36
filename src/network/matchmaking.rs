//! Matchmaking Queues
//!
//! One FIFO per contest shape. Duel entries are single participants; team
//! entries are either a pre-formed pair (from an accepted invite) or a single
//! participant who gets paired with the next solo entry. A periodic tick pairs
//! entries off into contest sides.
//!
//! Every entry carries an expiry timer, cancelled on every path that removes
//! the entry.

use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::core::{TimerHandle, TimerQueue};
use crate::game::events::{RosterEntry, TimerKey};
use crate::game::state::{ParticipantId, QueueMode};

/// Queue settings.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Entries waiting longer are dropped.
    pub entry_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            entry_timeout: Duration::from_secs(120),
        }
    }
}

/// A queued participant or pre-formed team.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    /// One member, or two for a pre-formed team. The first is the leader.
    pub members: Vec<RosterEntry>,
    /// When the entry was queued.
    pub joined_at: Instant,
    expiry: Option<TimerHandle>,
}

impl QueueEntry {
    /// Leader id; expiry timers are keyed by it.
    pub fn leader(&self) -> ParticipantId {
        self.members[0].id
    }

    /// Whether `id` is part of this entry.
    pub fn contains(&self, id: ParticipantId) -> bool {
        self.members.iter().any(|m| m.id == id)
    }

    /// Member ids.
    pub fn ids(&self) -> Vec<ParticipantId> {
        self.members.iter().map(|m| m.id).collect()
    }
}

/// Two sides ready to play.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pairing {
    /// Contest shape.
    pub mode: QueueMode,
    /// The two sides.
    pub sides: [Vec<RosterEntry>; 2],
}

/// Result of one matchmaking tick.
#[derive(Debug, Default)]
pub struct TickOutcome {
    /// New contests to create.
    pub pairings: Vec<Pairing>,
    /// Entries removed because a member vanished.
    pub dropped: Vec<(QueueMode, QueueEntry)>,
}

/// The duel and team queues.
#[derive(Debug, Default)]
pub struct MatchmakingQueues {
    config: QueueConfig,
    queues: BTreeMap<QueueMode, VecDeque<QueueEntry>>,
}

impl MatchmakingQueues {
    /// Empty queues.
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            queues: BTreeMap::new(),
        }
    }

    /// Append an entry. The caller evicts its members from everything else first.
    ///
    /// Returns the 1-based queue position, or None if the entry does not fit
    /// the mode.
    pub fn enqueue(
        &mut self,
        timers: &mut TimerQueue<TimerKey>,
        now: Instant,
        mode: QueueMode,
        members: Vec<RosterEntry>,
    ) -> Option<usize> {
        let fits = match mode {
            QueueMode::Duel => members.len() == 1,
            QueueMode::Team => members.len() == 1 || members.len() == 2,
        };
        if !fits || members.iter().any(|m| self.mode_of(m.id).is_some()) {
            return None;
        }

        let leader = members[0].id;
        let expiry = timers.schedule(now + self.config.entry_timeout, TimerKey::QueueExpiry(leader));
        let queue = self.queues.entry(mode).or_default();
        queue.push_back(QueueEntry { members, joined_at: now, expiry: Some(expiry) });
        debug!("{} queued for {:?}, position {}", leader.short(), mode, queue.len());
        Some(queue.len())
    }

    /// Which queue `id` is waiting in.
    pub fn mode_of(&self, id: ParticipantId) -> Option<QueueMode> {
        self.queues
            .iter()
            .find(|(_, queue)| queue.iter().any(|e| e.contains(id)))
            .map(|(mode, _)| *mode)
    }

    /// Remove the entry containing `id`. A team entry goes as a whole.
    pub fn remove(&mut self, timers: &mut TimerQueue<TimerKey>, id: ParticipantId) -> Option<(QueueMode, QueueEntry)> {
        for (mode, queue) in self.queues.iter_mut() {
            if let Some(index) = queue.iter().position(|e| e.contains(id)) {
                let mut entry = queue.remove(index)?;
                timers.disarm(&mut entry.expiry);
                return Some((*mode, entry));
            }
        }
        None
    }

    /// Handle a fired expiry timer. Stale handles are ignored.
    pub fn on_expiry(
        &mut self,
        timers: &mut TimerQueue<TimerKey>,
        handle: TimerHandle,
        leader: ParticipantId,
    ) -> Option<(QueueMode, QueueEntry)> {
        let current = self
            .queues
            .values()
            .flatten()
            .any(|e| e.leader() == leader && e.expiry == Some(handle));
        if !current {
            return None;
        }
        let removed = self.remove(timers, leader);
        if let Some((mode, _)) = &removed {
            info!("{} expired from {:?} queue", leader.short(), mode);
        }
        removed
    }

    /// Remove entries with any member no longer connected.
    pub fn drop_disconnected(
        &mut self,
        timers: &mut TimerQueue<TimerKey>,
        is_connected: impl Fn(&ParticipantId) -> bool,
    ) -> Vec<(QueueMode, QueueEntry)> {
        let mut dropped = Vec::new();
        for (mode, queue) in self.queues.iter_mut() {
            let mut kept = VecDeque::with_capacity(queue.len());
            for mut entry in queue.drain(..) {
                if entry.members.iter().all(|m| is_connected(&m.id)) {
                    kept.push_back(entry);
                } else {
                    timers.disarm(&mut entry.expiry);
                    dropped.push((*mode, entry));
                }
            }
            *queue = kept;
        }
        dropped
    }

    /// Drop entries with vanished members, then pair off what remains.
    pub fn tick(
        &mut self,
        timers: &mut TimerQueue<TimerKey>,
        is_connected: impl Fn(&ParticipantId) -> bool,
    ) -> TickOutcome {
        let mut outcome = TickOutcome {
            dropped: self.drop_disconnected(timers, is_connected),
            ..Default::default()
        };

        for (mode, queue) in self.queues.iter_mut() {
            while let Some(picked) = Self::next_sides(*mode, queue) {
                let mut sides: [Vec<RosterEntry>; 2] = [Vec::new(), Vec::new()];
                for (side, indices) in picked.iter().enumerate() {
                    for &i in indices {
                        sides[side].extend(queue[i].members.iter().cloned());
                    }
                }
                let mut taken: Vec<usize> = picked.iter().flatten().copied().collect();
                taken.sort_unstable_by(|a, b| b.cmp(a));
                for i in taken {
                    if let Some(mut entry) = queue.remove(i) {
                        timers.disarm(&mut entry.expiry);
                    }
                }
                info!("{:?} paired: {} vs {}", mode, sides[0].len(), sides[1].len());
                outcome.pairings.push(Pairing { mode: *mode, sides });
            }
        }
        outcome
    }

    /// Entry indices for the next two sides, in FIFO order.
    fn next_sides(mode: QueueMode, queue: &VecDeque<QueueEntry>) -> Option<[Vec<usize>; 2]> {
        let mut sides: Vec<Vec<usize>> = Vec::new();
        let mut solo: Option<usize> = None;

        for (i, entry) in queue.iter().enumerate() {
            match (mode, entry.members.len()) {
                (QueueMode::Duel, _) | (QueueMode::Team, 2) => sides.push(vec![i]),
                (QueueMode::Team, _) => match solo.take() {
                    Some(first) => sides.push(vec![first, i]),
                    None => solo = Some(i),
                },
            }
            if sides.len() == 2 {
                let second = sides.pop()?;
                let first = sides.pop()?;
                return Some([first, second]);
            }
        }
        None
    }

    /// Entries waiting in `mode`.
    pub fn len(&self, mode: QueueMode) -> usize {
        self.queues.get(&mode).map(|q| q.len()).unwrap_or(0)
    }

    /// True if both queues are empty.
    pub fn is_empty(&self) -> bool {
        self.queues.values().all(|q| q.is_empty())
    }
}
