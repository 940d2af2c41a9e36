//! Session Watchdog
//!
//! Periodic consistency sweep over everything the coordinator owns. Catches
//! silent players, lost elimination reports, countdowns that lost their
//! timer and sessions whose members all vanished.

use std::time::Instant;

use tracing::info;

use crate::game::events::{EliminationCause, Outbox};
use crate::game::state::{ParticipantId, Status};
use crate::network::coordinator::Coordinator;
use crate::network::protocol::ServerMessage;

/// What one sweep changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Lobby members eliminated and kicked for inactivity.
    pub inactive: usize,
    /// Empty lobbies returned to waiting.
    pub lobbies_reset: usize,
    /// Rounds resolved because at most one member was left alive.
    pub forced_resolutions: usize,
    /// Countdowns repaired.
    pub countdowns_recovered: usize,
    /// Lobby members whose presence no longer points at the lobby.
    pub stale_members: usize,
    /// Queue entries dropped for disconnected members.
    pub queue_entries_dropped: usize,
    /// Contests discarded with no connected member.
    pub orphaned_sessions: usize,
}

impl SweepReport {
    /// True if the sweep changed anything.
    pub fn is_eventful(&self) -> bool {
        *self != SweepReport::default()
    }
}

impl Coordinator {
    /// Run one watchdog pass at `now`.
    pub fn sweep(&mut self, now: Instant) -> SweepReport {
        let mut report = SweepReport::default();
        let mut out = Outbox::default();

        for (mode, lobby) in self.lobbies.iter_mut() {
            let mut ctx = self.services.ctx(now, &mut out);

            report.inactive += lobby.sweep_inactive(&mut ctx).len();

            let stale: Vec<ParticipantId> = lobby
                .member_ids()
                .into_iter()
                .filter(|id| self.presence.status(id) != Some(Status::Lobby(*mode)))
                .collect();
            for id in stale {
                if lobby.leave(&mut ctx, id, EliminationCause::Disconnect) {
                    report.stale_members += 1;
                }
            }

            if lobby.reset_if_abandoned(&mut ctx) {
                report.lobbies_reset += 1;
            }
            if lobby.force_win_check(&mut ctx) {
                report.forced_resolutions += 1;
            }
            if lobby.recover_countdown(&mut ctx) {
                report.countdowns_recovered += 1;
            }
        }

        let presence = &self.presence;
        let dropped = self
            .queues
            .drop_disconnected(&mut self.services.timers, |id| presence.contains(id));
        report.queue_entries_dropped = dropped.len();
        for (mode, entry) in dropped {
            for id in entry.ids() {
                if self.presence.set_status(&id, Status::Idle) {
                    self.send(id, ServerMessage::QueueCancelled {
                        mode,
                        reason: "partner disconnected".to_string(),
                    });
                }
            }
        }

        {
            let presence = &self.presence;
            let mut ctx = self.services.ctx(now, &mut out);
            report.orphaned_sessions = self
                .sessions
                .drop_orphaned(&mut ctx, |id| presence.contains(id))
                .len();
        }

        if report.is_eventful() {
            info!("watchdog sweep: {:?}", report);
        }
        self.apply(out, now);
        report
    }
}
