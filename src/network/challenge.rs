//! Challenge Broker
//!
//! Peer-to-peer invitations: a duel challenge or a team-up invite. One
//! outstanding invitation per sender, each with a cancellable expiry timer.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::debug;

use crate::core::{TimerHandle, TimerQueue};
use crate::game::events::TimerKey;
use crate::game::state::{ParticipantId, QueueMode};

/// Invitation settings.
#[derive(Debug, Clone)]
pub struct ChallengeConfig {
    /// Invitation lifetime.
    pub timeout: Duration,
}

impl Default for ChallengeConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
        }
    }
}

/// Why an invitation was refused locally.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChallengeError {
    /// The sender already has an outstanding invitation.
    #[error("an invitation is already pending")]
    AlreadyPending,
    /// Target is offline or in a contest.
    #[error("target unavailable")]
    TargetUnavailable,
    /// Sender and target are the same participant.
    #[error("cannot challenge yourself")]
    SelfChallenge,
    /// Sender is already playing a contest.
    #[error("finish your current match first")]
    SenderBusy,
}

/// An outstanding invitation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invitation {
    /// Sender.
    pub from: ParticipantId,
    /// Invited participant.
    pub to: ParticipantId,
    /// Duel challenge or team invite.
    pub kind: QueueMode,
    /// When it was sent.
    pub sent_at: Instant,
    expiry: TimerHandle,
}

/// Pending invitations, keyed by sender.
#[derive(Debug, Default)]
pub struct ChallengeBroker {
    config: ChallengeConfig,
    pending: BTreeMap<ParticipantId, Invitation>,
}

impl ChallengeBroker {
    /// Empty broker.
    pub fn new(config: ChallengeConfig) -> Self {
        Self {
            config,
            pending: BTreeMap::new(),
        }
    }

    /// Invitation lifetime.
    pub fn timeout(&self) -> Duration {
        self.config.timeout
    }

    /// Register an invitation. Target availability is checked by the caller.
    pub fn challenge(
        &mut self,
        timers: &mut TimerQueue<TimerKey>,
        now: Instant,
        from: ParticipantId,
        to: ParticipantId,
        kind: QueueMode,
    ) -> Result<Invitation, ChallengeError> {
        if from == to {
            return Err(ChallengeError::SelfChallenge);
        }
        if self.pending.contains_key(&from) {
            return Err(ChallengeError::AlreadyPending);
        }

        let expiry = timers.schedule(now + self.config.timeout, TimerKey::ChallengeExpiry(from));
        let invitation = Invitation { from, to, kind, sent_at: now, expiry };
        self.pending.insert(from, invitation.clone());
        debug!("{} invited {} ({:?})", from.short(), to.short(), kind);
        Ok(invitation)
    }

    /// Take the invitation from `from` if it targets `to`.
    fn take(&mut self, timers: &mut TimerQueue<TimerKey>, from: ParticipantId, to: ParticipantId) -> Option<Invitation> {
        if self.pending.get(&from)?.to != to {
            return None;
        }
        let invitation = self.pending.remove(&from)?;
        timers.cancel(invitation.expiry);
        Some(invitation)
    }

    /// `to` accepts the invitation sent by `from`.
    pub fn accept(&mut self, timers: &mut TimerQueue<TimerKey>, from: ParticipantId, to: ParticipantId) -> Option<Invitation> {
        self.take(timers, from, to)
    }

    /// `to` declines the invitation sent by `from`.
    pub fn decline(&mut self, timers: &mut TimerQueue<TimerKey>, from: ParticipantId, to: ParticipantId) -> Option<Invitation> {
        self.take(timers, from, to)
    }

    /// Cancel the invitation sent by `from`, whatever its target.
    pub fn withdraw(&mut self, timers: &mut TimerQueue<TimerKey>, from: ParticipantId) -> Option<Invitation> {
        let invitation = self.pending.remove(&from)?;
        timers.cancel(invitation.expiry);
        debug!("{} withdrew invitation to {}", from.short(), invitation.to.short());
        Some(invitation)
    }

    /// Handle a fired expiry timer. Stale handles are ignored.
    pub fn on_expiry(&mut self, handle: TimerHandle, from: ParticipantId) -> Option<Invitation> {
        if self.pending.get(&from)?.expiry != handle {
            return None;
        }
        self.pending.remove(&from)
    }

    /// Drop every invitation sent by or to `id`.
    pub fn cancel_involving(&mut self, timers: &mut TimerQueue<TimerKey>, id: ParticipantId) -> Vec<Invitation> {
        let senders: Vec<ParticipantId> = self
            .pending
            .values()
            .filter(|inv| inv.from == id || inv.to == id)
            .map(|inv| inv.from)
            .collect();

        senders
            .into_iter()
            .filter_map(|from| self.pending.remove(&from))
            .inspect(|inv| {
                timers.cancel(inv.expiry);
            })
            .collect()
    }

    /// Outstanding invitation from `id`.
    pub fn pending_from(&self, id: ParticipantId) -> Option<&Invitation> {
        self.pending.get(&id)
    }

    /// Number of outstanding invitations.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// True if nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pid(n: u8) -> ParticipantId {
        ParticipantId::from_bytes([n; 16])
    }

    fn setup() -> (ChallengeBroker, TimerQueue<TimerKey>, Instant) {
        (ChallengeBroker::new(ChallengeConfig::default()), TimerQueue::new(), Instant::now())
    }

    #[test]
    fn test_one_pending_per_sender() {
        let (mut broker, mut timers, now) = setup();
        broker.challenge(&mut timers, now, pid(1), pid(2), QueueMode::Duel).unwrap();
        assert_eq!(
            broker.challenge(&mut timers, now, pid(1), pid(3), QueueMode::Duel),
            Err(ChallengeError::AlreadyPending)
        );
        // someone else may still invite the same target
        assert!(broker.challenge(&mut timers, now, pid(3), pid(2), QueueMode::Team).is_ok());
        assert_eq!(broker.len(), 2);
    }

    #[test]
    fn test_self_challenge_rejected() {
        let (mut broker, mut timers, now) = setup();
        assert_eq!(
            broker.challenge(&mut timers, now, pid(1), pid(1), QueueMode::Duel),
            Err(ChallengeError::SelfChallenge)
        );
        assert!(timers.is_empty());
    }

    #[test]
    fn test_accept_clears_timer() {
        let (mut broker, mut timers, now) = setup();
        broker.challenge(&mut timers, now, pid(1), pid(2), QueueMode::Duel).unwrap();

        // wrong accepter is a stale reference
        assert!(broker.accept(&mut timers, pid(1), pid(3)).is_none());
        let invitation = broker.accept(&mut timers, pid(1), pid(2)).unwrap();
        assert_eq!(invitation.kind, QueueMode::Duel);
        assert!(timers.is_empty());
        assert!(broker.accept(&mut timers, pid(1), pid(2)).is_none());
    }

    #[test]
    fn test_decline() {
        let (mut broker, mut timers, now) = setup();
        broker.challenge(&mut timers, now, pid(1), pid(2), QueueMode::Team).unwrap();
        assert!(broker.decline(&mut timers, pid(1), pid(2)).is_some());
        assert!(broker.is_empty());
        assert!(timers.is_empty());
    }

    #[test]
    fn test_expiry() {
        let (mut broker, mut timers, now) = setup();
        broker.challenge(&mut timers, now, pid(1), pid(2), QueueMode::Duel).unwrap();

        assert!(timers.pop_due(now + Duration::from_secs(59)).is_empty());
        let due = timers.pop_due(now + Duration::from_secs(60));
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].1, TimerKey::ChallengeExpiry(pid(1)));

        let expired = broker.on_expiry(due[0].0, pid(1)).unwrap();
        assert_eq!(expired.to, pid(2));
        assert!(broker.on_expiry(due[0].0, pid(1)).is_none());
    }

    #[test]
    fn test_stale_expiry_after_reinvite() {
        let (mut broker, mut timers, now) = setup();
        broker.challenge(&mut timers, now, pid(1), pid(2), QueueMode::Duel).unwrap();
        let old = broker.pending_from(pid(1)).unwrap().expiry;
        broker.decline(&mut timers, pid(1), pid(2));
        broker.challenge(&mut timers, now, pid(1), pid(2), QueueMode::Duel).unwrap();

        assert!(broker.on_expiry(old, pid(1)).is_none());
        assert!(broker.pending_from(pid(1)).is_some());
    }

    #[test]
    fn test_cancel_involving() {
        let (mut broker, mut timers, now) = setup();
        broker.challenge(&mut timers, now, pid(1), pid(2), QueueMode::Duel).unwrap();
        broker.challenge(&mut timers, now, pid(3), pid(1), QueueMode::Duel).unwrap();
        broker.challenge(&mut timers, now, pid(4), pid(5), QueueMode::Duel).unwrap();

        let cancelled = broker.cancel_involving(&mut timers, pid(1));
        assert_eq!(cancelled.len(), 2);
        assert_eq!(broker.len(), 1);
        assert_eq!(timers.len(), 1);
    }

    #[test]
    fn test_withdraw_only_own_invitation() {
        let (mut broker, mut timers, now) = setup();
        broker.challenge(&mut timers, now, pid(1), pid(2), QueueMode::Duel).unwrap();
        broker.challenge(&mut timers, now, pid(3), pid(1), QueueMode::Duel).unwrap();

        let withdrawn = broker.withdraw(&mut timers, pid(1)).unwrap();
        assert_eq!(withdrawn.to, pid(2));
        assert!(broker.withdraw(&mut timers, pid(1)).is_none());
        // invitations addressed to the sender survive
        assert!(broker.pending_from(pid(3)).is_some());
        assert_eq!(timers.len(), 1);
        assert!(broker.accept(&mut timers, pid(1), pid(2)).is_none());
    }
}
