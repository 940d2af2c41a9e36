//! Presence Registry
//!
//! Every authenticated participant and the one thing they are doing right
//! now. Display names are unique among online participants.

use std::collections::HashMap;
use std::time::Instant;

use thiserror::Error;

use crate::game::state::{ParticipantId, Status};
use crate::network::protocol::OnlineEntry;

/// Registration failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PresenceError {
    /// The display name is already bound to another connection.
    #[error("{0} is already online")]
    AlreadyOnline(String),
    /// This connection already authenticated.
    #[error("connection already authenticated")]
    AlreadyRegistered,
}

/// An authenticated participant.
#[derive(Debug, Clone)]
pub struct Participant {
    /// Connection-scoped id.
    pub id: ParticipantId,
    /// Durable identity.
    pub name: String,
    /// Current activity.
    pub status: Status,
    /// Authentication time.
    pub since: Instant,
}

/// Who is online and what they are doing.
#[derive(Debug, Default)]
pub struct PresenceRegistry {
    by_id: HashMap<ParticipantId, Participant>,
    by_name: HashMap<String, ParticipantId>,
}

impl PresenceRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a connection to a display name, starting idle.
    pub fn register(&mut self, id: ParticipantId, name: &str, now: Instant) -> Result<(), PresenceError> {
        if self.by_id.contains_key(&id) {
            return Err(PresenceError::AlreadyRegistered);
        }
        if self.by_name.contains_key(name) {
            return Err(PresenceError::AlreadyOnline(name.to_string()));
        }
        self.by_name.insert(name.to_string(), id);
        self.by_id.insert(id, Participant {
            id,
            name: name.to_string(),
            status: Status::Idle,
            since: now,
        });
        Ok(())
    }

    /// Forget a participant, freeing their name.
    pub fn remove(&mut self, id: &ParticipantId) -> Option<Participant> {
        let participant = self.by_id.remove(id)?;
        self.by_name.remove(&participant.name);
        Some(participant)
    }

    /// Look up a participant.
    pub fn get(&self, id: &ParticipantId) -> Option<&Participant> {
        self.by_id.get(id)
    }

    /// Whether `id` is authenticated and connected.
    pub fn contains(&self, id: &ParticipantId) -> bool {
        self.by_id.contains_key(id)
    }

    /// Online participant using `name`.
    pub fn by_name(&self, name: &str) -> Option<ParticipantId> {
        self.by_name.get(name).copied()
    }

    /// Display name of `id`.
    pub fn name_of(&self, id: &ParticipantId) -> Option<&str> {
        self.by_id.get(id).map(|p| p.name.as_str())
    }

    /// Current status of `id`.
    pub fn status(&self, id: &ParticipantId) -> Option<Status> {
        self.by_id.get(id).map(|p| p.status)
    }

    /// Replace the status of `id`. Returns false if not online.
    pub fn set_status(&mut self, id: &ParticipantId, status: Status) -> bool {
        match self.by_id.get_mut(id) {
            Some(p) => {
                p.status = status;
                true
            }
            None => false,
        }
    }

    /// Every online participant id.
    pub fn ids(&self) -> Vec<ParticipantId> {
        self.by_id.keys().copied().collect()
    }

    /// Online roster, sorted by name.
    pub fn online(&self) -> Vec<OnlineEntry> {
        let mut entries: Vec<OnlineEntry> = self
            .by_id
            .values()
            .map(|p| OnlineEntry { id: p.id, name: p.name.clone(), status: p.status })
            .collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        entries
    }

    /// Number of online participants.
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    /// True if nobody is online.
    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}
