//! Account Store
//!
//! Durable per-name records: credential digest, win counter, best metrics and
//! an append-only match history. Read on authentication, written only when a
//! lobby round or contest resolves.
//!
//! [`AccountBook`] holds the records and the rules for updating them; the
//! backends decide where the book lives.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};
use thiserror::Error;

use crate::game::state::{LobbyMode, MatchStats, QueueMode};

pub mod memory;
pub mod json_file;

pub use memory::MemoryStore;
pub use json_file::JsonFileStore;

/// Leaderboard length pushed to clients.
pub const LEADERBOARD_SIZE: usize = 5;

/// Store failures.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Reading or writing the backing file failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// The backing file is not a valid account book.
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    /// No account with this name.
    #[error("unknown account: {0}")]
    UnknownAccount(String),
    /// Registration for a name that already exists.
    #[error("account already exists: {0}")]
    AlreadyExists(String),
    /// The background writer has exited.
    #[error("account writer stopped")]
    WriterClosed,
}

/// Win or loss, from the account's point of view.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Won the round or set.
    Win,
    /// Lost the round or set.
    Loss,
}

/// Where a history entry came from.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum HistoryDetail {
    /// A battle lobby round.
    Lobby {
        /// Lobby variant.
        mode: LobbyMode,
        /// 1-based placement.
        place: u32,
        /// Self-reported stats.
        stats: MatchStats,
    },
    /// A duel or team set.
    Contest {
        /// Duel or team.
        kind: QueueMode,
        /// Opposing names joined with " & ".
        opponent: String,
        /// Final score from this account's side, e.g. "7-5".
        score: String,
        /// Ended by forfeit.
        forfeit: bool,
    },
}

/// One finished match.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// When it resolved.
    pub date: DateTime<Utc>,
    /// Win or loss.
    pub outcome: Outcome,
    /// Source specific details.
    #[serde(flatten)]
    pub detail: HistoryDetail,
}

/// A stored account.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccountRecord {
    /// Per-account salt.
    pub salt: String,
    /// Salted secret digest; empty for token-only accounts.
    pub secret_digest: String,
    /// Lobby and contest wins.
    pub wins: u32,
    /// Best attack lines per minute.
    pub best_apm: u32,
    /// Longest combo.
    pub best_combo: u32,
    /// Append-only match history.
    pub history: Vec<HistoryEntry>,
}

/// What other players may see of an account.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PublicRecord {
    /// Display name.
    pub name: String,
    /// Wins.
    pub wins: u32,
    /// Best APM.
    pub best_apm: u32,
    /// Best combo.
    pub best_combo: u32,
    /// Match history.
    pub history: Vec<HistoryEntry>,
}

/// Ranked metric.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    /// Win counter.
    Wins,
    /// Best combo (zero entries excluded).
    BestCombo,
    /// Best APM (zero entries excluded).
    BestApm,
}

/// One leaderboard row.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderboardEntry {
    /// Display name.
    pub name: String,
    /// Metric value.
    pub value: u32,
}

/// A result to fold into an account.
#[derive(Clone, Debug)]
pub struct ResultDelta {
    /// Counts towards the win counter.
    pub won: bool,
    /// Stats that may raise the best metrics.
    pub stats: Option<MatchStats>,
    /// History entry to append.
    pub entry: HistoryEntry,
}

/// The small read/update/leaderboard contract the orchestration core needs.
pub trait AccountStore: Send {
    /// Look up an account.
    fn get(&self, name: &str) -> Option<&AccountRecord>;

    /// Create an account. Fails if the name is taken.
    fn register(&mut self, name: &str, record: AccountRecord) -> Result<(), StoreError>;

    /// Fold a finished match into an account.
    fn apply_result(&mut self, name: &str, delta: ResultDelta) -> Result<(), StoreError>;

    /// Raise the best APM. Returns the new best if it changed.
    fn raise_best_apm(&mut self, name: &str, apm: u32) -> Result<Option<u32>, StoreError>;

    /// Top `n` accounts by `metric`.
    fn top_n(&self, metric: Metric, n: usize) -> Vec<LeaderboardEntry>;

    /// Every account's public view.
    fn public_records(&self) -> Vec<PublicRecord>;

    /// Hand pending changes to durable storage.
    fn flush(&mut self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// In-memory account records, keyed by display name.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountBook {
    accounts: BTreeMap<String, AccountRecord>,
}

impl AccountBook {
    /// Empty book.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of accounts.
    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    /// True if there are no accounts.
    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }

    /// Look up an account.
    pub fn get(&self, name: &str) -> Option<&AccountRecord> {
        self.accounts.get(name)
    }

    /// Create an account.
    pub fn register(&mut self, name: &str, record: AccountRecord) -> Result<(), StoreError> {
        if self.accounts.contains_key(name) {
            return Err(StoreError::AlreadyExists(name.to_string()));
        }
        self.accounts.insert(name.to_string(), record);
        Ok(())
    }

    /// Fold a finished match into an account.
    pub fn apply_result(&mut self, name: &str, delta: ResultDelta) -> Result<(), StoreError> {
        let record = self
            .accounts
            .get_mut(name)
            .ok_or_else(|| StoreError::UnknownAccount(name.to_string()))?;

        if delta.won {
            record.wins += 1;
        }
        if let Some(stats) = delta.stats {
            record.best_apm = record.best_apm.max(stats.apm);
            record.best_combo = record.best_combo.max(stats.max_combo);
        }
        record.history.push(delta.entry);
        Ok(())
    }

    /// Raise the best APM if `apm` beats it.
    pub fn raise_best_apm(&mut self, name: &str, apm: u32) -> Result<Option<u32>, StoreError> {
        let record = self
            .accounts
            .get_mut(name)
            .ok_or_else(|| StoreError::UnknownAccount(name.to_string()))?;
        if apm > record.best_apm {
            record.best_apm = apm;
            return Ok(Some(apm));
        }
        Ok(None)
    }

    /// Top `n` by `metric`, ties broken by name.
    pub fn top_n(&self, metric: Metric, n: usize) -> Vec<LeaderboardEntry> {
        let mut rows: Vec<LeaderboardEntry> = self
            .accounts
            .iter()
            .map(|(name, record)| LeaderboardEntry {
                name: name.clone(),
                value: match metric {
                    Metric::Wins => record.wins,
                    Metric::BestCombo => record.best_combo,
                    Metric::BestApm => record.best_apm,
                },
            })
            .filter(|row| metric == Metric::Wins || row.value > 0)
            .collect();
        // stable sort keeps name order among equal values
        rows.sort_by(|a, b| b.value.cmp(&a.value));
        rows.truncate(n);
        rows
    }

    /// Every account's public view.
    pub fn public_records(&self) -> Vec<PublicRecord> {
        self.accounts
            .iter()
            .map(|(name, record)| PublicRecord {
                name: name.clone(),
                wins: record.wins,
                best_apm: record.best_apm,
                best_combo: record.best_combo,
                history: record.history.clone(),
            })
            .collect()
    }
}
