//! Volatile account store, used when no accounts file is configured and in tests.

use super::{AccountBook, AccountRecord, AccountStore, LeaderboardEntry, Metric, PublicRecord, ResultDelta, StoreError};

/// Accounts kept only for the life of the process.
#[derive(Debug, Default)]
pub struct MemoryStore {
    book: AccountBook,
}

impl MemoryStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store seeded with an existing book.
    pub fn with_book(book: AccountBook) -> Self {
        Self { book }
    }
}

impl AccountStore for MemoryStore {
    fn get(&self, name: &str) -> Option<&AccountRecord> {
        self.book.get(name)
    }

    fn register(&mut self, name: &str, record: AccountRecord) -> Result<(), StoreError> {
        self.book.register(name, record)
    }

    fn apply_result(&mut self, name: &str, delta: ResultDelta) -> Result<(), StoreError> {
        self.book.apply_result(name, delta)
    }

    fn raise_best_apm(&mut self, name: &str, apm: u32) -> Result<Option<u32>, StoreError> {
        self.book.raise_best_apm(name, apm)
    }

    fn top_n(&self, metric: Metric, n: usize) -> Vec<LeaderboardEntry> {
        self.book.top_n(metric, n)
    }

    fn public_records(&self) -> Vec<PublicRecord> {
        self.book.public_records()
    }
}
