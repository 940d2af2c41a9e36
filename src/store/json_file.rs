//! JSON file account store.
//!
//! Mutations only touch the in-memory book. [`AccountStore::flush`] hands a
//! serialized snapshot to a dedicated writer thread, which writes it to a
//! sibling temp file and renames it over the original so a crash never leaves
//! a truncated file behind. Snapshots that pile up while a write is in flight
//! collapse into the newest one.

use std::fs::{self, File};
use std::io::{BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::{AccountBook, AccountRecord, AccountStore, LeaderboardEntry, Metric, PublicRecord, ResultDelta, StoreError};

/// Accounts persisted to a single JSON file.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    book: AccountBook,
    dirty: bool,
    writer: Option<mpsc::UnboundedSender<String>>,
    worker: Option<JoinHandle<()>>,
}

impl JsonFileStore {
    /// Load `path`, starting empty if it does not exist yet, and start the
    /// writer thread.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let book = match fs::read_to_string(&path) {
            Ok(text) if text.trim().is_empty() => AccountBook::new(),
            Ok(text) => serde_json::from_str(&text)?,
            Err(e) if e.kind() == ErrorKind::NotFound => AccountBook::new(),
            Err(e) => return Err(e.into()),
        };
        info!("loaded {} accounts from {}", book.len(), path.display());

        let (tx, rx) = mpsc::unbounded_channel();
        let target = path.clone();
        let worker = thread::Builder::new()
            .name("account-writer".into())
            .spawn(move || write_loop(target, rx))?;

        Ok(Self { path, book, dirty: false, writer: Some(tx), worker: Some(worker) })
    }

    /// Backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn write_loop(path: PathBuf, mut rx: mpsc::UnboundedReceiver<String>) {
    while let Some(mut snapshot) = rx.blocking_recv() {
        while let Ok(newer) = rx.try_recv() {
            snapshot = newer;
        }
        match write_atomic(&path, &snapshot) {
            Ok(()) => debug!("wrote {} bytes to {}", snapshot.len(), path.display()),
            Err(e) => error!("failed to write {}: {}", path.display(), e),
        }
    }
}

fn write_atomic(path: &Path, snapshot: &str) -> Result<(), StoreError> {
    let tmp = path.with_extension("json.tmp");
    {
        let mut w = BufWriter::new(File::create(&tmp)?);
        w.write_all(snapshot.as_bytes())?;
        w.flush()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

impl AccountStore for JsonFileStore {
    fn get(&self, name: &str) -> Option<&AccountRecord> {
        self.book.get(name)
    }

    fn register(&mut self, name: &str, record: AccountRecord) -> Result<(), StoreError> {
        self.book.register(name, record)?;
        self.dirty = true;
        Ok(())
    }

    fn apply_result(&mut self, name: &str, delta: ResultDelta) -> Result<(), StoreError> {
        self.book.apply_result(name, delta)?;
        self.dirty = true;
        Ok(())
    }

    fn raise_best_apm(&mut self, name: &str, apm: u32) -> Result<Option<u32>, StoreError> {
        let raised = self.book.raise_best_apm(name, apm)?;
        if raised.is_some() {
            self.dirty = true;
        }
        Ok(raised)
    }

    fn top_n(&self, metric: Metric, n: usize) -> Vec<LeaderboardEntry> {
        self.book.top_n(metric, n)
    }

    fn public_records(&self) -> Vec<PublicRecord> {
        self.book.public_records()
    }

    fn flush(&mut self) -> Result<(), StoreError> {
        if !self.dirty {
            return Ok(());
        }
        let snapshot = serde_json::to_string_pretty(&self.book)?;
        let writer = self.writer.as_ref().ok_or(StoreError::WriterClosed)?;
        writer.send(snapshot).map_err(|_| StoreError::WriterClosed)?;
        self.dirty = false;
        Ok(())
    }
}

impl Drop for JsonFileStore {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            warn!("final account flush failed: {}", e);
        }
        self.writer.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("account writer panicked");
            }
        }
    }
}
