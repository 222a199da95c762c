//! Durable termdb engine
//!
//! ```text
//!   mutation ──► apply to Engine ──► append WalEntry ──► return
//!                     │                    │
//!                     │ (log failed)       ▼
//!                     ◄──── rollback    termdb.wal ──(every N)──► termdb.snapshot
//!
//!   open: snapshot (if any) ──► replay wal ──► ready
//! ```
//!
//! ## Guarantees
//!
//! - A mutation that returns `Ok` is in the log (fsynced when `sync_writes`)
//! - A mutation whose log append fails leaves the engine and the log unchanged
//! - A snapshot records the last log entry it contains, so a crash between
//!   snapshot and log truncation replays nothing twice
//! - Reads never wait on the log

pub mod snapshot;
pub mod wal;

#[cfg(test)]
mod tests;

use std::fs;
use std::path::{Path as FsPath, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::{RwLock, RwLockReadGuard};
use serde::{Deserialize, Serialize};
use termdb_core::{Engine, Fact, FactId, Match, Path, Predicate, Taxonomy, TermId, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

pub use wal::{WalEntry, WriteAheadLog};

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt storage: {0}")]
    Codec(String),

    #[error(transparent)]
    Engine(#[from] termdb_core::Error),
}

impl StorageError {
    /// Whether retrying the same call might succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            StorageError::Io(_) => true,
            StorageError::Codec(_) => false,
            StorageError::Engine(e) => e.is_retryable(),
        }
    }
}

pub type Result<T, E = StorageError> = std::result::Result<T, E>;

// ============================================================================
// Configuration
// ============================================================================

/// Storage configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding the log and snapshot
    pub data_dir: PathBuf,
    /// Log file name inside `data_dir`
    pub wal_file: String,
    /// Snapshot file name inside `data_dir`
    pub snapshot_file: String,
    /// Logged mutations between automatic checkpoints (0 disables)
    pub checkpoint_every: usize,
    /// fsync every log append
    pub sync_writes: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./termdb"),
            wal_file: "termdb.wal".to_string(),
            snapshot_file: "termdb.snapshot".to_string(),
            checkpoint_every: 1024,
            sync_writes: true,
        }
    }
}

impl StorageConfig {
    /// Config rooted at `data_dir`, defaults elsewhere.
    pub fn in_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    /// Parse a JSON config; missing fields take their defaults.
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| StorageError::Codec(e.to_string()))
    }

    pub fn load(path: &FsPath) -> Result<Self> {
        Self::from_json(&fs::read_to_string(path)?)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join(&self.wal_file)
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.data_dir.join(&self.snapshot_file)
    }
}

// ============================================================================
// Durable engine
// ============================================================================

/// An [`Engine`] whose mutations are logged before they are acknowledged.
pub struct DurableEngine {
    config: StorageConfig,
    engine: RwLock<Engine>,
    wal: WriteAheadLog,
    since_checkpoint: AtomicUsize,
}

impl DurableEngine {
    /// Open (or create) the store under `config.data_dir`: load the latest
    /// snapshot, then replay the log on top of it.
    pub fn open(config: StorageConfig) -> Result<Self> {
        fs::create_dir_all(&config.data_dir)?;

        let snapshot_path = config.snapshot_path();
        let (mut engine, snapshot_seq) = if snapshot_path.exists() {
            let bytes = fs::read(&snapshot_path)?;
            let snapshot =
                snapshot::decode(&bytes).map_err(|e| StorageError::Codec(e.to_string()))?;
            (snapshot.engine, snapshot.last_seq)
        } else {
            (Engine::new(), 0)
        };

        // Entries up to `snapshot_seq` survive a crash between writing the
        // snapshot and truncating the log; they are already in the engine.
        let wal = WriteAheadLog::open(&config.wal_path(), config.sync_writes)?;
        let replayed = wal.replay(snapshot_seq, |_, entry| -> Result<()> {
            entry.apply(&mut engine)?;
            Ok(())
        })?;

        info!(
            dir = %config.data_dir.display(),
            terms = engine.taxonomy().len(),
            facts = engine.store().len(),
            snapshot_seq,
            replayed,
            "opened durable engine"
        );

        Ok(Self {
            config,
            engine: RwLock::new(engine),
            wal,
            since_checkpoint: AtomicUsize::new(replayed),
        })
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    /// Shared read access to the in-memory engine.
    pub fn read(&self) -> RwLockReadGuard<'_, Engine> {
        self.engine.read()
    }

    pub fn query(&self, fact_set: &str, pattern: &Predicate) -> Result<Vec<Match>> {
        Ok(self.engine.read().query(fact_set, pattern)?)
    }

    pub fn ask(&self, text: &str, fact_set: &str) -> Result<Vec<Match>> {
        Ok(self.engine.read().ask(text, fact_set)?)
    }

    // ========================================================================
    // Taxonomy mutations
    // ========================================================================

    pub fn add_term(&self, name: &str, term_type: TermId) -> Result<TermId> {
        self.define(
            |tax| tax.add_term(name, term_type),
            || WalEntry::AddTerm {
                name: name.to_string(),
                term_type,
            },
        )
    }

    pub fn add_subterm(
        &self,
        name: &str,
        bases: &[TermId],
        object_types: &[(&str, TermId)],
    ) -> Result<TermId> {
        self.define(
            |tax| tax.add_subterm(name, bases, object_types),
            || WalEntry::AddSubterm {
                name: name.to_string(),
                bases: bases.to_vec(),
                object_types: owned_object_types(object_types),
            },
        )
    }

    /// Define a verb; `bases` default to `exist`.
    pub fn add_verb(
        &self,
        name: &str,
        bases: &[TermId],
        object_types: &[(&str, TermId)],
    ) -> Result<TermId> {
        let resolved = if bases.is_empty() {
            vec![self.engine.read().taxonomy().vocabulary().exist]
        } else {
            bases.to_vec()
        };
        self.define(
            |tax| tax.add_verb(name, &resolved, object_types),
            || WalEntry::AddSubterm {
                name: name.to_string(),
                bases: resolved.clone(),
                object_types: owned_object_types(object_types),
            },
        )
    }

    pub fn add_base(&self, term: TermId, base: TermId) -> Result<()> {
        self.relink([term, base], |tax| tax.add_base(term, base), WalEntry::AddBase { term, base })
    }

    pub fn remove_base(&self, term: TermId, base: TermId) -> Result<bool> {
        self.relink(
            [term, base],
            |tax| tax.remove_base(term, base),
            WalEntry::RemoveBase { term, base },
        )
    }

    pub fn add_equivalence(&self, a: TermId, b: TermId) -> Result<()> {
        self.relink([a, b], |tax| tax.add_equivalence(a, b), WalEntry::AddEquivalence { a, b })
    }

    pub fn remove_equivalence(&self, a: TermId, b: TermId) -> Result<bool> {
        self.relink(
            [a, b],
            |tax| tax.remove_equivalence(a, b),
            WalEntry::RemoveEquivalence { a, b },
        )
    }

    /// Apply a definition, then log it. A failed append retracts the new term.
    fn define<F, E>(&self, op: F, entry: E) -> Result<TermId>
    where
        F: FnOnce(&mut Taxonomy) -> termdb_core::Result<TermId>,
        E: FnOnce() -> WalEntry,
    {
        let mut engine = self.engine.write();
        let id = op(engine.taxonomy_mut())?;
        if let Err(e) = self.wal.append(&entry()) {
            warn!(error = %e, term = %id, "log append failed; retracting definition");
            if let Err(undo) = engine.taxonomy_mut().retract_last(id) {
                warn!(error = %undo, term = %id, "could not retract definition");
            }
            return Err(e.into());
        }
        drop(engine);
        self.logged();
        Ok(id)
    }

    /// Edge mutations fail only on unknown terms, so once every term in
    /// `terms` exists the entry is logged first and then applied.
    fn relink<T, F>(&self, terms: [TermId; 2], op: F, entry: WalEntry) -> Result<T>
    where
        F: FnOnce(&mut Taxonomy) -> termdb_core::Result<T>,
    {
        let mut engine = self.engine.write();
        if terms.iter().any(|&t| engine.taxonomy().term(t).is_none()) {
            return Ok(op(engine.taxonomy_mut())?);
        }
        self.wal.append(&entry)?;
        let out = op(engine.taxonomy_mut())?;
        drop(engine);
        self.logged();
        Ok(out)
    }

    // ========================================================================
    // Fact mutations
    // ========================================================================

    /// Store a ground predicate. A duplicate returns the existing fact and
    /// writes nothing to the log.
    pub fn add_fact(&self, predicate: &Predicate, fact_set: &str) -> Result<Fact> {
        let mut engine = self.engine.write();
        let before = engine.store().len();
        let fact = engine.add_fact(predicate, fact_set)?;
        if engine.store().len() == before {
            return Ok(fact);
        }
        if let Err(e) = self.wal.append(&WalEntry::PutFact { fact: fact.clone() }) {
            warn!(error = %e, fact = %fact.id, "log append failed; removing fact");
            engine.remove_fact(fact.id)?;
            return Err(e.into());
        }
        drop(engine);
        self.logged();
        Ok(fact)
    }

    /// Parse and store a ground sentence.
    pub fn tell(&self, text: &str, fact_set: &str) -> Result<Fact> {
        let predicate = self.engine.read().parse(text)?;
        self.add_fact(&predicate, fact_set)
    }

    pub fn add_object_to_fact(&self, fact: FactId, value: Value, path: &Path) -> Result<Fact> {
        let mut engine = self.engine.write();
        let before = engine
            .store()
            .fact(fact)
            .cloned()
            .ok_or(termdb_core::Error::UnknownFact(fact))?;
        let updated = engine.add_object_to_fact(fact, value.clone(), path)?;
        let entry = WalEntry::AddObject {
            fact,
            value,
            path: path.clone(),
        };
        if let Err(e) = self.wal.append(&entry) {
            warn!(error = %e, %fact, "log append failed; restoring fact");
            engine.remove_fact(fact)?;
            engine.restore_fact(before)?;
            return Err(e.into());
        }
        drop(engine);
        self.logged();
        Ok(updated)
    }

    pub fn remove_fact(&self, fact: FactId) -> Result<Fact> {
        let mut engine = self.engine.write();
        let removed = engine.remove_fact(fact)?;
        if let Err(e) = self.wal.append(&WalEntry::RemoveFact { fact }) {
            warn!(error = %e, %fact, "log append failed; restoring fact");
            engine.restore_fact(removed)?;
            return Err(e.into());
        }
        drop(engine);
        self.logged();
        Ok(removed)
    }

    /// Delete every fact in `fact_set` matching `pattern`, one logged
    /// removal per fact.
    pub fn remove_matching(&self, fact_set: &str, pattern: &Predicate) -> Result<Vec<Fact>> {
        let ids: Vec<FactId> = self
            .query(fact_set, pattern)?
            .iter()
            .map(|m| m.fact().id)
            .collect();
        let mut removed = Vec::with_capacity(ids.len());
        for id in ids {
            match self.remove_fact(id) {
                Ok(fact) => removed.push(fact),
                // Removed concurrently between the query and now.
                Err(StorageError::Engine(termdb_core::Error::UnknownFact(_))) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(removed)
    }

    // ========================================================================
    // Checkpointing
    // ========================================================================

    /// Write a snapshot and empty the log.
    pub fn checkpoint(&self) -> Result<()> {
        // Held across the rename and truncate so no entry lands in between.
        let engine = self.engine.write();
        let last_seq = self.wal.last_seq();
        let bytes = snapshot::encode(&engine, last_seq)
            .map_err(|e| StorageError::Codec(e.to_string()))?;

        let path = self.config.snapshot_path();
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, &bytes)?;
        if self.config.sync_writes {
            fs::File::open(&tmp)?.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        self.wal.truncate()?;
        self.since_checkpoint.store(0, Ordering::SeqCst);

        info!(
            path = %path.display(),
            bytes = bytes.len(),
            last_seq,
            facts = engine.store().len(),
            "checkpoint written"
        );
        Ok(())
    }

    fn logged(&self) {
        let count = self.since_checkpoint.fetch_add(1, Ordering::SeqCst) + 1;
        let every = self.config.checkpoint_every;
        if every == 0 || count < every {
            return;
        }
        debug!(count, "checkpoint threshold reached");
        if let Err(e) = self.checkpoint() {
            // The log still holds everything; the next mutation retries.
            warn!(error = %e, "automatic checkpoint failed");
        }
    }
}

fn owned_object_types(object_types: &[(&str, TermId)]) -> Vec<(String, TermId)> {
    object_types
        .iter()
        .map(|&(label, ty)| (label.to_string(), ty))
        .collect()
}
