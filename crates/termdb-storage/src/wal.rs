//! Write-ahead log.
//!
//! ```text
//! ┌──────────┬──────────┬──────────────────┐
//! │ body len │ sequence │ bincode(WalEntry)│
//! │ u32 LE   │ u64 LE   │                  │
//! └──────────┴──────────┴──────────────────┘
//! ```
//!
//! Sequence numbers keep counting across checkpoints, so a snapshot can
//! record the last entry it contains. Bytes past the last complete frame
//! (a crash or failed write mid-append) are cut off before the next append
//! and on replay.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path as FsPath, PathBuf};
#[cfg(test)]
use std::sync::atomic::{AtomicU8, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use termdb_core::{Engine, Fact, FactId, Path, TermId, Value};
use tracing::{debug, warn};

/// One logged mutation. Replaying every entry in order against the last
/// snapshot reproduces the engine exactly, ids included.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WalEntry {
    AddTerm {
        name: String,
        term_type: TermId,
    },
    AddSubterm {
        name: String,
        bases: Vec<TermId>,
        object_types: Vec<(String, TermId)>,
    },
    AddBase {
        term: TermId,
        base: TermId,
    },
    RemoveBase {
        term: TermId,
        base: TermId,
    },
    AddEquivalence {
        a: TermId,
        b: TermId,
    },
    RemoveEquivalence {
        a: TermId,
        b: TermId,
    },
    /// A fact under the id it was assigned.
    PutFact {
        fact: Fact,
    },
    AddObject {
        fact: FactId,
        value: Value,
        path: Path,
    },
    RemoveFact {
        fact: FactId,
    },
}

impl WalEntry {
    /// Re-apply this mutation.
    pub fn apply(self, engine: &mut Engine) -> termdb_core::Result<()> {
        match self {
            WalEntry::AddTerm { name, term_type } => {
                engine.taxonomy_mut().add_term(&name, term_type)?;
            }
            WalEntry::AddSubterm {
                name,
                bases,
                object_types,
            } => {
                let object_types: Vec<(&str, TermId)> = object_types
                    .iter()
                    .map(|(label, ty)| (label.as_str(), *ty))
                    .collect();
                engine
                    .taxonomy_mut()
                    .add_subterm(&name, &bases, &object_types)?;
            }
            WalEntry::AddBase { term, base } => engine.taxonomy_mut().add_base(term, base)?,
            WalEntry::RemoveBase { term, base } => {
                engine.taxonomy_mut().remove_base(term, base)?;
            }
            WalEntry::AddEquivalence { a, b } => engine.taxonomy_mut().add_equivalence(a, b)?,
            WalEntry::RemoveEquivalence { a, b } => {
                engine.taxonomy_mut().remove_equivalence(a, b)?;
            }
            WalEntry::PutFact { fact } => engine.restore_fact(fact)?,
            WalEntry::AddObject { fact, value, path } => {
                engine.add_object_to_fact(fact, value, &path)?;
            }
            WalEntry::RemoveFact { fact } => {
                engine.remove_fact(fact)?;
            }
        }
        Ok(())
    }
}

const FRAME_HEADER: u64 = 12;

struct LogFile {
    file: File,
    /// Length of the file up to the end of the last complete frame.
    good_len: u64,
    next_seq: u64,
}

pub struct WriteAheadLog {
    state: Mutex<LogFile>,
    path: PathBuf,
    sync: bool,
    #[cfg(test)]
    fail_next: AtomicU8,
}

#[cfg(test)]
const FAIL_BEFORE_WRITE: u8 = 1;
#[cfg(test)]
const FAIL_MID_FRAME: u8 = 2;

impl WriteAheadLog {
    pub fn open(path: &FsPath, sync: bool) -> std::io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path)?;
        let good_len = file.metadata()?.len();

        Ok(Self {
            state: Mutex::new(LogFile {
                file,
                good_len,
                next_seq: 1,
            }),
            path: path.to_path_buf(),
            sync,
            #[cfg(test)]
            fail_next: AtomicU8::new(0),
        })
    }

    pub fn path(&self) -> &FsPath {
        &self.path
    }

    /// Sequence number of the newest entry written or replayed (0 if none).
    pub fn last_seq(&self) -> u64 {
        self.state.lock().next_seq - 1
    }

    /// Append one entry; returns its sequence number. A failed append leaves
    /// no partial frame behind.
    pub fn append(&self, entry: &WalEntry) -> std::io::Result<u64> {
        let data = bincode::serialize(entry)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        let len = u32::try_from(data.len())
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

        let mut log = self.state.lock();
        let end = log.file.metadata()?.len();
        if end != log.good_len {
            warn!(
                path = %self.path.display(),
                expected = log.good_len,
                found = end,
                "cutting bytes past the last complete entry"
            );
            log.file.set_len(log.good_len)?;
        }

        let seq = log.next_seq;
        let mut frame = Vec::with_capacity(FRAME_HEADER as usize + data.len());
        frame.extend_from_slice(&len.to_le_bytes());
        frame.extend_from_slice(&seq.to_le_bytes());
        frame.extend_from_slice(&data);

        if let Err(e) = self.write_frame(&mut log.file, &frame) {
            // Checked again by the next append if this fails too.
            if let Err(cut) = log.file.set_len(log.good_len) {
                warn!(path = %self.path.display(), error = %cut, "could not cut failed append");
            }
            return Err(e);
        }
        log.good_len += frame.len() as u64;
        log.next_seq += 1;
        Ok(seq)
    }

    fn write_frame(&self, file: &mut File, frame: &[u8]) -> std::io::Result<()> {
        #[cfg(test)]
        match self.fail_next.swap(0, Ordering::SeqCst) {
            FAIL_BEFORE_WRITE => return Err(injected_failure()),
            FAIL_MID_FRAME => {
                file.write_all(&frame[..frame.len() / 2])?;
                return Err(injected_failure());
            }
            _ => {}
        }

        file.write_all(frame)?;
        if self.sync {
            file.sync_data()?;
        }
        Ok(())
    }

    /// Feed every complete entry newer than `after` to `handler`, oldest
    /// first. Returns the number of entries handed over.
    pub fn replay<F, E>(&self, after: u64, mut handler: F) -> Result<usize, E>
    where
        F: FnMut(u64, WalEntry) -> Result<(), E>,
        E: From<std::io::Error>,
    {
        let mut log = self.state.lock();
        log.file.seek(SeekFrom::Start(0))?;

        let file_len = log.file.metadata()?.len();
        let mut applied = 0;
        let mut skipped = 0;
        let mut last_seq = after;
        let mut good_len: u64 = 0;
        loop {
            let mut header = [0u8; FRAME_HEADER as usize];
            match log.file.read_exact(&mut header) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }
            let mut len_bytes = [0u8; 4];
            len_bytes.copy_from_slice(&header[..4]);
            let mut seq_bytes = [0u8; 8];
            seq_bytes.copy_from_slice(&header[4..]);
            let len = u32::from_le_bytes(len_bytes) as u64;
            let seq = u64::from_le_bytes(seq_bytes);

            // A length running past the end of the file is a torn frame.
            if good_len + FRAME_HEADER + len > file_len {
                break;
            }
            let mut data = vec![0u8; len as usize];
            log.file.read_exact(&mut data)?;
            good_len += FRAME_HEADER + len;

            if seq <= after {
                skipped += 1;
                continue;
            }
            let entry: WalEntry = bincode::deserialize(&data)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
            handler(seq, entry)?;
            applied += 1;
            last_seq = last_seq.max(seq);
        }

        if file_len > good_len {
            warn!(
                path = %self.path.display(),
                entries = applied + skipped,
                dropped_bytes = file_len - good_len,
                "cutting torn log tail"
            );
            log.file.set_len(good_len)?;
        }
        if skipped > 0 {
            debug!(path = %self.path.display(), skipped, after, "skipped entries already in snapshot");
        }
        log.good_len = good_len;
        log.next_seq = log.next_seq.max(last_seq + 1);

        Ok(applied)
    }

    /// Empty the log after a checkpoint. Sequence numbers keep counting.
    pub fn truncate(&self) -> std::io::Result<()> {
        let mut log = self.state.lock();
        log.file.set_len(0)?;
        log.file.seek(SeekFrom::Start(0))?;
        if self.sync {
            log.file.sync_all()?;
        }
        log.good_len = 0;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn fail_next_append(&self) {
        self.fail_next.store(FAIL_BEFORE_WRITE, Ordering::SeqCst);
    }

    /// The next append writes half its frame, then fails.
    #[cfg(test)]
    pub(crate) fn tear_next_append(&self) {
        self.fail_next.store(FAIL_MID_FRAME, Ordering::SeqCst);
    }
}

#[cfg(test)]
fn injected_failure() -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::Other, "injected log failure")
}
