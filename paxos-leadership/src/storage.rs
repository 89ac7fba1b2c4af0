//! Durable per-sequence state log.
//!
//! The [`PaxosStateLog`] trait abstracts the durable state that acceptors and
//! learners keep, keyed by round sequence number. Implementations must make a
//! write durable before returning: a caller that answers a peer after
//! `write_round` returns relies on the state surviving a crash.
//!
//! ## What gets stored?
//!
//! - **Acceptors** store one [`AcceptorState`](crate::types::AcceptorState)
//!   per sequence: the highest promised number and the accepted proposal.
//! - **Learners** store one [`PaxosValue`](crate::types::PaxosValue) per
//!   sequence: the value that was chosen.
//!
//! Two implementations are provided: [`InMemoryStateLog`] for tests and
//! simulated clusters, and [`FileStateLog`] which keeps one JSON file per
//! sequence in a directory.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::Write;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::types::PaxosError;

/// Durable log of per-sequence state.
///
/// All methods take `&self`: a log is shared between the request handlers of
/// one node and does its own locking. Read-modify-write atomicity for a given
/// sequence is the caller's job (see [`LocalAcceptor`](crate::acceptor::LocalAcceptor)).
pub trait PaxosStateLog<V>: Send + Sync {
    /// Durably write the entry for `sequence`, replacing any previous one.
    fn write_round(&self, sequence: u64, value: &V) -> Result<(), PaxosError>;

    /// Read the entry for `sequence`, if any.
    fn read_round(&self, sequence: u64) -> Result<Option<V>, PaxosError>;

    /// Highest sequence with an entry.
    fn greatest_log_entry(&self) -> Result<Option<u64>, PaxosError>;

    /// Lowest sequence with an entry.
    fn least_log_entry(&self) -> Result<Option<u64>, PaxosError>;

    /// All entries with sequence `>= from`, in ascending order.
    fn read_from(&self, from: u64) -> Result<Vec<(u64, V)>, PaxosError>;
}

/// Run a synchronous log operation on the blocking thread pool.
pub(crate) async fn run_blocking<T, F>(op: F) -> Result<T, PaxosError>
where
    F: FnOnce() -> Result<T, PaxosError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(op)
        .await
        .map_err(|e| PaxosError::Storage(format!("storage task failed: {e}")))?
}

/// Flush directory metadata so a completed create, rename or remove survives
/// a crash.
fn sync_dir(dir: &Path) -> Result<(), PaxosError> {
    File::open(dir)?.sync_all()?;
    Ok(())
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>, PaxosError> {
    mutex
        .lock()
        .map_err(|_| PaxosError::Storage("state log lock poisoned".to_string()))
}

// =============================================================================
// In-memory log
// =============================================================================

/// In-memory implementation of [`PaxosStateLog`].
///
/// State is lost when the log is dropped. The availability switch lets tests
/// model a failed disk: while unavailable, every operation returns
/// [`PaxosError::Storage`].
#[derive(Debug)]
pub struct InMemoryStateLog<V> {
    entries: Mutex<BTreeMap<u64, V>>,
    available: AtomicBool,
}

impl<V> InMemoryStateLog<V> {
    /// Create a new empty log.
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
            available: AtomicBool::new(true),
        }
    }

    /// Mark the backing store as available or failed.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), PaxosError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(PaxosError::Storage("state log unavailable".to_string()))
        }
    }
}

impl<V> Default for InMemoryStateLog<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Clone + Send> PaxosStateLog<V> for InMemoryStateLog<V> {
    fn write_round(&self, sequence: u64, value: &V) -> Result<(), PaxosError> {
        self.check_available()?;
        lock(&self.entries)?.insert(sequence, value.clone());
        Ok(())
    }

    fn read_round(&self, sequence: u64) -> Result<Option<V>, PaxosError> {
        self.check_available()?;
        Ok(lock(&self.entries)?.get(&sequence).cloned())
    }

    fn greatest_log_entry(&self) -> Result<Option<u64>, PaxosError> {
        self.check_available()?;
        Ok(lock(&self.entries)?.keys().next_back().copied())
    }

    fn least_log_entry(&self) -> Result<Option<u64>, PaxosError> {
        self.check_available()?;
        Ok(lock(&self.entries)?.keys().next().copied())
    }

    fn read_from(&self, from: u64) -> Result<Vec<(u64, V)>, PaxosError> {
        self.check_available()?;
        Ok(lock(&self.entries)?
            .range(from..)
            .map(|(sequence, value)| (*sequence, value.clone()))
            .collect())
    }
}

// =============================================================================
// File-backed log
// =============================================================================

const ENTRY_EXTENSION: &str = "json";
const TEMP_EXTENSION: &str = "tmp";

/// File-backed implementation of [`PaxosStateLog`].
///
/// Each sequence lives in its own `<sequence>.json` file. Writes go to a
/// temporary file that is synced and then renamed over the entry, and the
/// directory is synced before the write returns. A crash therefore leaves
/// either the old or the new entry, never a torn one, and an acknowledged
/// write is never lost. The set of
/// present sequences is recovered by scanning the directory on open.
#[derive(Debug)]
pub struct FileStateLog<V> {
    dir: PathBuf,
    index: Mutex<BTreeSet<u64>>,
    _value: PhantomData<fn() -> V>,
}

impl<V> FileStateLog<V> {
    /// Open (or create) a log rooted at `dir`.
    ///
    /// Leftover temporary files from an interrupted write are removed.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, PaxosError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let mut index = BTreeSet::new();
        let mut removed_temp = false;
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            match path.extension().and_then(|ext| ext.to_str()) {
                Some(TEMP_EXTENSION) => {
                    debug!(path = %path.display(), "removing interrupted write");
                    fs::remove_file(&path)?;
                    removed_temp = true;
                }
                Some(ENTRY_EXTENSION) => {
                    let sequence = path
                        .file_stem()
                        .and_then(|stem| stem.to_str())
                        .and_then(|stem| stem.parse::<u64>().ok());
                    match sequence {
                        Some(sequence) => {
                            index.insert(sequence);
                        }
                        None => warn!(path = %path.display(), "ignoring unrecognized log file"),
                    }
                }
                _ => {}
            }
        }
        if removed_temp {
            sync_dir(&dir)?;
        }

        debug!(dir = %dir.display(), entries = index.len(), "opened state log");

        Ok(Self {
            dir,
            index: Mutex::new(index),
            _value: PhantomData,
        })
    }

    fn entry_path(&self, sequence: u64) -> PathBuf {
        self.dir.join(format!("{sequence}.{ENTRY_EXTENSION}"))
    }

    fn temp_path(&self, sequence: u64) -> PathBuf {
        self.dir.join(format!("{sequence}.{TEMP_EXTENSION}"))
    }
}

impl<V> FileStateLog<V>
where
    V: DeserializeOwned,
{
    fn read_file(&self, sequence: u64) -> Result<V, PaxosError> {
        let bytes = fs::read(self.entry_path(sequence))?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

impl<V> PaxosStateLog<V> for FileStateLog<V>
where
    V: Serialize + DeserializeOwned + Send,
{
    fn write_round(&self, sequence: u64, value: &V) -> Result<(), PaxosError> {
        let bytes = serde_json::to_vec(value)?;

        // Hold the index lock across the rename so readers never see an entry
        // that is in the index but not yet on disk.
        let mut index = lock(&self.index)?;
        let temp = self.temp_path(sequence);
        {
            let mut file = File::create(&temp)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        fs::rename(&temp, self.entry_path(sequence))?;
        sync_dir(&self.dir)?;
        index.insert(sequence);
        Ok(())
    }

    fn read_round(&self, sequence: u64) -> Result<Option<V>, PaxosError> {
        let index = lock(&self.index)?;
        if !index.contains(&sequence) {
            return Ok(None);
        }
        self.read_file(sequence).map(Some)
    }

    fn greatest_log_entry(&self) -> Result<Option<u64>, PaxosError> {
        Ok(lock(&self.index)?.iter().next_back().copied())
    }

    fn least_log_entry(&self) -> Result<Option<u64>, PaxosError> {
        Ok(lock(&self.index)?.iter().next().copied())
    }

    fn read_from(&self, from: u64) -> Result<Vec<(u64, V)>, PaxosError> {
        let index = lock(&self.index)?;
        index
            .range(from..)
            .map(|sequence| Ok((*sequence, self.read_file(*sequence)?)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{NodeId, PaxosValue, Round};

    fn value(sequence: u64) -> PaxosValue {
        PaxosValue::new(
            Round::new(sequence, NodeId::new(1)),
            Some(format!("entry-{sequence}").into_bytes()),
        )
    }

    #[test]
    fn test_in_memory_initial_state() {
        let log: InMemoryStateLog<PaxosValue> = InMemoryStateLog::new();

        assert!(log.greatest_log_entry().expect("greatest").is_none());
        assert!(log.least_log_entry().expect("least").is_none());
        assert!(log.read_round(0).expect("read").is_none());
        assert!(log.read_from(0).expect("range").is_empty());
    }

    #[test]
    fn test_in_memory_write_and_range() {
        let log: InMemoryStateLog<PaxosValue> = InMemoryStateLog::new();
        for sequence in [4, 1, 7] {
            log.write_round(sequence, &value(sequence)).expect("write");
        }

        assert_eq!(log.greatest_log_entry().expect("greatest"), Some(7));
        assert_eq!(log.least_log_entry().expect("least"), Some(1));

        let entries = log.read_from(2).expect("range");
        let sequences: Vec<u64> = entries.iter().map(|(s, _)| *s).collect();
        assert_eq!(sequences, vec![4, 7]);
        assert_eq!(entries[0].1, value(4));
    }

    #[test]
    fn test_in_memory_unavailable_fails_every_operation() {
        let log: InMemoryStateLog<PaxosValue> = InMemoryStateLog::new();
        log.write_round(0, &value(0)).expect("write");

        log.set_available(false);
        assert!(matches!(log.read_round(0), Err(PaxosError::Storage(_))));
        assert!(matches!(
            log.write_round(1, &value(1)),
            Err(PaxosError::Storage(_))
        ));
        assert!(log.greatest_log_entry().is_err());

        log.set_available(true);
        assert_eq!(log.read_round(0).expect("read"), Some(value(0)));
        assert!(log.read_round(1).expect("read").is_none());
    }

    #[test]
    fn test_file_log_survives_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");

        {
            let log: FileStateLog<PaxosValue> = FileStateLog::open(dir.path()).expect("open");
            for sequence in 0..5 {
                log.write_round(sequence, &value(sequence)).expect("write");
            }
            // Overwrite replaces the entry in place.
            log.write_round(3, &value(30)).expect("overwrite");
        }

        let log: FileStateLog<PaxosValue> = FileStateLog::open(dir.path()).expect("reopen");
        assert_eq!(log.least_log_entry().expect("least"), Some(0));
        assert_eq!(log.greatest_log_entry().expect("greatest"), Some(4));
        assert_eq!(log.read_round(3).expect("read"), Some(value(30)));
        assert_eq!(log.read_from(3).expect("range").len(), 2);
    }

    #[test]
    fn test_file_log_discards_interrupted_write() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("9.tmp"), b"{\"trunc").expect("write temp");
        fs::write(dir.path().join("notes.txt"), b"unrelated").expect("write other");

        let log: FileStateLog<PaxosValue> = FileStateLog::open(dir.path()).expect("open");
        assert!(log.greatest_log_entry().expect("greatest").is_none());
        assert!(!dir.path().join("9.tmp").exists());
    }

    #[test]
    fn test_file_log_corrupt_entry_is_a_codec_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("2.json"), b"not json").expect("write");

        let log: FileStateLog<PaxosValue> = FileStateLog::open(dir.path()).expect("open");
        assert_eq!(log.greatest_log_entry().expect("greatest"), Some(2));
        assert!(matches!(log.read_round(2), Err(PaxosError::Codec(_))));
    }

    #[test]
    fn test_file_log_write_leaves_only_the_entry() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log: FileStateLog<PaxosValue> = FileStateLog::open(dir.path()).expect("open");

        log.write_round(7, &value(7)).expect("write");

        let names: Vec<String> = fs::read_dir(dir.path())
            .expect("list")
            .map(|entry| entry.expect("entry").file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["7.json".to_string()]);
        sync_dir(dir.path()).expect("directory can be synced");
    }

    #[test]
    fn test_file_log_write_fails_when_directory_is_gone() {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path().join("log");
        let log: FileStateLog<PaxosValue> = FileStateLog::open(&root).expect("open");
        fs::remove_dir_all(&root).expect("remove");

        assert!(matches!(
            log.write_round(0, &value(0)),
            Err(PaxosError::Storage(_))
        ));
        assert!(log.greatest_log_entry().expect("greatest").is_none());
        assert!(matches!(sync_dir(&root), Err(PaxosError::Storage(_))));
    }
}
