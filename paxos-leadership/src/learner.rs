//! Learner role.
//!
//! A learner records which value was chosen for which round. Its log is
//! append-only per sequence: the first value learned for a sequence stays there
//! forever. Learning the same value again is a no-op, and a different value for
//! an already learned sequence is refused and logged, since it can only come
//! from a bug or a corrupted peer.
//!
//! Learners that miss a broadcast catch up later by asking peers for
//! everything since their greatest learned sequence
//! (see [`Paxos::update_learned_state_from_peers`](crate::paxos::Paxos::update_learned_state_from_peers)).

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::storage::{run_blocking, PaxosStateLog};
use crate::types::{PaxosError, PaxosValue};

/// The learner role, addressed uniformly whether local or remote.
#[async_trait]
pub trait PaxosLearner: Send + Sync {
    /// Record that `value` was chosen for `sequence`. Idempotent.
    async fn learn(&self, sequence: u64, value: PaxosValue) -> Result<(), PaxosError>;

    /// The value learned for `sequence`, if any.
    async fn learned_value(&self, sequence: u64) -> Result<Option<PaxosValue>, PaxosError>;

    /// The value with the highest learned sequence, if any.
    async fn greatest_learned_value(&self) -> Result<Option<PaxosValue>, PaxosError>;

    /// All values with sequence `>= sequence`, ascending.
    async fn learned_values_since(&self, sequence: u64) -> Result<Vec<PaxosValue>, PaxosError>;
}

/// In-process learner backed by a durable [`PaxosStateLog`].
///
/// Clones share the same log.
pub struct LocalLearner<L> {
    log: Arc<L>,
    write_lock: Arc<Mutex<()>>,
}

impl<L> Clone for LocalLearner<L> {
    fn clone(&self) -> Self {
        Self {
            log: Arc::clone(&self.log),
            write_lock: Arc::clone(&self.write_lock),
        }
    }
}

impl<L: PaxosStateLog<PaxosValue>> LocalLearner<L> {
    /// Create a learner over the given log.
    pub fn new(log: L) -> Self {
        Self {
            log: Arc::new(log),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Access the underlying log.
    pub fn log(&self) -> &L {
        &self.log
    }

    /// Record a chosen value.
    ///
    /// Returns `true` if the value was newly recorded, `false` if the sequence
    /// already had an entry (same value or not).
    pub fn handle_learn(&self, sequence: u64, value: PaxosValue) -> Result<bool, PaxosError> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| PaxosError::Storage("learner lock poisoned".to_string()))?;

        if let Some(existing) = self.log.read_round(sequence)? {
            if existing != value {
                warn!(
                    sequence,
                    existing = %existing.round,
                    offered = %value.round,
                    "refusing to overwrite learned value"
                );
            }
            return Ok(false);
        }

        self.log.write_round(sequence, &value)?;
        debug!(sequence, round = %value.round, "learned value");
        Ok(true)
    }

    /// The value with the highest learned sequence.
    pub fn greatest_value(&self) -> Result<Option<PaxosValue>, PaxosError> {
        match self.log.greatest_log_entry()? {
            Some(sequence) => self.log.read_round(sequence),
            None => Ok(None),
        }
    }
}

// Log access runs on the blocking pool; see `LocalAcceptor`.
#[async_trait]
impl<L: PaxosStateLog<PaxosValue> + 'static> PaxosLearner for LocalLearner<L> {
    async fn learn(&self, sequence: u64, value: PaxosValue) -> Result<(), PaxosError> {
        let learner = self.clone();
        run_blocking(move || learner.handle_learn(sequence, value).map(|_| ())).await
    }

    async fn learned_value(&self, sequence: u64) -> Result<Option<PaxosValue>, PaxosError> {
        let log = Arc::clone(&self.log);
        run_blocking(move || log.read_round(sequence)).await
    }

    async fn greatest_learned_value(&self) -> Result<Option<PaxosValue>, PaxosError> {
        let learner = self.clone();
        run_blocking(move || learner.greatest_value()).await
    }

    async fn learned_values_since(&self, sequence: u64) -> Result<Vec<PaxosValue>, PaxosError> {
        let log = Arc::clone(&self.log);
        run_blocking(move || {
            Ok(log
                .read_from(sequence)?
                .into_iter()
                .map(|(_, value)| value)
                .collect())
        })
        .await
    }
}
