//! Acceptor role.
//!
//! The acceptor is the "voter" of the protocol and the source of its safety
//! guarantee. It keeps, per round sequence, the highest proposal number it has
//! promised and the proposal it last accepted.
//!
//! ## Acceptor Responsibilities
//!
//! 1. **Prepare**: a proposer asks "will you ignore anything below `n`?"
//!    - If `n` is above the promised number: durably promise `n` and reply
//!      with any previously accepted proposal for this sequence.
//!    - Otherwise: reject, reporting the higher number so the proposer can
//!      move its counter past it.
//!
//! 2. **Accept**: a proposer says "accept value `v` under number `n`."
//!    - If `n` is not below the promised number: durably store `(n, v)` and
//!      acknowledge.
//!    - Otherwise: reject.
//!
//! ## Key Invariant
//!
//! An acceptor **never promises a number lower than or equal to one it has
//! already promised**, and never accepts below its promise. Every successful
//! transition is written to the [`PaxosStateLog`] before the reply is built;
//! a storage failure is returned as an error and nothing is answered.
//!
//! ## State
//!
//! ```text
//! AcceptorState (per sequence) {
//!     promised: ProposalNumber,   // highest number promised
//!     accepted: (number, value),  // last accepted proposal
//! }
//! ```

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::storage::{run_blocking, PaxosStateLog};
use crate::types::{
    AcceptorState, PaxosAck, PaxosError, PaxosPromise, PaxosProposal, ProposalNumber,
};

/// Number of lock stripes guarding per-sequence read-modify-write.
const LOCK_STRIPES: usize = 64;

/// The acceptor role, addressed uniformly whether local or remote.
///
/// The node's own acceptor is a [`LocalAcceptor`]; peers are reached through
/// [`RemoteAcceptor`](crate::rpc::RemoteAcceptor). Both go into the same peer
/// list handed to the proposer.
#[async_trait]
pub trait PaxosAcceptor: Send + Sync {
    /// Phase 1: ask for a promise on `number` for round `sequence`.
    async fn prepare(
        &self,
        sequence: u64,
        number: ProposalNumber,
    ) -> Result<PaxosPromise, PaxosError>;

    /// Phase 2: ask to accept `proposal` for round `sequence`.
    async fn accept(&self, sequence: u64, proposal: PaxosProposal) -> Result<PaxosAck, PaxosError>;

    /// Highest sequence this acceptor has prepared or accepted anything for.
    async fn latest_sequence_prepared_or_accepted(&self) -> Result<Option<u64>, PaxosError>;
}

/// In-process acceptor backed by a durable [`PaxosStateLog`].
///
/// Operations on the same sequence are serialized by a lock stripe; operations
/// on different sequences usually land on different stripes and run in
/// parallel. Through [`PaxosAcceptor`] the log is touched on the blocking
/// pool, so a slow fsync never stalls a runtime worker.
///
/// Clones share the same log and stripes.
pub struct LocalAcceptor<L> {
    log: Arc<L>,
    stripes: Arc<[Mutex<()>]>,
}

impl<L> Clone for LocalAcceptor<L> {
    fn clone(&self) -> Self {
        Self {
            log: Arc::clone(&self.log),
            stripes: Arc::clone(&self.stripes),
        }
    }
}

impl<L: PaxosStateLog<AcceptorState>> LocalAcceptor<L> {
    /// Create an acceptor over the given log.
    pub fn new(log: L) -> Self {
        Self {
            log: Arc::new(log),
            stripes: (0..LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
        }
    }

    /// Access the underlying log.
    pub fn log(&self) -> &L {
        &self.log
    }

    fn lock_sequence(&self, sequence: u64) -> Result<MutexGuard<'_, ()>, PaxosError> {
        let stripe = (sequence % LOCK_STRIPES as u64) as usize;
        self.stripes[stripe]
            .lock()
            .map_err(|_| PaxosError::Storage("acceptor lock poisoned".to_string()))
    }

    /// Handle a prepare request.
    ///
    /// ```text
    /// On receive Prepare(seq, n):
    ///   if n <= promised[seq]:
    ///     reply Reject(promised[seq])
    ///   else:
    ///     promised[seq] = n            // durable before replying
    ///     reply Promise(n, accepted[seq])
    /// ```
    pub fn handle_prepare(
        &self,
        sequence: u64,
        number: ProposalNumber,
    ) -> Result<PaxosPromise, PaxosError> {
        let _guard = self.lock_sequence(sequence)?;
        let mut state = self.log.read_round(sequence)?.unwrap_or_default();

        if let Some(promised) = state.promised {
            if number <= promised {
                debug!(
                    sequence,
                    %number,
                    %promised,
                    "rejecting prepare below promise"
                );
                return Ok(PaxosPromise {
                    promised: false,
                    highest_seen: promised,
                    previously_accepted: None,
                });
            }
        }

        state.promised = Some(number);
        self.log.write_round(sequence, &state)?;

        debug!(
            sequence,
            %number,
            has_prior_accept = state.accepted.is_some(),
            "promised"
        );

        Ok(PaxosPromise {
            promised: true,
            highest_seen: number,
            previously_accepted: state.accepted,
        })
    }

    /// Handle an accept request.
    ///
    /// ```text
    /// On receive Accept(seq, n, v):
    ///   if n < promised[seq]:
    ///     reply Reject(promised[seq])
    ///   else:
    ///     promised[seq] = n
    ///     accepted[seq] = (n, v)       // durable before replying
    ///     reply Ack
    /// ```
    pub fn handle_accept(
        &self,
        sequence: u64,
        proposal: PaxosProposal,
    ) -> Result<PaxosAck, PaxosError> {
        let _guard = self.lock_sequence(sequence)?;
        let mut state = self.log.read_round(sequence)?.unwrap_or_default();

        if let Some(promised) = state.promised {
            if proposal.number < promised {
                warn!(
                    sequence,
                    number = %proposal.number,
                    %promised,
                    "rejecting accept below promise"
                );
                return Ok(PaxosAck {
                    accepted: false,
                    highest_seen: promised,
                });
            }
        }

        let number = proposal.number;
        state.promised = Some(number);
        state.accepted = Some(proposal);
        self.log.write_round(sequence, &state)?;

        debug!(sequence, %number, "accepted");

        Ok(PaxosAck {
            accepted: true,
            highest_seen: number,
        })
    }
}

#[async_trait]
impl<L: PaxosStateLog<AcceptorState> + 'static> PaxosAcceptor for LocalAcceptor<L> {
    async fn prepare(
        &self,
        sequence: u64,
        number: ProposalNumber,
    ) -> Result<PaxosPromise, PaxosError> {
        let acceptor = self.clone();
        run_blocking(move || acceptor.handle_prepare(sequence, number)).await
    }

    async fn accept(&self, sequence: u64, proposal: PaxosProposal) -> Result<PaxosAck, PaxosError> {
        let acceptor = self.clone();
        run_blocking(move || acceptor.handle_accept(sequence, proposal)).await
    }

    async fn latest_sequence_prepared_or_accepted(&self) -> Result<Option<u64>, PaxosError> {
        let log = Arc::clone(&self.log);
        run_blocking(move || log.greatest_log_entry()).await
    }
}
