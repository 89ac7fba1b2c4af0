//! Parallel fan-out to a peer list with quorum-aware early exit.
//!
//! Every multi-peer step of the protocol goes through [`QuorumBroadcaster`]:
//! prepare and accept, pulling learned values from peer learners, asking
//! acceptors for their latest sequence, and pinging peers for leadership.
//!
//! ## Policy
//!
//! A request is sent to all peers at once, each call on its own task with the
//! per-request timeout. Responses are counted as they arrive and the call
//! returns as soon as one of these holds:
//!
//! ```text
//! successes >= quorum                  → quorum reached
//! failures  >  peers - quorum          → quorum impossible
//! deadline elapsed                     → whatever arrived so far
//! ```
//!
//! Calls still in flight at that point are abandoned: their tasks finish on
//! their own and their results are dropped. Nothing is cancelled on the wire.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::types::PaxosError;

/// Strict majority of `n` peers.
pub fn majority(n: usize) -> usize {
    n / 2 + 1
}

/// Responses gathered by one broadcast.
#[derive(Debug, Clone)]
pub struct QuorumResponses<R> {
    responses: Vec<R>,
    successes: usize,
    failures: usize,
    quorum_size: usize,
}

impl<R> QuorumResponses<R> {
    /// Whether at least `quorum_size` successful responses were collected.
    pub fn has_quorum(&self) -> bool {
        self.successes >= self.quorum_size
    }

    /// Number of successful responses.
    pub fn successes(&self) -> usize {
        self.successes
    }

    /// Number of failed calls plus unsuccessful responses.
    pub fn failures(&self) -> usize {
        self.failures
    }

    /// Quorum size the broadcast was run with.
    pub fn quorum_size(&self) -> usize {
        self.quorum_size
    }

    /// Every response that arrived, successful or not, in arrival order.
    ///
    /// Failed calls (errors, timeouts) are not included.
    pub fn responses(&self) -> &[R] {
        &self.responses
    }

    /// Consume into the collected responses.
    pub fn into_responses(self) -> Vec<R> {
        self.responses
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Until {
    /// Stop once the quorum outcome is decided.
    Decided,
    /// Keep going until every peer answered or the deadline passes.
    AllResponded,
}

/// Sends one request to every peer concurrently and gathers a quorum.
#[derive(Debug, Clone)]
pub struct QuorumBroadcaster {
    request_timeout: Duration,
}

impl QuorumBroadcaster {
    /// Create a broadcaster that gives each round of calls `request_timeout`.
    pub fn new(request_timeout: Duration) -> Self {
        Self { request_timeout }
    }

    /// The per-broadcast timeout.
    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Broadcast and return as soon as the quorum outcome is decided.
    ///
    /// `is_success` decides which responses count toward the quorum; the rest
    /// count as failures but are still returned so callers can inspect them
    /// (for example, a rejection carrying a higher proposal number).
    pub async fn collect_quorum<P, R, F, Fut, S>(
        &self,
        peers: &[Arc<P>],
        quorum_size: usize,
        request: F,
        is_success: S,
    ) -> QuorumResponses<R>
    where
        P: ?Sized + Send + Sync + 'static,
        F: Fn(Arc<P>) -> Fut,
        Fut: Future<Output = Result<R, PaxosError>> + Send + 'static,
        R: Send + 'static,
        S: Fn(&R) -> bool,
    {
        self.broadcast(peers, quorum_size, request, is_success, Until::Decided)
            .await
    }

    /// Broadcast and wait for every peer (or the timeout).
    ///
    /// Used where more answers are strictly better, e.g. pinging every peer
    /// for a live leader. Quorum is still reported against `quorum_size`.
    pub async fn collect_all<P, R, F, Fut, S>(
        &self,
        peers: &[Arc<P>],
        quorum_size: usize,
        request: F,
        is_success: S,
    ) -> QuorumResponses<R>
    where
        P: ?Sized + Send + Sync + 'static,
        F: Fn(Arc<P>) -> Fut,
        Fut: Future<Output = Result<R, PaxosError>> + Send + 'static,
        R: Send + 'static,
        S: Fn(&R) -> bool,
    {
        self.broadcast(peers, quorum_size, request, is_success, Until::AllResponded)
            .await
    }

    async fn broadcast<P, R, F, Fut, S>(
        &self,
        peers: &[Arc<P>],
        quorum_size: usize,
        request: F,
        is_success: S,
        until: Until,
    ) -> QuorumResponses<R>
    where
        P: ?Sized + Send + Sync + 'static,
        F: Fn(Arc<P>) -> Fut,
        Fut: Future<Output = Result<R, PaxosError>> + Send + 'static,
        R: Send + 'static,
        S: Fn(&R) -> bool,
    {
        let total = peers.len();
        let mut collected = QuorumResponses {
            responses: Vec::with_capacity(total),
            successes: 0,
            failures: 0,
            quorum_size,
        };

        let (tx, mut rx) = mpsc::channel(total.max(1));
        let timeout = self.request_timeout;
        for peer in peers {
            let call = request(Arc::clone(peer));
            let tx = tx.clone();
            tokio::spawn(async move {
                let result = match tokio::time::timeout(timeout, call).await {
                    Ok(result) => result,
                    Err(_) => Err(PaxosError::Timeout),
                };
                // The receiver is gone once the outcome was decided.
                let _ = tx.send(result).await;
            });
        }
        drop(tx);

        let deadline = Instant::now() + timeout;
        let mut received = 0;
        while received < total {
            if until == Until::Decided
                && (collected.successes >= quorum_size
                    || collected.failures + quorum_size > total)
            {
                break;
            }

            let result = match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(result)) => result,
                Ok(None) => break,
                Err(_) => {
                    debug!(
                        received,
                        total,
                        successes = collected.successes,
                        "broadcast deadline elapsed"
                    );
                    break;
                }
            };
            received += 1;

            match result {
                Ok(response) => {
                    if is_success(&response) {
                        collected.successes += 1;
                    } else {
                        collected.failures += 1;
                    }
                    collected.responses.push(response);
                }
                Err(e) => {
                    trace!(error = %e, "peer call failed");
                    collected.failures += 1;
                }
            }
        }

        trace!(
            total,
            quorum_size,
            successes = collected.successes,
            failures = collected.failures,
            "broadcast finished"
        );

        collected
    }
}
