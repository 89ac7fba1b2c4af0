//! Leadership-gated service wrapper.
//!
//! [`AwaitingLeadershipProxy`] decorates a leader-only service (a timestamp
//! issuer, a lock granter) so that its methods only run while this node holds
//! a verified leadership token:
//!
//! ```text
//! call(f):
//!   token, delegate = cached token, or block_on_becoming_leader() ≤ max_wait
//!   if is_still_leading(token) is not Leading:
//!     drop the token, wait for a new one within the same max_wait
//!     and check it again                           else NotCurrentLeader
//!   result = f(delegate)
//!   on Err: re-check; if leadership was lost        → NotCurrentLeader
//!                     otherwise                     → the service's own error
//! ```
//!
//! The delegate is built by a factory once per leadership token. Per-term state
//! held by the delegate is therefore dropped when leadership changes hands.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info};

use crate::election::{LeaderElectionService, LeadershipToken, StillLeadingStatus};

/// Failure of a gated call.
#[derive(Debug, thiserror::Error)]
pub enum GatedCallError<E> {
    /// This node does not (or no longer) hold leadership. Retry elsewhere.
    #[error("not current leader: {0}")]
    NotCurrentLeader(String),

    /// The wrapped service failed while leadership was still held.
    #[error("{0}")]
    Service(E),
}

impl<E> GatedCallError<E> {
    /// Whether the caller should redirect to another node.
    pub fn is_not_current_leader(&self) -> bool {
        matches!(self, GatedCallError::NotCurrentLeader(_))
    }
}

type DelegateFactory<S> = Box<dyn Fn() -> Arc<S> + Send + Sync>;

/// Runs calls against a delegate only while this node leads.
pub struct AwaitingLeadershipProxy<S: ?Sized> {
    election: Arc<dyn LeaderElectionService>,
    factory: DelegateFactory<S>,
    max_wait: Duration,
    current: Mutex<Option<(LeadershipToken, Arc<S>)>>,
    shut_down: AtomicBool,
}

impl<S: ?Sized + Send + Sync> AwaitingLeadershipProxy<S> {
    /// Wrap a service.
    ///
    /// `factory` builds a fresh delegate for every new leadership token.
    /// Calls wait at most `max_wait` for this node to become leader.
    pub fn new<F>(election: Arc<dyn LeaderElectionService>, max_wait: Duration, factory: F) -> Self
    where
        F: Fn() -> Arc<S> + Send + Sync + 'static,
    {
        Self {
            election,
            factory: Box::new(factory),
            max_wait,
            current: Mutex::new(None),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Invoke `f` on the delegate if and only if this node leads.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, GatedCallError<E>>
    where
        F: FnOnce(Arc<S>) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let deadline = Instant::now() + self.max_wait;
        let (token, delegate) = self
            .acquire_verified(deadline)
            .await
            .map_err(GatedCallError::NotCurrentLeader)?;

        match f(delegate).await {
            Ok(result) => Ok(result),
            Err(e) => match self.election.is_still_leading(&token).await {
                StillLeadingStatus::Leading => Err(GatedCallError::Service(e)),
                status => {
                    debug!(round = %token.round(), ?status, "leadership lost during call");
                    self.invalidate(&token).await;
                    Err(GatedCallError::NotCurrentLeader(
                        "leadership lost during call".to_string(),
                    ))
                }
            },
        }
    }

    /// Drop the current token and refuse every later call.
    pub async fn shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
        self.current.lock().await.take();
        info!("leadership proxy shut down");
    }

    /// Whether [`shutdown`](Self::shutdown) was called.
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// A token that `is_still_leading` confirms, with its delegate.
    ///
    /// A stale cached token is dropped and replaced once, within the same
    /// deadline, so a node that leads again under a newer round still serves.
    async fn acquire_verified(
        &self,
        deadline: Instant,
    ) -> Result<(LeadershipToken, Arc<S>), String> {
        let (token, delegate) = self.acquire(deadline).await?;
        match self.election.is_still_leading(&token).await {
            StillLeadingStatus::Leading => return Ok((token, delegate)),
            status => {
                debug!(round = %token.round(), ?status, "dropping stale leadership token");
                self.invalidate(&token).await;
            }
        }

        let (token, delegate) = self.acquire(deadline).await?;
        match self.election.is_still_leading(&token).await {
            StillLeadingStatus::Leading => Ok((token, delegate)),
            status => {
                self.invalidate(&token).await;
                Err(format!("leadership check returned {status:?}"))
            }
        }
    }

    async fn acquire(&self, deadline: Instant) -> Result<(LeadershipToken, Arc<S>), String> {
        if self.is_shut_down() {
            return Err("proxy is shut down".to_string());
        }

        if let Some((token, delegate)) = self.current.lock().await.as_ref() {
            return Ok((token.clone(), Arc::clone(delegate)));
        }

        let token = match timeout_at(deadline, self.election.block_on_becoming_leader()).await {
            Ok(Ok(token)) => token,
            Ok(Err(e)) => return Err(e.to_string()),
            Err(_) => return Err(format!("not leader after waiting {:?}", self.max_wait)),
        };

        let mut current = self.current.lock().await;
        if self.is_shut_down() {
            return Err("proxy is shut down".to_string());
        }
        // A concurrent caller may already have installed a delegate.
        if let Some((existing, delegate)) = current.as_ref() {
            if *existing == token {
                return Ok((token, Arc::clone(delegate)));
            }
        }

        info!(round = %token.round(), "building delegate for new leadership term");
        let delegate = (self.factory)();
        *current = Some((token.clone(), Arc::clone(&delegate)));
        Ok((token, delegate))
    }

    async fn invalidate(&self, token: &LeadershipToken) {
        let mut current = self.current.lock().await;
        if current.as_ref().is_some_and(|(held, _)| held == token) {
            current.take();
        }
    }
}
