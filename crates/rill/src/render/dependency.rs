use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

use super::node::Node;
use super::signal::SignalSender;
use crate::error::RillError;

pub type DependencyId = u64;

static NEXT_DEPENDENCY_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone)]
pub enum Settled {
    Resolved(Arc<Node>),
    Rejected(RillError),
    Postponed(String),
}

enum DependencyState {
    Pending(Vec<SignalSender>),
    Settled(Settled),
}

struct Inner {
    id: DependencyId,
    state: Mutex<DependencyState>,
}

impl Inner {
    fn settle(&self, outcome: Settled) {
        let subscribers = {
            let mut state = self.state.lock();
            match &mut *state {
                DependencyState::Pending(subscribers) => {
                    let subscribers = std::mem::take(subscribers);
                    *state = DependencyState::Settled(outcome);
                    subscribers
                }
                DependencyState::Settled(_) => {
                    warn!("Dependency {} settled more than once; keeping the first outcome", self.id);
                    return;
                }
            }
        };

        debug!("Dependency {} settled, pinging {} subscribers", self.id, subscribers.len());

        for subscriber in subscribers {
            subscriber.ping(self.id);
        }
    }
}

/// An external value a Task may suspend on. Clones share the same
/// settlement; each Request that awaits it is pinged exactly once.
#[derive(Clone)]
pub struct Dependency {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Dependency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match &*self.inner.state.lock() {
            DependencyState::Pending(_) => "pending",
            DependencyState::Settled(Settled::Resolved(_)) => "resolved",
            DependencyState::Settled(Settled::Rejected(_)) => "rejected",
            DependencyState::Settled(Settled::Postponed(_)) => "postponed",
        };
        f.debug_struct("Dependency").field("id", &self.inner.id).field("state", &state).finish()
    }
}

impl Dependency {
    pub fn pending() -> (Self, Settler) {
        let inner = Arc::new(Inner {
            id: NEXT_DEPENDENCY_ID.fetch_add(1, Ordering::Relaxed),
            state: Mutex::new(DependencyState::Pending(Vec::new())),
        });
        (Self { inner: Arc::clone(&inner) }, Settler { inner: Some(inner) })
    }

    pub fn resolved(node: Node) -> Self {
        let (dependency, settler) = Self::pending();
        settler.resolve(node);
        dependency
    }

    pub fn rejected(error: impl Into<RillError>) -> Self {
        let (dependency, settler) = Self::pending();
        settler.reject(error);
        dependency
    }

    /// Drives `future` on the current tokio runtime and settles with its output.
    pub fn spawn<F>(future: F) -> Self
    where
        F: Future<Output = Result<Node, RillError>> + Send + 'static,
    {
        let (dependency, settler) = Self::pending();
        tokio::spawn(async move {
            match future.await {
                Ok(node) => settler.resolve(node),
                Err(error) => settler.reject(error),
            }
        });
        dependency
    }

    pub fn id(&self) -> DependencyId {
        self.inner.id
    }

    pub fn is_pending(&self) -> bool {
        matches!(&*self.inner.state.lock(), DependencyState::Pending(_))
    }

    pub fn settled(&self) -> Option<Settled> {
        match &*self.inner.state.lock() {
            DependencyState::Pending(_) => None,
            DependencyState::Settled(outcome) => Some(outcome.clone()),
        }
    }

    /// Registers `subscriber` for a single ping. Returns false when the
    /// dependency already settled, in which case no ping will ever arrive.
    pub(crate) fn subscribe(&self, subscriber: SignalSender) -> bool {
        match &mut *self.inner.state.lock() {
            DependencyState::Pending(subscribers) => {
                subscribers.push(subscriber);
                true
            }
            DependencyState::Settled(_) => false,
        }
    }
}

/// The producer side of a [`Dependency`]. Dropping it unsettled rejects the
/// dependency so no Task waits forever.
pub struct Settler {
    inner: Option<Arc<Inner>>,
}

impl std::fmt::Debug for Settler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Settler").field("id", &self.inner.as_ref().map(|inner| inner.id)).finish()
    }
}

impl Settler {
    pub fn id(&self) -> Option<DependencyId> {
        self.inner.as_ref().map(|inner| inner.id)
    }

    pub fn resolve(mut self, node: impl Into<Node>) {
        self.settle(Settled::Resolved(Arc::new(node.into())));
    }

    pub fn reject(mut self, error: impl Into<RillError>) {
        self.settle(Settled::Rejected(error.into()));
    }

    pub fn postpone(mut self, reason: impl Into<String>) {
        self.settle(Settled::Postponed(reason.into()));
    }

    fn settle(&mut self, outcome: Settled) {
        if let Some(inner) = self.inner.take() {
            inner.settle(outcome);
        }
    }
}

impl Drop for Settler {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            warn!("Dependency {} dropped before it settled; rejecting", inner.id);
            inner.settle(Settled::Rejected(RillError::render(
                "The dependency was dropped before it settled.",
            )));
        }
    }
}
