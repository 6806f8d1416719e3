// Keyed single-flight construction
//
// Each key moves through `Absent -> Connecting -> Ready -> Closed`. While a
// key is `Connecting`, every caller awaits the same shared future, so a value
// is never built twice concurrently. A failed build returns the key to
// `Absent`; the next caller starts a fresh attempt.

use futures::future::{BoxFuture, FutureExt, Shared};
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Lifecycle state of one keyed slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Absent,
    Connecting,
    Ready,
    Closed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Absent => "absent",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Ready => "ready",
            ConnectionState::Closed => "closed",
        }
    }
}

type Build<V, E> = Shared<BoxFuture<'static, Result<Arc<V>, E>>>;

enum Slot<V, E> {
    Connecting { attempt: u64, build: Build<V, E> },
    Ready(Arc<V>),
    Closed,
}

pub struct SingleFlight<K, V, E> {
    slots: Mutex<HashMap<K, Slot<V, E>>>,
    attempts: AtomicU64,
}

impl<K, V, E> Default for SingleFlight<K, V, E> {
    fn default() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            attempts: AtomicU64::new(0),
        }
    }
}

impl<K, V, E> SingleFlight<K, V, E>
where
    K: Eq + Hash + Clone + Send,
    V: Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the ready value for `key`, joining an in-flight build or
    /// starting one with `init` when there is none.
    ///
    /// `init` is only called by the caller that starts the attempt.
    pub async fn get_or_init<F, Fut>(&self, key: K, init: F) -> Result<Arc<V>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        let (attempt, build) = {
            let mut slots = self.slots.lock().await;
            match slots.get(&key) {
                Some(Slot::Ready(value)) => return Ok(value.clone()),
                Some(Slot::Connecting { attempt, build }) => (*attempt, build.clone()),
                Some(Slot::Closed) | None => {
                    let attempt = self.attempts.fetch_add(1, Ordering::Relaxed);
                    let build = init().map(|result| result.map(Arc::new)).boxed().shared();
                    slots.insert(
                        key.clone(),
                        Slot::Connecting {
                            attempt,
                            build: build.clone(),
                        },
                    );
                    (attempt, build)
                }
            }
        };

        let result = build.await;

        let mut slots = self.slots.lock().await;
        let settles_this_attempt = matches!(
            slots.get(&key),
            Some(Slot::Connecting { attempt: current, .. }) if *current == attempt
        );
        if settles_this_attempt {
            match &result {
                Ok(value) => {
                    slots.insert(key, Slot::Ready(value.clone()));
                }
                Err(_) => {
                    slots.remove(&key);
                }
            }
        }

        result
    }

    /// Mark the ready value for `key` closed when `matches` holds for it.
    ///
    /// Returns whether a transition happened; a slot that was already rebuilt
    /// or is still connecting is left alone.
    pub async fn invalidate_if<P>(&self, key: &K, matches: P) -> bool
    where
        P: FnOnce(&V) -> bool,
    {
        let mut slots = self.slots.lock().await;
        let stale = matches!(slots.get(key), Some(Slot::Ready(value)) if matches(value));
        if stale {
            slots.insert(key.clone(), Slot::Closed);
        }
        stale
    }

    pub async fn state(&self, key: &K) -> ConnectionState {
        match self.slots.lock().await.get(key) {
            None => ConnectionState::Absent,
            Some(Slot::Connecting { .. }) => ConnectionState::Connecting,
            Some(Slot::Ready(_)) => ConnectionState::Ready,
            Some(Slot::Closed) => ConnectionState::Closed,
        }
    }

    /// The ready value for `key`, without starting a build
    pub async fn peek(&self, key: &K) -> Option<Arc<V>> {
        match self.slots.lock().await.get(key) {
            Some(Slot::Ready(value)) => Some(value.clone()),
            _ => None,
        }
    }
}
