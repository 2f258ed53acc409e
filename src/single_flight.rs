//! Per-key in-flight registry.
//!
//! Concurrent callers asking for the same key share one future and all get
//! its outcome (success or failure). The entry is removed when that future
//! settles, before any caller observes the result, so the next call after
//! settlement starts a fresh flight.

use crate::errors::FarmError;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

type SharedOutcome<T> = Shared<BoxFuture<'static, Result<T, FarmError>>>;

pub struct SingleFlight<K, T>
where
    K: Eq + Hash,
    T: Clone,
{
    in_flight: Arc<DashMap<K, (u64, SharedOutcome<T>)>>,
    next_id: AtomicU64,
}

impl<K, T> Default for SingleFlight<K, T>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, T> SingleFlight<K, T>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            in_flight: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Join the flight for `key`, starting it with `make` if none is running.
    ///
    /// `make` is only invoked by the caller that starts the flight.
    pub async fn run<F, Fut>(&self, key: K, make: F) -> Result<T, FarmError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, FarmError>> + Send + 'static,
    {
        let shared = match self.in_flight.entry(key.clone()) {
            Entry::Occupied(existing) => existing.get().1.clone(),
            Entry::Vacant(slot) => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let registry = Arc::clone(&self.in_flight);
                let work = make();
                let flight = async move {
                    let outcome = work.await;
                    registry.remove_if(&key, |_, (entry_id, _)| *entry_id == id);
                    outcome
                }
                .boxed()
                .shared();
                slot.insert((id, flight.clone()));
                flight
            }
        };
        shared.await
    }

    pub fn is_in_flight(&self, key: &K) -> bool {
        self.in_flight.contains_key(key)
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Number of flights started since creation.
    pub fn flights_started(&self) -> u64 {
        self.next_id.load(Ordering::Relaxed)
    }
}
