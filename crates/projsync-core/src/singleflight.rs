use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;

const METRIC_COALESCED_WAITERS: &str = "projsync_singleflight_coalesced_waiters";

pub type Flight<T> = Shared<BoxFuture<'static, T>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlightRole {
    Leader,
    Follower,
}

/// Registry of in-flight operations keyed by operation class.
///
/// The first caller for a key starts the work; every caller that arrives while
/// it is pending awaits the same shared future. The slot is cleared as soon as
/// the work settles, so the next caller starts a fresh flight.
pub struct Singleflight<T: Clone> {
    name: &'static str,
    flights: Arc<Mutex<HashMap<String, (u64, Flight<T>)>>>,
    next_id: AtomicU64,
}

impl<T> Singleflight<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            flights: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(0),
        }
    }

    /// Joins the flight for `key`, starting it with `start` if none is pending.
    ///
    /// `start` only builds the future; it runs under the registry lock and must
    /// not call back into this registry.
    pub fn begin<F, Fut>(&self, key: &str, start: F) -> (FlightRole, Flight<T>)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let mut map = self.flights.lock();
        if let Some((_, flight)) = map.get(key) {
            metrics::counter!(METRIC_COALESCED_WAITERS, "flight" => self.name).increment(1);
            return (FlightRole::Follower, flight.clone());
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let flights = Arc::clone(&self.flights);
        let owned_key = key.to_string();
        let work = start();
        let flight = async move {
            let out = work.await;
            let mut map = flights.lock();
            if map.get(&owned_key).is_some_and(|(current, _)| *current == id) {
                map.remove(&owned_key);
            }
            out
        }
        .boxed()
        .shared();
        map.insert(key.to_string(), (id, flight.clone()));
        (FlightRole::Leader, flight)
    }

    pub async fn run<F, Fut>(&self, key: &str, start: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let (_, flight) = self.begin(key, start);
        flight.await
    }

    pub fn is_pending(&self, key: &str) -> bool {
        self.flights.lock().contains_key(key)
    }

    pub fn pending(&self) -> usize {
        self.flights.lock().len()
    }
}
