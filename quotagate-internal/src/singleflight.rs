use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::future::Future;
use tokio::sync::watch;

use crate::error::{Error, ErrorDetails};

type Outcome<T> = Option<Result<T, Error>>;

/// Keyed registry of in-progress operations. A second caller for a key that
/// already has an operation in flight awaits the first caller's outcome
/// instead of starting a duplicate. Entries are removed when the leading
/// operation completes, whether it succeeded or failed.
pub struct SingleFlight<T: Clone> {
    inflight: DashMap<String, watch::Receiver<Outcome<T>>>,
}

impl<T: Clone> Default for SingleFlight<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> SingleFlight<T> {
    pub fn new() -> Self {
        Self {
            inflight: DashMap::new(),
        }
    }

    /// Run `f` for `key`, or await the in-flight run for the same key.
    pub async fn run<F, Fut>(&self, key: &str, f: F) -> Result<T, Error>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, Error>>,
    {
        let mut leader_tx = None;
        let follower_rx = match self.inflight.entry(key.to_string()) {
            Entry::Occupied(entry) => Some(entry.get().clone()),
            Entry::Vacant(entry) => {
                let (tx, rx) = watch::channel(None);
                entry.insert(rx);
                leader_tx = Some(tx);
                None
            }
        };

        match (leader_tx, follower_rx) {
            (Some(tx), _) => {
                // The guard removes the entry even if the future panics, so
                // a poisoned key can never wedge later callers.
                let _guard = FlightGuard {
                    inflight: &self.inflight,
                    key,
                };
                let result = f().await;
                let _ = tx.send(Some(result.clone()));
                result
            }
            (None, Some(mut rx)) => loop {
                let published = rx.borrow_and_update().clone();
                if let Some(outcome) = published {
                    return outcome;
                }
                if rx.changed().await.is_err() {
                    return Err(Error::new(ErrorDetails::InternalError {
                        message: format!(
                            "in-flight operation for key `{key}` went away without publishing an outcome"
                        ),
                    }));
                }
            },
            (None, None) => Err(Error::new(ErrorDetails::InternalError {
                message: "single-flight entry resolved to neither leader nor follower".to_string(),
            })),
        }
    }

    /// Number of keys with an operation currently in flight.
    pub fn len(&self) -> usize {
        self.inflight.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inflight.is_empty()
    }
}

struct FlightGuard<'a, T: Clone> {
    inflight: &'a DashMap<String, watch::Receiver<Outcome<T>>>,
    key: &'a str,
}

impl<T: Clone> Drop for FlightGuard<'_, T> {
    fn drop(&mut self) {
        self.inflight.remove(self.key);
    }
}
