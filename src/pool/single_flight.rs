//! At most one in-flight operation per key
//!
//! Every caller for a key receives a clone of the same shared future. The
//! work is driven by a spawned task, so it completes even if every caller
//! stops waiting, and the key is released as soon as it settles.

use crate::error::Result;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

pub type SharedResult<T> = Shared<BoxFuture<'static, Result<T>>>;

pub struct SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    inflight: Arc<Mutex<HashMap<String, SharedResult<T>>>>,
}

impl<T> Default for SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            inflight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, SharedResult<T>>> {
        self.inflight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Join the operation running for `key`, or start one with `start`.
    ///
    /// `start` is only called when no operation is registered for the key.
    pub fn run<F, Fut>(&self, key: &str, start: F) -> SharedResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let mut inflight = self.lock();
        if let Some(existing) = inflight.get(key) {
            tracing::debug!("Joining in-flight operation {}", key);
            return existing.clone();
        }

        let registry = self.inflight.clone();
        let owned_key = key.to_string();
        let work = start();
        let shared = async move {
            let result = work.await;
            registry
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .remove(&owned_key);
            result
        }
        .boxed()
        .shared();

        inflight.insert(key.to_string(), shared.clone());
        drop(inflight);

        tokio::spawn(shared.clone());
        shared
    }

    pub fn contains(&self, key: &str) -> bool {
        self.lock().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
