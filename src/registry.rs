// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

use std::{
    collections::HashMap,
    future::Future,
    sync::{Arc, PoisonError, RwLock},
};
use tokio::task::JoinHandle;

/// Concurrency safe name -> entity map.
///
/// `set` overwrites silently; registration code checks `contains` first and
/// reports a collision as a setup error.
pub(crate) struct Registry<T> {
    entries: RwLock<HashMap<String, Arc<T>>>,
}

impl<T> Registry<T>
where
    T: Send + Sync + 'static,
{
    pub(crate) fn new(capacity: usize) -> Self {
        Registry {
            entries: RwLock::new(HashMap::with_capacity(capacity)),
        }
    }

    pub(crate) fn get(&self, name: &str) -> Option<Arc<T>> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub(crate) fn contains(&self, name: &str) -> bool {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    pub(crate) fn set(&self, name: &str, entity: Arc<T>) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_owned(), entity);
    }

    pub(crate) fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Snapshot of the registered entities, in no particular order.
    pub(crate) fn values(&self) -> Vec<Arc<T>> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Spawns `f` once per entity without waiting for any of them.
    ///
    /// The tasks run concurrently and finish in no defined order. The handles
    /// are returned for callers that need to join or collect the outputs;
    /// dropping them detaches the tasks.
    pub(crate) fn go_each<F, Fut, R>(&self, f: F) -> Vec<JoinHandle<R>>
    where
        F: Fn(Arc<T>) -> Fut,
        Fut: Future<Output = R> + Send + 'static,
        R: Send + 'static,
    {
        self.values()
            .into_iter()
            .map(|entity| tokio::spawn(f(entity)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn set_and_get() {
        let registry = Registry::new(1);
        assert!(registry.get("orders").is_none());

        registry.set("orders", Arc::new(1));
        assert!(registry.contains("orders"));
        assert_eq!(registry.get("orders").as_deref(), Some(&1));

        registry.set("orders", Arc::new(2));
        assert_eq!(registry.get("orders").as_deref(), Some(&2));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn go_each_visits_every_entry() {
        let registry = Registry::new(3);
        let visits = Arc::new(AtomicUsize::new(0));
        for name in ["a", "b", "c"] {
            registry.set(name, Arc::new(visits.clone()));
        }

        let handles = registry.go_each(|counter| async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(visits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn go_each_hands_back_task_outputs() {
        let registry = Registry::new(2);
        registry.set("ok", Arc::new(Ok::<u8, String>(1)));
        registry.set("failed", Arc::new(Err::<u8, String>("boom".into())));

        let handles = registry.go_each(|entry| async move { entry.as_ref().clone() });

        let mut failures = vec![];
        for handle in handles {
            if let Err(err) = handle.await.unwrap() {
                failures.push(err);
            }
        }
        assert_eq!(failures, vec!["boom".to_owned()]);
    }
}
