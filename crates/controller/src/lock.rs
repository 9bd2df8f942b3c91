use {
    std::{
        collections::HashMap,
        sync::{Arc, Mutex, PoisonError},
    },
    tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard},
};

type Registry = Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>;

/// Async mutexes keyed by cluster name.
///
/// Serializes the operations changing the provisioned hardware of the same
/// cluster, as the state store has no locking of its own.
///
/// A mutex only lives in the registry while it is held or awaited.
#[derive(Clone, Debug, Default)]
pub(crate) struct ClusterLocks {
    inner: Registry,
}

impl ClusterLocks {
    pub(crate) async fn lock(&self, cluster_name: &str) -> ClusterGuard {
        let mutex = self
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(cluster_name.to_string())
            .or_default()
            .clone();

        let guard = match mutex.clone().try_lock_owned() {
            Ok(guard) => guard,
            Err(_) => {
                tracing::info!(
                    cluster = cluster_name,
                    "Waiting for another operation on the cluster"
                );
                mutex.lock_owned().await
            }
        };

        ClusterGuard {
            guard: Some(guard),
            registry: self.inner.clone(),
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// Exclusive access to a cluster, released on drop.
#[derive(Debug)]
pub(crate) struct ClusterGuard {
    guard: Option<OwnedMutexGuard<()>>,
    registry: Registry,
}

impl Drop for ClusterGuard {
    fn drop(&mut self) {
        drop(self.guard.take());

        // Entries referenced only by the registry are neither held nor
        // awaited. New references are only taken under the registry lock.
        self.registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|_, mutex| Arc::strong_count(mutex) > 1);
    }
}

#[cfg(test)]
mod test {
    use {super::*, std::time::Duration};

    #[tokio::test]
    async fn same_cluster_is_serialized() {
        let locks = ClusterLocks::default();

        let guard = locks.lock("hadoop").await;

        // Other clusters are unaffected.
        drop(locks.lock("hbase").await);

        let waiting = tokio::spawn({
            let locks = locks.clone();
            async move { drop(locks.lock("hadoop").await) }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiting.is_finished());

        drop(guard);
        waiting.await.unwrap();
    }

    #[tokio::test]
    async fn released_locks_are_removed() {
        let locks = ClusterLocks::default();

        let hadoop = locks.lock("hadoop").await;
        let hbase = locks.lock("hbase").await;
        assert_eq!(locks.len(), 2);

        let waiting = tokio::spawn({
            let locks = locks.clone();
            async move { drop(locks.lock("hadoop").await) }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        drop(hbase);
        assert_eq!(locks.len(), 1);

        // Still awaited by the spawned task.
        drop(hadoop);
        assert_eq!(locks.len(), 1);

        waiting.await.unwrap();
        assert_eq!(locks.len(), 0);

        // An abandoned waiter leaves nothing behind either.
        let hadoop = locks.lock("hadoop").await;
        let waiting = tokio::spawn({
            let locks = locks.clone();
            async move { drop(locks.lock("hadoop").await) }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        waiting.abort();
        let _ = waiting.await;

        drop(hadoop);
        assert_eq!(locks.len(), 0);
    }
}
