//! [`StateStore`] keeping the records in process memory.

use {
    super::{codec, Error, StateStore},
    cirrus_core::{Cluster, ClusterSpec, Credentials},
    std::{
        collections::HashMap,
        sync::{Arc, Mutex, MutexGuard, PoisonError},
    },
};

/// Serialized records of [`MemoryStateStore`]s keyed by cluster name.
///
/// Clones share the same records.
#[derive(Clone, Debug, Default)]
pub struct Records {
    inner: Arc<Mutex<HashMap<String, String>>>,
}

impl Records {
    fn inner(&self) -> MutexGuard<'_, HashMap<String, String>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the serialized record of a cluster.
    pub fn get(&self, cluster_name: &str) -> Option<String> {
        self.inner().get(cluster_name).cloned()
    }

    /// Overwrites the serialized record of a cluster.
    pub fn set(&self, cluster_name: impl Into<String>, record: impl Into<String>) {
        let _ = self.inner().insert(cluster_name.into(), record.into());
    }
}

/// [`StateStore`] backed by shared [`Records`].
#[derive(Clone, Debug)]
pub struct MemoryStateStore {
    records: Records,
    cluster_name: String,
    credentials: Arc<Credentials>,
}

impl MemoryStateStore {
    pub fn new(records: Records, spec: &ClusterSpec) -> Self {
        Self {
            records,
            cluster_name: spec.cluster_name.clone(),
            credentials: spec.credentials.clone(),
        }
    }
}

impl StateStore for MemoryStateStore {
    async fn load(&self) -> Result<Cluster, Error> {
        let record = self
            .records
            .get(&self.cluster_name)
            .ok_or_else(|| Error::NotFound(self.cluster_name.clone()))?;

        Ok(codec::deserialize(&self.credentials, &record)?)
    }

    async fn save(&self, cluster: &Cluster) -> Result<(), Error> {
        self.records
            .set(self.cluster_name.clone(), codec::serialize(cluster));
        Ok(())
    }

    async fn destroy(&self) -> Result<(), Error> {
        let _ = self.records.inner().remove(&self.cluster_name);
        Ok(())
    }
}
