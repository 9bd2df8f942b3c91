//! Durable record of the last known membership of a cluster.
//!
//! The record is independent of what the compute provider currently reports,
//! and is the only place the roles assigned to the nodes are remembered.

use {
    cirrus_core::{spec::StateStoreKind, Cluster, ClusterSpec},
    std::{future::Future, io, path::PathBuf},
};

pub mod codec;
pub mod file;
pub mod memory;

pub use {file::FileStateStore, memory::MemoryStateStore};

/// Storage of the state of a single cluster.
pub trait StateStore: Send + Sync {
    /// Loads the [`Cluster`] state.
    ///
    /// Fails if the record doesn't exist or is corrupt.
    fn load(&self) -> impl Future<Output = Result<Cluster, Error>> + Send;

    /// Saves the [`Cluster`] state, fully replacing the existing record.
    fn save(&self, cluster: &Cluster) -> impl Future<Output = Result<(), Error>> + Send;

    /// Removes the record. Removing an absent record is not an error.
    fn destroy(&self) -> impl Future<Output = Result<(), Error>> + Send;

    /// Loads the [`Cluster`] state or returns an empty [`Cluster`] if it
    /// can't be loaded.
    fn try_load_or_empty(&self) -> impl Future<Output = Cluster> + Send {
        async move {
            self.load().await.unwrap_or_else(|err| {
                tracing::warn!(
                    %err,
                    "Unable to load cluster state, assuming it has no running nodes"
                );
                Cluster::empty()
            })
        }
    }
}

/// [`StateStore`] error.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("No state recorded for cluster `{0}`")]
    NotFound(String),

    #[error(transparent)]
    Corrupt(#[from] codec::CorruptError),

    #[error("State record is not valid UTF-8")]
    Encoding,

    #[error("IO: {0}")]
    Io(#[from] io::Error),
}

/// Creates [`StateStore`]s for [`ClusterSpec`]s.
///
/// The store created for a spec is identified by its cluster name, so the
/// same record is found again after a restart.
pub trait Factory: Send + Sync {
    type Store: StateStore;

    fn create(&self, spec: &ClusterSpec) -> Self::Store;
}

/// [`Factory`] choosing the backend configured by
/// [`ClusterSpec::state_store`].
#[derive(Clone, Debug, Default)]
pub struct DefaultFactory {
    memory: memory::Records,
}

impl DefaultFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records of the [`StateStoreKind::Memory`] backend.
    pub fn memory_records(&self) -> &memory::Records {
        &self.memory
    }
}

impl Factory for DefaultFactory {
    type Store = Store;

    fn create(&self, spec: &ClusterSpec) -> Store {
        match spec.state_store {
            StateStoreKind::Local => {
                let dir = spec.state_store_dir.clone().unwrap_or_else(default_dir);
                Store::File(FileStateStore::new(&dir, spec))
            }
            StateStoreKind::Memory => Store::Memory(MemoryStateStore::new(self.memory.clone(), spec)),
            StateStoreKind::None => Store::None(NoneStateStore {
                cluster_name: spec.cluster_name.clone(),
            }),
        }
    }
}

/// `~/.cirrus`, or `.cirrus` in the working directory if there is no home
/// directory.
pub fn default_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_default()
        .join(".cirrus")
}

/// [`StateStore`] created by the [`DefaultFactory`].
#[derive(Clone, Debug)]
pub enum Store {
    File(FileStateStore),
    Memory(MemoryStateStore),
    None(NoneStateStore),
}

impl StateStore for Store {
    async fn load(&self) -> Result<Cluster, Error> {
        match self {
            Self::File(store) => store.load().await,
            Self::Memory(store) => store.load().await,
            Self::None(store) => store.load().await,
        }
    }

    async fn save(&self, cluster: &Cluster) -> Result<(), Error> {
        match self {
            Self::File(store) => store.save(cluster).await,
            Self::Memory(store) => store.save(cluster).await,
            Self::None(store) => store.save(cluster).await,
        }
    }

    async fn destroy(&self) -> Result<(), Error> {
        match self {
            Self::File(store) => store.destroy().await,
            Self::Memory(store) => store.destroy().await,
            Self::None(store) => store.destroy().await,
        }
    }
}

/// [`StateStore`] that never persists anything.
#[derive(Clone, Debug)]
pub struct NoneStateStore {
    cluster_name: String,
}

impl StateStore for NoneStateStore {
    async fn load(&self) -> Result<Cluster, Error> {
        Err(Error::NotFound(self.cluster_name.clone()))
    }

    async fn save(&self, _cluster: &Cluster) -> Result<(), Error> {
        tracing::debug!(cluster = %self.cluster_name, "State persistence disabled, not saving");
        Ok(())
    }

    async fn destroy(&self) -> Result<(), Error> {
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use {
        super::*,
        cirrus_core::{Credentials, Instance},
        std::sync::Arc,
    };

    fn spec(kind: StateStoreKind) -> ClusterSpec {
        let mut spec = ClusterSpec::new("hadoop", Credentials::new("cirrus", "key"));
        spec.state_store = kind;
        spec
    }

    struct Failing;

    impl StateStore for Failing {
        async fn load(&self) -> Result<Cluster, Error> {
            Err(io::Error::other("disk on fire").into())
        }

        async fn save(&self, _: &Cluster) -> Result<(), Error> {
            Ok(())
        }

        async fn destroy(&self) -> Result<(), Error> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn try_load_or_empty_never_fails() {
        assert!(Failing.try_load_or_empty().await.is_empty());

        let store = DefaultFactory::new().create(&spec(StateStoreKind::None));
        assert!(matches!(store.load().await, Err(Error::NotFound(_))));
        assert!(store.try_load_or_empty().await.is_empty());
    }

    #[tokio::test]
    async fn factory_selects_backend() {
        let dir = tempfile::tempdir().unwrap();
        let factory = DefaultFactory::new();

        let mut local = spec(StateStoreKind::Local);
        local.state_store_dir = Some(dir.path().to_path_buf());

        assert!(matches!(factory.create(&local), Store::File(_)));
        assert!(matches!(factory.create(&spec(StateStoreKind::Memory)), Store::Memory(_)));
        assert!(matches!(factory.create(&spec(StateStoreKind::None)), Store::None(_)));
    }

    #[tokio::test]
    async fn memory_stores_of_one_factory_share_records() {
        let factory = DefaultFactory::new();
        let spec = spec(StateStoreKind::Memory);

        let cluster = Cluster::new([Instance::new(
            "i-1",
            ["namenode"],
            Arc::new(Credentials::new("cirrus", "key")),
        )]);

        factory.create(&spec).save(&cluster).await.unwrap();

        assert_eq!(factory.create(&spec).load().await.unwrap(), cluster);
        assert!(factory.memory_records().get("hadoop").is_some());
    }
}
